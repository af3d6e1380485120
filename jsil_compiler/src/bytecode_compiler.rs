//! Direct AST-to-bytecode emission.
//!
//! Every callable body can be compiled here.  The IR pipeline only handles a
//! subset of the language and falls back to this path for everything else.
//!
//! A [`FnBuilder`] emits one method body.  Expressions report what they left
//! on the stack as an [`Emitted`] (the inferred JS type and the concrete
//! representation), so that callers can skip redundant boxing and coercion.

mod calls;
mod expr;
mod operators;
mod stmt;
mod update;

use std::collections::HashMap;
use std::rc::Rc;

use swc_atoms::JsWord;
use swc_common::{SourceMap, Span, Spanned};
use swc_ecma_ast::{BlockStmtOrExpr, Class, Pat, Script};

use crate::bytecode::{ArgIndex, ClrType, Instr, Label, LocalIndex, MethodBody, MethodRef};
use crate::common::Result;
use crate::coordinator::{Callable, CallableNode, EmitEnv};
use crate::runtime::RuntimeFn;
use crate::scope::{Binding, BindingKind, ClassRef, JsType, ScopeId};
use crate::variables::{emit_coerce, FrameShape, ScopesSource, Variable};
use crate::{error, unsupported_node};

pub(crate) use calls::emit_padded_args;
pub(crate) use expr::{compile_expr, compile_expr_discard};
pub(crate) use stmt::compile_stmts;

pub fn parse_file(filename: &str, content: String, source_map: Rc<SourceMap>) -> Result<Script> {
    use swc_common::{
        errors::{emitter::EmitterWriter, Handler},
        FileName,
    };
    use swc_ecma_ast::EsVersion;
    use swc_ecma_parser::{lexer::Lexer, Parser, StringInput, Syntax};

    let err_handler = Handler::with_emitter(
        true,  // can_emit_warnings
        false, // treat_err_as_bug
        Box::new(EmitterWriter::new(
            Box::new(std::io::stderr()),
            Some(source_map.clone()),
            false, // short_message
            true,  // teach
        )),
    );

    let path = std::path::PathBuf::from(filename);
    let source_file = source_map.new_source_file(FileName::Real(path), content);

    let input = StringInput::from(&*source_file);
    let lexer = Lexer::new(Syntax::Es(Default::default()), EsVersion::Es2022, input, None);
    let mut parser = Parser::new_from(lexer);

    let mut first_error = None;
    for e in parser.take_errors() {
        first_error.get_or_insert_with(|| (e.span(), e.kind().msg().to_string()));
        e.into_diagnostic(&err_handler).emit();
    }

    let script = parser.parse_script().map_err(|e| {
        let span = e.span();
        let message = e.kind().msg().to_string();
        e.into_diagnostic(&err_handler).emit();
        error!("parse error: {}", message).with_span(span)
    })?;

    match first_error {
        Some((span, message)) => Err(error!("parse error: {}", message).with_span(span)),
        None => Ok(script),
    }
}

/// Parse a snippet held in memory, under the file name `input.js`.
pub fn parse_script_str(code: &str) -> Result<(Script, Rc<SourceMap>)> {
    let source_map = Rc::new(SourceMap::default());
    let script = parse_file("input.js", code.to_string(), Rc::clone(&source_map))
        .map_err(|err| err.with_source_map(Rc::clone(&source_map)))?;
    Ok((script, source_map))
}

/// What an expression left on the evaluation stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Emitted {
    pub js: JsType,
    pub repr: ClrType,
}

impl Emitted {
    pub fn new(js: JsType, repr: ClrType) -> Self {
        Emitted { js, repr }
    }

    pub fn number() -> Self {
        Emitted::new(JsType::Number, ClrType::Double)
    }

    pub fn boolean() -> Self {
        Emitted::new(JsType::Boolean, ClrType::Boolean)
    }

    pub fn string() -> Self {
        Emitted::new(JsType::String, ClrType::String)
    }

    pub fn unknown() -> Self {
        Emitted::new(JsType::Unknown, ClrType::Object)
    }

    pub fn undefined() -> Self {
        Emitted::new(JsType::Undefined, ClrType::Object)
    }

    pub fn is_number(&self) -> bool {
        self.js == JsType::Number
    }
}

/// An identifier, resolved against the current lexical scope.
pub(crate) enum Resolved<'a> {
    Binding {
        decl: ScopeId,
        binding: &'a Binding,
        var: Variable,
    },
    /// A function declaration, by its own scope.
    Function(ScopeId),
    /// The own name of a named function expression, used inside it.
    SelfName(ScopeId),
    Class(crate::classes::ClassId),
    /// Not declared anywhere in the script.
    Global,
}

struct JumpTargets {
    break_label: Label,
    continue_label: Option<Label>,
    try_depth: u32,
    /// Statement labels naming this target.
    labels: Vec<JsWord>,
    /// A labelled non-loop statement: only `break label` reaches it.
    labeled_only: bool,
}

/// Shared exit of a body whose `return`s happen inside protected regions.
struct ExitPoint {
    label: Label,
    value: Option<LocalIndex>,
}

pub(crate) struct FnBuilder<'a> {
    env: &'a EmitEnv<'a>,
    callable: &'a Callable,
    /// The callable's own frame.
    frame: ScopeId,
    /// Frames from the global one down to `frame`.
    chain: Vec<ScopeId>,
    shape: Option<&'a FrameShape>,
    frame_local: Option<LocalIndex>,
    /// Instances of the block frames currently entered, outermost first.
    /// They extend `chain` at the depths past the callable's own frame.
    block_frames: Vec<(ScopeId, LocalIndex)>,
    /// Current lexical scope.
    scope: ScopeId,
    instrs: Vec<Instr>,
    locals: Vec<ClrType>,
    binding_slots: HashMap<(ScopeId, JsWord), LocalIndex>,
    free_temps: HashMap<ClrType, Vec<LocalIndex>>,
    next_label: u32,
    jumps: Vec<JumpTargets>,
    /// Labels of the statement being compiled, for the loop they name.
    pending_labels: Vec<JsWord>,
    try_depth: u32,
    exit: Option<ExitPoint>,
    too_many_locals: bool,
    /// Instance field initializers still to run, for derived constructors
    /// that have not called `super(...)` yet.
    pending_field_inits: Option<&'a Class>,
}

pub fn compile_callable<'a>(
    env: &'a EmitEnv<'a>,
    callable: &'a Callable,
    node: &CallableNode<'a>,
) -> Result<MethodBody> {
    let mut builder = FnBuilder::new(env, callable)?;
    match node {
        CallableNode::Main(script) => {
            builder.prologue(&[])?;
            stmt::compile_stmts(&mut builder, &script.body)?;
        }
        CallableNode::Function { function, .. }
        | CallableNode::ObjectMethod { function, .. }
        | CallableNode::Method { function, .. } => {
            let params: Vec<&Pat> = function.params.iter().map(|param| &param.pat).collect();
            builder.prologue(&params)?;
            if let Some(body) = &function.body {
                stmt::compile_stmts(&mut builder, &body.stmts)?;
            }
        }
        CallableNode::Arrow(arrow) => {
            let params: Vec<&Pat> = arrow.params.iter().collect();
            builder.prologue(&params)?;
            match arrow.body.as_ref() {
                BlockStmtOrExpr::BlockStmt(block) => stmt::compile_stmts(&mut builder, &block.stmts)?,
                BlockStmtOrExpr::Expr(expr) => {
                    let value = compile_expr(&mut builder, expr)?;
                    builder.to_object(value);
                    builder.emit(Instr::Ret);
                }
            }
        }
        CallableNode::Constructor { class, ctor, .. } => {
            crate::classes::compile_constructor(&mut builder, *class, *ctor)?;
        }
    }
    builder.finish(node.span())
}

impl<'a> FnBuilder<'a> {
    fn new(env: &'a EmitEnv<'a>, callable: &'a Callable) -> Result<Self> {
        let frame = callable.id.scope;
        let layout = env.frames.of_scope(frame)?;
        Ok(FnBuilder {
            env,
            callable,
            frame,
            chain: env.scopes.frame_chain(frame),
            shape: layout.shape.as_ref(),
            frame_local: None,
            block_frames: Vec::new(),
            scope: frame,
            instrs: Vec::new(),
            locals: Vec::new(),
            binding_slots: HashMap::new(),
            free_temps: HashMap::new(),
            next_label: 0,
            jumps: Vec::new(),
            pending_labels: Vec::new(),
            try_depth: 0,
            exit: None,
            too_many_locals: false,
            pending_field_inits: None,
        })
    }

    pub(crate) fn env(&self) -> &'a EmitEnv<'a> {
        self.env
    }

    pub(crate) fn callable(&self) -> &'a Callable {
        self.callable
    }

    pub(crate) fn scope(&self) -> ScopeId {
        self.scope
    }

    /// Depth of the callable's own frame.
    pub(crate) fn own_depth(&self) -> u16 {
        (self.chain.len() - 1) as u16
    }

    /// The frame at `depth` in the current scope chain, entered block frames
    /// included.
    pub(crate) fn chain_frame(&self, depth: u16) -> Option<ScopeId> {
        let depth = depth as usize;
        match self.chain.get(depth) {
            Some(frame) => Some(*frame),
            None => self.block_frames.get(depth - self.chain.len()).map(|(frame, _)| *frame),
        }
    }

    /// The local holding the instance of the frame at `depth`, for the
    /// callable's own frame and the block frames it entered.
    pub(crate) fn frame_instance(&self, depth: u16) -> Option<LocalIndex> {
        let own = self.own_depth();
        if depth == own {
            return self.frame_local;
        }
        let ndx = depth.checked_sub(own + 1)? as usize;
        self.block_frames.get(ndx).map(|(_, local)| *local)
    }

    fn block_frame_local(&self, scope: ScopeId) -> Option<LocalIndex> {
        self.block_frames
            .iter()
            .find(|(frame, _)| *frame == scope)
            .map(|(_, local)| *local)
    }

    pub(crate) fn emit(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    pub(crate) fn out(&mut self) -> &mut Vec<Instr> {
        &mut self.instrs
    }

    pub(crate) fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub(crate) fn place(&mut self, label: Label) {
        self.emit(Instr::Label(label));
    }

    pub(crate) fn call_runtime(&mut self, func: RuntimeFn) {
        self.emit(Instr::Call(MethodRef::Runtime(func)));
    }

    /// Locals past the last `LocalIndex` are reported by `finish`.
    fn new_local(&mut self, ty: ClrType) -> LocalIndex {
        let index = u16::try_from(self.locals.len()).unwrap_or_else(|_| {
            self.too_many_locals = true;
            u16::MAX
        });
        self.locals.push(ty);
        LocalIndex(index)
    }

    /// A scratch local, to be handed back with [`FnBuilder::release`].
    pub(crate) fn temp(&mut self, ty: ClrType) -> LocalIndex {
        match self.free_temps.get_mut(&ty).and_then(Vec::pop) {
            Some(local) => local,
            None => self.new_local(ty),
        }
    }

    pub(crate) fn release(&mut self, ty: ClrType, local: LocalIndex) {
        self.free_temps.entry(ty).or_default().push(local);
    }

    pub(crate) fn set_pending_field_inits(&mut self, class: Option<&'a Class>) {
        self.pending_field_inits = class;
    }

    pub(crate) fn take_pending_field_inits(&mut self) -> Option<&'a Class> {
        self.pending_field_inits.take()
    }

    /// Compile `f` with `span`'s block scope as the current scope.  A block
    /// that is a frame gets a new instance first.
    pub(crate) fn in_block<T>(&mut self, span: Span, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let scope = self
            .env
            .scopes
            .block_scope(span)
            .ok_or_else(|| error!("internal: no block scope").with_span(span))?;

        let instance = match self.block_shape(scope, span)? {
            Some(shape) => {
                let local = self.temp(ClrType::Class(shape.ty));
                self.emit(Instr::Newobj(MethodRef::User(shape.ctor)));
                self.emit(Instr::Stloc(local));
                self.block_frames.push((scope, local));
                Some((shape.ty, local))
            }
            None => None,
        };

        let saved = std::mem::replace(&mut self.scope, scope);
        let res = f(self);
        self.scope = saved;

        if let Some((ty, local)) = instance {
            self.block_frames.pop();
            self.release(ClrType::Class(ty), local);
        }
        res
    }

    fn block_shape(&self, scope: ScopeId, span: Span) -> Result<Option<&'a FrameShape>> {
        if !self.env.scopes.get(scope).is_frame() {
            return Ok(None);
        }
        let layout = self.env.frames.of_scope(scope)?;
        layout
            .shape
            .as_ref()
            .map(Some)
            .ok_or_else(|| error!("internal: block frame without a shape").with_span(span))
    }

    /// Give the entered block frame `scope` a new instance.  With
    /// `copy_fields`, the new instance starts with the old one's values;
    /// closures created so far keep the old instance.
    pub(crate) fn renew_block_frame(&mut self, scope: ScopeId, copy_fields: bool, span: Span) -> Result<()> {
        let Some(shape) = self.block_shape(scope, span)? else {
            return Ok(());
        };
        let local = self
            .block_frame_local(scope)
            .ok_or_else(|| error!("internal: block frame renewed outside of its block").with_span(span))?;
        self.emit(Instr::Newobj(MethodRef::User(shape.ctor)));
        if copy_fields {
            for field in shape.all_fields() {
                self.emit(Instr::Dup);
                self.emit(Instr::Ldloc(local));
                self.emit(Instr::Ldfld(field));
                self.emit(Instr::Stfld(field));
            }
        }
        self.emit(Instr::Stloc(local));
        Ok(())
    }

    //
    // Coercions of the value on top of the stack
    //

    pub(crate) fn to_object(&mut self, value: Emitted) -> Emitted {
        emit_coerce(&mut self.instrs, value.repr, ClrType::Object);
        Emitted::new(value.js, ClrType::Object)
    }

    pub(crate) fn to_double(&mut self, value: Emitted) -> Emitted {
        emit_coerce(&mut self.instrs, value.repr, ClrType::Double);
        Emitted::number()
    }

    /// JS truthiness, as an int32 boolean.
    pub(crate) fn to_bool(&mut self, value: Emitted) -> Emitted {
        match value.repr {
            ClrType::Boolean => {}
            ClrType::Double => {
                // x != 0 && x == x
                let t = self.temp(ClrType::Double);
                self.emit(Instr::Stloc(t));
                self.emit(Instr::Ldloc(t));
                self.emit(Instr::LdcR8(0.0));
                self.emit(Instr::Ceq);
                self.emit(Instr::LdcI4(0));
                self.emit(Instr::Ceq);
                self.emit(Instr::Ldloc(t));
                self.emit(Instr::Ldloc(t));
                self.emit(Instr::Ceq);
                self.emit(Instr::And);
                self.release(ClrType::Double, t);
            }
            _ => self.call_runtime(RuntimeFn::ToBoolean),
        }
        Emitted::boolean()
    }

    /// Convert to the storage type of a slot or field.
    pub(crate) fn to_storage(&mut self, value: Emitted, storage: ClrType) -> Emitted {
        match storage {
            ClrType::Double => self.to_double(value),
            ClrType::Boolean => self.to_bool(value),
            _ => self.to_object(value),
        }
    }

    //
    // Name resolution
    //

    pub(crate) fn resolve(&mut self, name: &JsWord, span: Span) -> Result<Resolved<'a>> {
        let scopes = self.env.scopes;
        let Some((decl, binding)) = scopes.resolve(self.scope, name) else {
            return Ok(Resolved::Global);
        };
        match binding.kind {
            BindingKind::Function => {
                if scopes.is_self_name(decl, name) {
                    return Ok(Resolved::SelfName(decl));
                }
                self.env
                    .callables
                    .function_binding(decl, name)
                    .map(Resolved::Function)
                    .ok_or_else(|| error!("internal: function {} was not declared", name).with_span(span))
            }
            BindingKind::Class => {
                let class_ref = ClassRef {
                    decl,
                    name: name.clone(),
                };
                self.env
                    .classes
                    .by_ref(&class_ref)
                    .map(Resolved::Class)
                    .ok_or_else(|| unsupported_node!("class expression", span))
            }
            BindingKind::Var | BindingKind::Let | BindingKind::Const | BindingKind::Param => {
                let var = self.variable(decl, binding, span)?;
                Ok(Resolved::Binding { decl, binding, var })
            }
        }
    }

    /// Storage of a binding declared in scope `decl`.
    pub(crate) fn variable(&mut self, decl: ScopeId, binding: &Binding, span: Span) -> Result<Variable> {
        let scopes = self.env.scopes;
        let frame = scopes.frame_of(decl);
        let storage = binding.storage_type();

        if binding.is_captured {
            if let Some(local) = self.block_frame_local(frame) {
                let field = self
                    .env
                    .frames
                    .of_scope(frame)?
                    .shape
                    .as_ref()
                    .and_then(|shape| shape.field(decl, &binding.name))
                    .ok_or_else(|| error!("internal: no field for captured {}", binding.name).with_span(span))?;
                return Ok(Variable::Field {
                    frame: local,
                    field,
                    storage,
                });
            }

            let layout = self.env.frames.of_scope(frame)?;
            let shape = layout
                .shape
                .as_ref()
                .ok_or_else(|| error!("internal: frame of captured {} has no shape", binding.name).with_span(span))?;
            let field = shape
                .field(decl, &binding.name)
                .ok_or_else(|| error!("internal: no field for captured {}", binding.name).with_span(span))?;

            if frame == self.frame {
                let frame_local = self
                    .frame_local
                    .ok_or_else(|| error!("internal: frame instance used before creation").with_span(span))?;
                return Ok(Variable::Field {
                    frame: frame_local,
                    field,
                    storage,
                });
            }
            if self.callable.scopes == ScopesSource::None || self.chain_frame(layout.depth) != Some(frame) {
                return Err(error!("internal: {} is not reachable from {}", binding.name, self.callable.id).with_span(span));
            }
            return Ok(Variable::ScopeChain {
                scopes: self.callable.scopes,
                parent_index: layout.depth,
                shape: shape.ty,
                field,
                storage,
            });
        }

        if scopes.function_of(decl) != self.frame {
            return Err(error!("internal: {} is used from another frame but not captured", binding.name).with_span(span));
        }

        if binding.kind == BindingKind::Param {
            let index = binding
                .param_index
                .ok_or_else(|| error!("internal: parameter {} has no position", binding.name).with_span(span))?;
            return Ok(Variable::Parameter {
                arg: ArgIndex(self.callable.first_param + index),
            });
        }

        let key = (decl, binding.name.clone());
        let slot = match self.binding_slots.get(&key) {
            Some(slot) => *slot,
            None => {
                let slot = self.new_local(storage);
                self.binding_slots.insert(key, slot);
                slot
            }
        };
        Ok(Variable::Local { slot, storage })
    }

    /// Store the value on top of the stack into `var`.
    pub(crate) fn store_from_stack(&mut self, var: Variable, value: Emitted) {
        let value = self.to_storage(value, var.storage());
        if var.is_field() {
            let t = self.temp(value.repr);
            self.emit(Instr::Stloc(t));
            var.emit_instance(&mut self.instrs);
            self.emit(Instr::Ldloc(t));
            var.emit_store(&mut self.instrs);
            self.release(value.repr, t);
        } else {
            var.emit_store(&mut self.instrs);
        }
    }

    //
    // Prologue and epilogue
    //

    /// Create the frame instance and bind the parameters.
    pub(crate) fn prologue(&mut self, params: &[&Pat]) -> Result<()> {
        if let Some(shape) = self.shape {
            let local = self.new_local(ClrType::Class(shape.ty));
            self.emit(Instr::Newobj(MethodRef::User(shape.ctor)));
            self.emit(Instr::Stloc(local));
            self.frame_local = Some(local);
        }

        for (ndx, pat) in params.iter().enumerate() {
            let (ident, default) = match pat {
                Pat::Ident(ident) => (&ident.id, None),
                Pat::Assign(assign) => match assign.left.as_ref() {
                    Pat::Ident(ident) => (&ident.id, Some(&assign.right)),
                    other => return Err(unsupported_node!("destructuring parameter", other.span())),
                },
                other => return Err(unsupported_node!("destructuring parameter", other.span())),
            };
            let arg = ArgIndex(self.callable.first_param + ndx as u16);

            if let Some(default) = default {
                let skip = self.new_label();
                self.emit(Instr::Ldarg(arg));
                self.emit(Instr::Ldnull);
                self.emit(Instr::Ceq);
                self.emit(Instr::Brfalse(skip));
                let value = compile_expr(self, default)?;
                self.to_object(value);
                self.emit(Instr::Starg(arg));
                self.place(skip);
            }

            let scopes = self.env.scopes;
            let Some((decl, binding)) = scopes.resolve(self.scope, &ident.sym) else {
                return Err(error!("internal: parameter {} not declared", ident.sym).with_span(ident.span));
            };
            if binding.is_captured {
                let var = self.variable(decl, binding, ident.span)?;
                var.emit_instance(&mut self.instrs);
                self.emit(Instr::Ldarg(arg));
                emit_coerce(&mut self.instrs, ClrType::Object, var.storage());
                var.emit_store(&mut self.instrs);
            }
        }
        Ok(())
    }

    /// Return from the body, with the value on top of the stack when the
    /// callable returns one.
    pub(crate) fn emit_return(&mut self, has_value: bool) {
        if self.try_depth == 0 {
            self.emit(Instr::Ret);
            return;
        }
        let exit = match &self.exit {
            Some(exit) => (exit.label, exit.value),
            None => {
                let label = self.new_label();
                let value = if has_value {
                    Some(self.new_local(ClrType::Object))
                } else {
                    None
                };
                self.exit = Some(ExitPoint { label, value });
                (label, value)
            }
        };
        if let Some(local) = exit.1 {
            self.emit(Instr::Stloc(local));
        }
        self.emit(Instr::Leave(exit.0));
    }

    fn finish(mut self, span: Span) -> Result<MethodBody> {
        if self.too_many_locals {
            return Err(error!("{} needs more than 65536 locals", self.callable.id).with_span(span));
        }
        if self.callable.returns_value {
            self.emit(Instr::Ldnull);
        }
        self.emit(Instr::Ret);

        if let Some(exit) = self.exit.take() {
            self.place(exit.label);
            if let Some(local) = exit.value {
                self.emit(Instr::Ldloc(local));
            }
            self.emit(Instr::Ret);
        }

        Ok(MethodBody {
            instrs: self.instrs,
            locals: self.locals,
        })
    }

    //
    // Jumps
    //

    /// Targets of a loop or `switch`.  A loop takes the labels naming it.
    pub(crate) fn push_jump_targets(&mut self, break_label: Label, continue_label: Option<Label>) {
        let labels = std::mem::take(&mut self.pending_labels);
        self.jumps.push(JumpTargets {
            break_label,
            continue_label,
            try_depth: self.try_depth,
            labels,
            labeled_only: false,
        });
    }

    /// Targets of a labelled statement that is not a loop.
    pub(crate) fn push_labeled_target(&mut self, end: Label) {
        let labels = std::mem::take(&mut self.pending_labels);
        self.jumps.push(JumpTargets {
            break_label: end,
            continue_label: None,
            try_depth: self.try_depth,
            labels,
            labeled_only: true,
        });
    }

    pub(crate) fn pop_jump_targets(&mut self) {
        self.jumps.pop();
    }

    /// Name the next loop (or labelled block) with `label`.
    pub(crate) fn add_pending_label(&mut self, label: JsWord) {
        self.pending_labels.push(label);
    }

    pub(crate) fn clear_pending_labels(&mut self) {
        self.pending_labels.clear();
    }

    /// Jump to the `break` (or `continue`) target named by `label`, or to
    /// the innermost loop or `switch`, leaving any protected region in
    /// between.
    pub(crate) fn emit_jump(&mut self, is_continue: bool, label: Option<&JsWord>, span: Span) -> Result<()> {
        let targets = match label {
            Some(label) => self
                .jumps
                .iter()
                .rev()
                .find(|targets| targets.labels.contains(label))
                .ok_or_else(|| error!("undefined label {}", label).with_span(span))?,
            None => self
                .jumps
                .iter()
                .rev()
                .filter(|targets| !targets.labeled_only)
                .find(|targets| !is_continue || targets.continue_label.is_some())
                .ok_or_else(|| unsupported_node!("break or continue outside of a loop", span))?,
        };
        let dest = if is_continue {
            targets
                .continue_label
                .ok_or_else(|| error!("continue to a label that does not name a loop").with_span(span))?
        } else {
            targets.break_label
        };
        if self.try_depth > targets.try_depth {
            self.emit(Instr::Leave(dest));
        } else {
            self.emit(Instr::Br(dest));
        }
        Ok(())
    }

    pub(crate) fn enter_try(&mut self) {
        self.try_depth += 1;
    }

    pub(crate) fn exit_try(&mut self) {
        self.try_depth -= 1;
    }
}
