//! Two-phase compilation driver.
//!
//! Phase 1 (declare) walks every callable of the script (top-level code,
//! functions, arrows, object literal methods, constructors, class methods),
//! and reserves a method handle
//! and signature for each, along with the types owning them.  It returns an
//! immutable [`CallableIndex`].  Phase 2 (emit) compiles each body against
//! that index, so forward, mutual and recursive references all resolve to
//! handles that already exist.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use swc_atoms::JsWord;
use swc_common::{SourceMap, Span};
use swc_ecma_ast::{ArrowExpr, BlockStmtOrExpr, Class, ClassDecl, ClassMember, Constructor, Expr, Function, Script, Stmt};

use crate::bytecode::{
    ArgIndex, Assembly, ClrType, MethodBody, MethodDecl, MethodHandle, MethodSig, TypeDecl, TypeHandle, TypeKind,
    Visibility,
};
use crate::classes::{param_count, ClassId, ClassRegistry};
use crate::common::{Context, Result};
use crate::ir::{self, IrMetrics};
use crate::scope::{builder::build_scope_tree, ScopeId, ScopeKind, ScopeTree};
use crate::variables::{FrameLayouts, ScopesSource};
use crate::{bytecode_compiler, error, tracing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileFlags {
    /// Try the IR pipeline before the direct emitter.
    pub ir_pipeline: bool,
    /// Let the IR code generator keep intrinsic call arguments on the stack.
    pub peephole: bool,
    /// Record IR attempts and fallback reasons.
    pub collect_metrics: bool,
}

impl Default for CompileFlags {
    fn default() -> Self {
        CompileFlags {
            ir_pipeline: true,
            peephole: true,
            collect_metrics: false,
        }
    }
}

impl CompileFlags {
    /// Defaults, overridden by `JSIL_IR_PIPELINE`, `JSIL_PEEPHOLE` and
    /// `JSIL_IR_METRICS` (`0` or `1`).
    pub fn from_env() -> Self {
        let mut flags = CompileFlags::default();
        let var = |name: &str| std::env::var(name).ok().map(|value| value.trim() != "0");
        if let Some(value) = var("JSIL_IR_PIPELINE") {
            flags.ir_pipeline = value;
        }
        if let Some(value) = var("JSIL_PEEPHOLE") {
            flags.peephole = value;
        }
        if let Some(value) = var("JSIL_IR_METRICS") {
            flags.collect_metrics = value;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamCount {
    /// Parameters before the first one with a default value.
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::IntoStaticStr, strum::EnumIter)]
pub enum CallableKind {
    Main,
    Function,
    Arrow,
    /// A method of an object literal; receives `this` after the scope array.
    ObjectMethod,
    ClassMethod,
    Constructor,
}

impl CallableKind {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// Stable identity of a callable, assigned in phase 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallableId {
    pub kind: CallableKind,
    /// The callable's Function scope (the global scope for `Main`).
    pub scope: ScopeId,
    pub name: String,
    pub line: usize,
    pub col: usize,
}

impl std::fmt::Display for CallableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({}:{})", self.kind.name(), self.name, self.line, self.col)
    }
}

#[derive(Debug, Clone)]
pub struct Callable {
    pub id: CallableId,
    pub method: MethodHandle,
    pub owner: TypeHandle,
    pub params: ParamCount,
    /// Where the body finds its ancestors' frames.
    pub scopes: ScopesSource,
    /// Argument index of the first JS parameter.
    pub first_param: u16,
    /// For constructors and methods.
    pub class: Option<ClassId>,
    pub is_static: bool,
    /// `false` for void methods (top-level code and constructors).
    pub returns_value: bool,
}

impl Callable {
    pub fn kind(&self) -> CallableKind {
        self.id.kind
    }

    /// `this` is the instance of `class`.
    pub fn this_class(&self) -> Option<ClassId> {
        match self.id.kind {
            CallableKind::ClassMethod | CallableKind::Constructor if !self.is_static => self.class,
            _ => None,
        }
    }
}

/// Every callable of the compilation unit, keyed by its Function scope.
/// Built by phase 1 and only read afterwards.
#[derive(Debug, Default)]
pub struct CallableIndex {
    callables: Vec<Callable>,
    by_scope: HashMap<ScopeId, usize>,
    /// `(scope declaring the function binding, name)` to the function's own
    /// scope.  Also maps the own name of named function expressions.
    functions: HashMap<(ScopeId, JsWord), ScopeId>,
}

impl CallableIndex {
    pub fn get(&self, scope: ScopeId) -> Result<&Callable> {
        self.by_scope
            .get(&scope)
            .map(|ndx| &self.callables[*ndx])
            .ok_or_else(|| error!("internal: no callable declared for scope {:?}", scope))
    }

    pub fn function_binding(&self, decl: ScopeId, name: &JsWord) -> Option<ScopeId> {
        self.functions.get(&(decl, name.clone())).copied()
    }

    pub fn iter(&self) -> impl '_ + Iterator<Item = &Callable> {
        self.callables.iter()
    }

    pub fn len(&self) -> usize {
        self.callables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callables.is_empty()
    }

    fn insert(&mut self, callable: Callable) -> Result<()> {
        let scope = callable.id.scope;
        if self.by_scope.contains_key(&scope) {
            return Err(error!("internal: callable {} declared twice", callable.id));
        }
        self.by_scope.insert(scope, self.callables.len());
        self.callables.push(callable);
        Ok(())
    }
}

/// An AST node compiled into one method body.
#[derive(Clone)]
pub enum CallableNode<'a> {
    Main(&'a Script),
    Function {
        name: &'a JsWord,
        function: &'a Function,
        /// A function declaration (as opposed to an expression).
        is_decl: bool,
    },
    Arrow(&'a ArrowExpr),
    ObjectMethod {
        name: String,
        function: &'a Function,
    },
    Method {
        class: &'a Class,
        name: String,
        function: &'a Function,
        is_static: bool,
    },
    Constructor {
        class: &'a Class,
        class_name: &'a JsWord,
        ctor: Option<&'a Constructor>,
    },
}

impl<'a> CallableNode<'a> {
    pub fn span(&self) -> Span {
        match self {
            CallableNode::Main(script) => script.span,
            CallableNode::Function { function, .. }
            | CallableNode::ObjectMethod { function, .. }
            | CallableNode::Method { function, .. } => function.span,
            CallableNode::Arrow(arrow) => arrow.span,
            CallableNode::Constructor { class, ctor, .. } => ctor.map(|ctor| ctor.span).unwrap_or(class.span),
        }
    }

    fn scope(&self, scopes: &ScopeTree) -> Result<ScopeId> {
        match self {
            CallableNode::Main(_) => Ok(scopes.root()),
            _ => scopes
                .function_scope(self.span())
                .ok_or_else(|| error!("internal: no scope for callable").with_span(self.span())),
        }
    }
}

/// Everything phase 2 reads.  Nothing in it changes while bodies are
/// emitted.
pub struct EmitEnv<'a> {
    pub flags: CompileFlags,
    pub scopes: &'a ScopeTree,
    pub frames: &'a FrameLayouts,
    pub classes: &'a ClassRegistry,
    pub callables: &'a CallableIndex,
}

/// The state of one compilation, threaded through both phases.
pub struct CompilationContext {
    pub flags: CompileFlags,
    pub source_map: Rc<SourceMap>,
    pub scopes: ScopeTree,
    pub assembly: Assembly,
    pub frames: FrameLayouts,
    pub classes: ClassRegistry,
    pub metrics: Option<IrMetrics>,
}

pub struct CompiledAssembly {
    pub assembly: Assembly,
    pub callables: CallableIndex,
    pub metrics: Option<IrMetrics>,
    pub source_map: Rc<SourceMap>,
}

/// Compile the given script.
///
/// `filename` is only used for error messages and the assembly name.
pub fn compile_file(filename: &str, content: String, flags: CompileFlags) -> Result<CompiledAssembly> {
    let source_map: Rc<SourceMap> = Default::default();
    let script = bytecode_compiler::parse_file(filename, content, Rc::clone(&source_map))
        .with_context(error!("while parsing file: {}", filename))?;

    compile_script(filename, &script, Rc::clone(&source_map), flags)
        .map_err(|err| err.with_source_map(Rc::clone(&source_map)))
        .with_context(error!("while compiling file: {}", filename))
}

/// [`compile_file`] for an anonymous script.
pub fn compile_str(code: &str, flags: CompileFlags) -> Result<CompiledAssembly> {
    compile_file("<input>", code.to_string(), flags)
}

impl CompilationContext {
    fn new(filename: &str, script: &Script, source_map: Rc<SourceMap>, flags: CompileFlags) -> Result<Self> {
        let scopes = build_scope_tree(script)?;
        let assembly_name = std::path::Path::new(filename)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("script");

        Ok(CompilationContext {
            flags,
            source_map,
            scopes,
            assembly: Assembly::new(assembly_name),
            frames: FrameLayouts::default(),
            classes: ClassRegistry::default(),
            metrics: if flags.collect_metrics {
                Some(IrMetrics::default())
            } else {
                None
            },
        })
    }

    #[cfg(test)]
    fn env<'a>(&'a self, callables: &'a CallableIndex) -> EmitEnv<'a> {
        EmitEnv {
            flags: self.flags,
            scopes: &self.scopes,
            frames: &self.frames,
            classes: &self.classes,
            callables,
        }
    }
}

fn compile_script(
    filename: &str,
    script: &Script,
    source_map: Rc<SourceMap>,
    flags: CompileFlags,
) -> Result<CompiledAssembly> {
    let mut ctx = CompilationContext::new(filename, script, source_map, flags)?;

    let nodes = collect_callables(script)?;
    let callables = declare(&mut ctx, script, &nodes)?;
    emit(&mut ctx, &callables, &nodes)?;

    let missing = ctx.assembly.missing_bodies();
    if let Some(first) = missing.first() {
        return Err(error!(
            "internal: {} method(s) without a body, first: {}",
            missing.len(),
            ctx.assembly.method(*first).name
        ));
    }

    Ok(CompiledAssembly {
        assembly: ctx.assembly,
        callables,
        metrics: ctx.metrics,
        source_map: ctx.source_map,
    })
}

//
// Phase 1
//

fn declare(ctx: &mut CompilationContext, script: &Script, nodes: &[CallableNode<'_>]) -> Result<CallableIndex> {
    let section = tracing::section("declare");

    ctx.frames = FrameLayouts::declare(&ctx.scopes, &mut ctx.assembly)?;

    let mut index = CallableIndex::default();
    // Owner type of each frame's callable, for nesting declared types.
    let mut owners: HashMap<ScopeId, TypeHandle> = HashMap::new();
    let mut used_names: HashSet<String> = HashSet::new();

    for node in nodes {
        let scope = node.scope(&ctx.scopes)?;
        let (kind, js_name, params, param_names) = match node {
            CallableNode::Main(_) => (CallableKind::Main, "main".to_string(), ParamCount { min: 0, max: 0 }, Vec::new()),
            CallableNode::Function { name, function, .. } => {
                let (params, names) = param_count(function.params.iter().map(|p| &p.pat));
                (CallableKind::Function, name.to_string(), params, names)
            }
            CallableNode::Arrow(arrow) => {
                let (params, names) = param_count(arrow.params.iter());
                (CallableKind::Arrow, "arrow".to_string(), params, names)
            }
            CallableNode::ObjectMethod { name, function } => {
                let (params, names) = param_count(function.params.iter().map(|p| &p.pat));
                (CallableKind::ObjectMethod, name.clone(), params, names)
            }
            CallableNode::Method { .. } | CallableNode::Constructor { .. } => continue,
        };

        let (line, col) = location(&ctx.source_map, node.span());
        let id = CallableId {
            kind,
            scope,
            name: js_name.clone(),
            line,
            col,
        };
        let parent_function = ctx.scopes.get(scope).parent.map(|parent| ctx.scopes.function_of(parent));
        let nested_in = parent_function.and_then(|function| owners.get(&function).copied());

        let callable = match kind {
            CallableKind::Main => {
                let method = ctx.assembly.reserve_method(MethodDecl {
                    name: "Main".to_string(),
                    sig: MethodSig {
                        params: Vec::new(),
                        ret: None,
                        has_this: false,
                    },
                    param_names: Vec::new(),
                    is_static: true,
                    is_ctor: false,
                    visibility: Visibility::Public,
                });
                let owner = ctx.assembly.declare_type(TypeDecl {
                    name: "Program".to_string(),
                    kind: TypeKind::Module,
                    base: None,
                    nested_in: None,
                    first_method: Some(method),
                })?;
                ctx.assembly.set_entry_point(method);
                Callable {
                    id,
                    method,
                    owner,
                    params,
                    scopes: ScopesSource::None,
                    first_param: 0,
                    class: None,
                    is_static: true,
                    returns_value: false,
                }
            }
            _ => {
                let mut sig_params = vec![ClrType::ObjectArray];
                let mut names = vec!["scopes".to_string()];
                if kind == CallableKind::ObjectMethod {
                    sig_params.push(ClrType::Object);
                    names.push("this".to_string());
                }
                let first_param = names.len() as u16;
                for name in param_names {
                    sig_params.push(ClrType::Object);
                    names.push(name);
                }
                let method = ctx.assembly.reserve_method(MethodDecl {
                    name: "__js_call__".to_string(),
                    sig: MethodSig {
                        params: sig_params,
                        ret: Some(ClrType::Object),
                        has_this: false,
                    },
                    param_names: names,
                    is_static: true,
                    is_ctor: false,
                    visibility: Visibility::Public,
                });

                let mut type_name = match kind {
                    CallableKind::Arrow => format!("Arrows.{}.L{}C{}", qualified_owner(&ctx.scopes, scope), line, col),
                    CallableKind::ObjectMethod => format!("ObjectMethods.{}", qualified_owner(&ctx.scopes, scope)),
                    _ => format!("Functions.{}", qualified_owner(&ctx.scopes, scope)),
                };
                if !used_names.insert(type_name.clone()) {
                    type_name = format!("{}.L{}C{}", type_name, line, col);
                    used_names.insert(type_name.clone());
                }
                let owner = ctx.assembly.declare_type(TypeDecl {
                    name: type_name,
                    kind: if kind == CallableKind::Arrow {
                        TypeKind::ArrowOwner
                    } else {
                        TypeKind::FunctionOwner
                    },
                    base: None,
                    nested_in,
                    first_method: Some(method),
                })?;

                Callable {
                    id,
                    method,
                    owner,
                    params,
                    scopes: ScopesSource::Arg(ArgIndex(0)),
                    first_param,
                    class: None,
                    is_static: true,
                    returns_value: true,
                }
            }
        };

        if let CallableNode::Function { name, function, is_decl } = node {
            if *is_decl {
                // The binding lives in the scope enclosing the function.
                let decl = ctx
                    .scopes
                    .get(scope)
                    .parent
                    .and_then(|parent| ctx.scopes.resolve(parent, name))
                    .map(|(decl, _)| decl)
                    .ok_or_else(|| error!("internal: unresolved function {}", name).with_span(function.span))?;
                index.functions.insert((decl, (*name).clone()), scope);
            } else if ctx.scopes.get(scope).self_name.as_ref() == Some(*name) {
                index.functions.insert((scope, (*name).clone()), scope);
            }
        }

        section.log("callable", &callable.id.to_string());
        owners.insert(scope, callable.owner);
        index.insert(callable)?;
    }

    let class_decls: Vec<&ClassDecl> = nodes
        .iter()
        .filter_map(|node| match node {
            CallableNode::Constructor { class, .. } => Some(*class),
            _ => None,
        })
        .filter_map(|class| find_class_decl(nodes, class))
        .collect();
    let scopes = &ctx.scopes;
    let nested_in = |frame: ScopeId| owners.get(&frame).copied();
    ctx.classes = ClassRegistry::declare(scopes, &mut ctx.assembly, script, &class_decls, &nested_in)?;

    for node in nodes {
        let (kind, js_name, span) = match node {
            CallableNode::Method { name, function, .. } => (CallableKind::ClassMethod, name.clone(), function.span),
            CallableNode::Constructor { class_name, .. } => {
                (CallableKind::Constructor, format!("{}.constructor", class_name), node.span())
            }
            _ => continue,
        };
        let scope = node.scope(&ctx.scopes)?;
        let class_span = match node {
            CallableNode::Method { class, .. } | CallableNode::Constructor { class, .. } => class.span,
            _ => continue,
        };
        let class_scope = ctx
            .scopes
            .class_scope(class_span)
            .ok_or_else(|| error!("internal: no class scope").with_span(class_span))?;
        let (class_id, entry) = ctx
            .classes
            .iter()
            .find(|(_, entry)| entry.scope == class_scope)
            .ok_or_else(|| error!("internal: class not registered").with_span(class_span))?;

        let (line, col) = location(&ctx.source_map, span);
        let id = CallableId {
            kind,
            scope,
            name: js_name.clone(),
            line,
            col,
        };
        let callable = match node {
            CallableNode::Constructor { .. } => Callable {
                id,
                method: entry.ctor,
                owner: entry.ty,
                params: entry.ctor_params,
                scopes: if entry.needs_scopes {
                    ScopesSource::Arg(ArgIndex(1))
                } else {
                    ScopesSource::None
                },
                first_param: entry.ctor_first_param(),
                class: Some(class_id),
                is_static: false,
                returns_value: false,
            },
            CallableNode::Method { name, is_static, .. } => {
                let (_, method) = entry
                    .own_methods()
                    .find(|(method_name, _)| *method_name == name)
                    .ok_or_else(|| error!("internal: method {} not registered", name).with_span(span))?;
                let (scopes, first_param) = match (*is_static, entry.needs_scopes, entry.scopes_field) {
                    (true, true, _) => (ScopesSource::Arg(ArgIndex(0)), 1),
                    (true, false, _) => (ScopesSource::None, 0),
                    (false, true, Some(field)) => (ScopesSource::ThisField(field), 1),
                    (false, _, _) => (ScopesSource::None, 1),
                };
                Callable {
                    id,
                    method: method.handle,
                    owner: entry.ty,
                    params: method.params,
                    scopes,
                    first_param,
                    class: Some(class_id),
                    is_static: *is_static,
                    returns_value: true,
                }
            }
            _ => continue,
        };
        section.log("callable", &callable.id.to_string());
        index.insert(callable)?;
    }

    Ok(index)
}

fn find_class_decl<'a>(nodes: &[CallableNode<'a>], class: &'a Class) -> Option<&'a ClassDecl> {
    nodes.iter().find_map(|node| match node {
        CallableNode::Main(script) => find_class_decl_in(&script.body, class),
        CallableNode::Function { function, .. }
        | CallableNode::ObjectMethod { function, .. }
        | CallableNode::Method { function, .. } => function
            .body
            .as_ref()
            .and_then(|body| find_class_decl_in(&body.stmts, class)),
        CallableNode::Arrow(arrow) => match arrow.body.as_ref() {
            BlockStmtOrExpr::BlockStmt(body) => find_class_decl_in(&body.stmts, class),
            BlockStmtOrExpr::Expr(_) => None,
        },
        CallableNode::Constructor { ctor, .. } => ctor
            .and_then(|ctor| ctor.body.as_ref())
            .and_then(|body| find_class_decl_in(&body.stmts, class)),
    })
}

fn find_class_decl_in<'a>(stmts: &'a [Stmt], class: &Class) -> Option<&'a ClassDecl> {
    let mut found = None;
    for_each_nested_stmt(stmts, &mut |stmt| {
        if let Stmt::Decl(swc_ecma_ast::Decl::Class(decl)) = stmt {
            if std::ptr::eq(decl.class.as_ref(), class) {
                found = Some(decl);
            }
        }
    });
    found
}

/// Visit statements, entering nested statement bodies but not functions.
fn for_each_nested_stmt<'a>(stmts: &'a [Stmt], f: &mut dyn FnMut(&'a Stmt)) {
    for stmt in stmts {
        f(stmt);
        match stmt {
            Stmt::Block(block) => for_each_nested_stmt(&block.stmts, f),
            Stmt::If(if_stmt) => {
                for_each_nested_stmt(std::slice::from_ref(&*if_stmt.cons), f);
                if let Some(alt) = &if_stmt.alt {
                    for_each_nested_stmt(std::slice::from_ref(&**alt), f);
                }
            }
            Stmt::While(stmt) => for_each_nested_stmt(std::slice::from_ref(&*stmt.body), f),
            Stmt::DoWhile(stmt) => for_each_nested_stmt(std::slice::from_ref(&*stmt.body), f),
            Stmt::For(stmt) => for_each_nested_stmt(std::slice::from_ref(&*stmt.body), f),
            Stmt::ForOf(stmt) => for_each_nested_stmt(std::slice::from_ref(&*stmt.body), f),
            Stmt::ForIn(stmt) => for_each_nested_stmt(std::slice::from_ref(&*stmt.body), f),
            Stmt::Labeled(stmt) => for_each_nested_stmt(std::slice::from_ref(&*stmt.body), f),
            Stmt::Switch(switch) => {
                for case in &switch.cases {
                    for_each_nested_stmt(&case.cons, f);
                }
            }
            Stmt::Try(try_stmt) => {
                for_each_nested_stmt(&try_stmt.block.stmts, f);
                if let Some(handler) = &try_stmt.handler {
                    for_each_nested_stmt(&handler.body.stmts, f);
                }
                if let Some(finalizer) = &try_stmt.finalizer {
                    for_each_nested_stmt(&finalizer.stmts, f);
                }
            }
            _ => {}
        }
    }
}

/// `outer.inner` for the function scope `scope`.
fn qualified_owner(scopes: &ScopeTree, scope: ScopeId) -> String {
    let mut names: Vec<_> = scopes
        .ancestors(scope)
        .filter(|id| scopes.get(*id).kind == ScopeKind::Function)
        .map(|id| scopes.get(id).name.as_str())
        .collect();
    names.reverse();
    names.join(".")
}

fn location(source_map: &SourceMap, span: Span) -> (usize, usize) {
    if span.is_dummy() {
        return (0, 0);
    }
    let loc = source_map.lookup_char_pos(span.lo);
    (loc.line, loc.col_display + 1)
}

//
// Phase 2
//

fn emit(ctx: &mut CompilationContext, index: &CallableIndex, nodes: &[CallableNode<'_>]) -> Result<()> {
    let _section = tracing::section("emit");

    // Field-wise borrows: `ctx.metrics` is written while `env` is alive.
    let env = EmitEnv {
        flags: ctx.flags,
        scopes: &ctx.scopes,
        frames: &ctx.frames,
        classes: &ctx.classes,
        callables: index,
    };

    let mut bodies = Vec::with_capacity(nodes.len());
    for node in nodes {
        let scope = node.scope(env.scopes)?;
        let callable = index.get(scope)?;
        let section = tracing::section(&callable.id.to_string());
        let body = emit_callable(&env, callable, node, ctx.metrics.as_mut(), &section)
            .with_context(error!("while compiling {}", callable.id).with_span(node.span()))?;
        section.log_value("body", &body.instrs);
        bodies.push((callable.method, body));
    }

    for (method, body) in bodies {
        ctx.assembly.define_body(method, body)?;
    }
    Ok(())
}

fn emit_callable(
    env: &EmitEnv<'_>,
    callable: &Callable,
    node: &CallableNode<'_>,
    metrics: Option<&mut IrMetrics>,
    section: &tracing::Section,
) -> Result<MethodBody> {
    if env.flags.ir_pipeline {
        let kind = callable.kind();
        let attempt = ir::compile_ir(env, callable, node);
        match attempt {
            Ok(body) => {
                if let Some(metrics) = metrics {
                    metrics.record_success(kind);
                }
                section.log("path", "ir");
                return Ok(body);
            }
            Err(err) => {
                if let Some(metrics) = metrics {
                    metrics.record_failure(kind, &callable.id.to_string(), &err.reason);
                }
                section.log("ir fallback", &err.reason);
            }
        }
    }
    section.log("path", "direct");
    bytecode_compiler::compile_callable(env, callable, node)
}

/// Run phase 1 on `code`, then hand every callable to `visit` instead of
/// emitting it.
#[cfg(test)]
pub(crate) fn compile_with(
    code: &str,
    flags: CompileFlags,
    mut visit: impl FnMut(&EmitEnv<'_>, &Callable, &CallableNode<'_>),
) -> Result<()> {
    let source_map: Rc<SourceMap> = Default::default();
    let script = bytecode_compiler::parse_file("<input>", code.to_string(), Rc::clone(&source_map))?;
    let mut ctx = CompilationContext::new("<input>", &script, source_map, flags)?;
    let nodes = collect_callables(&script)?;
    let callables = declare(&mut ctx, &script, &nodes)?;
    let env = ctx.env(&callables);
    for node in &nodes {
        let callable = callables.get(node.scope(env.scopes)?)?;
        visit(&env, callable, node);
    }
    Ok(())
}

//
// Callable discovery
//

/// All callables of the script, parents before children.
pub fn collect_callables(script: &Script) -> Result<Vec<CallableNode<'_>>> {
    let mut collector = Collector { nodes: Vec::new() };
    collector.nodes.push(CallableNode::Main(script));
    collector.stmts(&script.body)?;
    Ok(collector.nodes)
}

struct Collector<'a> {
    nodes: Vec<CallableNode<'a>>,
}

impl<'a> Collector<'a> {
    fn stmts(&mut self, stmts: &'a [Stmt]) -> Result<()> {
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &'a Stmt) -> Result<()> {
        use swc_ecma_ast::{Decl, ForHead, VarDeclOrExpr};
        match stmt {
            Stmt::Block(block) => self.stmts(&block.stmts)?,
            Stmt::Expr(expr) => self.expr(&expr.expr)?,
            Stmt::Return(ret) => {
                if let Some(arg) = &ret.arg {
                    self.expr(arg)?;
                }
            }
            Stmt::Throw(throw) => self.expr(&throw.arg)?,
            Stmt::If(if_stmt) => {
                self.expr(&if_stmt.test)?;
                self.stmt(&if_stmt.cons)?;
                if let Some(alt) = &if_stmt.alt {
                    self.stmt(alt)?;
                }
            }
            Stmt::While(stmt) => {
                self.expr(&stmt.test)?;
                self.stmt(&stmt.body)?;
            }
            Stmt::DoWhile(stmt) => {
                self.stmt(&stmt.body)?;
                self.expr(&stmt.test)?;
            }
            Stmt::For(stmt) => {
                match &stmt.init {
                    Some(VarDeclOrExpr::VarDecl(var_decl)) => self.var_decl(var_decl)?,
                    Some(VarDeclOrExpr::Expr(expr)) => self.expr(expr)?,
                    None => {}
                }
                if let Some(test) = &stmt.test {
                    self.expr(test)?;
                }
                if let Some(update) = &stmt.update {
                    self.expr(update)?;
                }
                self.stmt(&stmt.body)?;
            }
            Stmt::ForOf(stmt) => {
                if let ForHead::VarDecl(var_decl) = &stmt.left {
                    self.var_decl(var_decl)?;
                }
                self.expr(&stmt.right)?;
                self.stmt(&stmt.body)?;
            }
            Stmt::ForIn(stmt) => {
                self.expr(&stmt.right)?;
                self.stmt(&stmt.body)?;
            }
            Stmt::Labeled(stmt) => self.stmt(&stmt.body)?,
            Stmt::Switch(switch) => {
                self.expr(&switch.discriminant)?;
                for case in &switch.cases {
                    if let Some(test) = &case.test {
                        self.expr(test)?;
                    }
                    self.stmts(&case.cons)?;
                }
            }
            Stmt::Try(try_stmt) => {
                self.stmts(&try_stmt.block.stmts)?;
                if let Some(handler) = &try_stmt.handler {
                    self.stmts(&handler.body.stmts)?;
                }
                if let Some(finalizer) = &try_stmt.finalizer {
                    self.stmts(&finalizer.stmts)?;
                }
            }
            Stmt::Decl(Decl::Var(var_decl)) => self.var_decl(var_decl)?,
            Stmt::Decl(Decl::Fn(fn_decl)) => {
                self.nodes.push(CallableNode::Function {
                    name: &fn_decl.ident.sym,
                    function: &fn_decl.function,
                    is_decl: true,
                });
                self.function_body(&fn_decl.function)?;
            }
            Stmt::Decl(Decl::Class(class_decl)) => self.class(&class_decl.ident.sym, &class_decl.class)?,
            // Everything else either holds no nested code or is rejected
            // by the emitter.
            _ => {}
        }
        Ok(())
    }

    fn var_decl(&mut self, var_decl: &'a swc_ecma_ast::VarDecl) -> Result<()> {
        for declarator in &var_decl.decls {
            if let Some(init) = &declarator.init {
                self.expr(init)?;
            }
        }
        Ok(())
    }

    fn function_body(&mut self, function: &'a Function) -> Result<()> {
        for param in &function.params {
            if let swc_ecma_ast::Pat::Assign(assign) = &param.pat {
                self.expr(&assign.right)?;
            }
        }
        if let Some(body) = &function.body {
            self.stmts(&body.stmts)?;
        }
        Ok(())
    }

    fn class(&mut self, name: &'a JsWord, class: &'a Class) -> Result<()> {
        if let Some(super_class) = &class.super_class {
            self.expr(super_class)?;
        }
        let ctor = class.body.iter().find_map(|member| match member {
            ClassMember::Constructor(ctor) => Some(ctor),
            _ => None,
        });
        self.nodes.push(CallableNode::Constructor {
            class,
            class_name: name,
            ctor,
        });
        for member in &class.body {
            match member {
                ClassMember::ClassProp(prop) => {
                    if let Some(value) = &prop.value {
                        self.expr(value)?;
                    }
                }
                ClassMember::PrivateProp(prop) => {
                    if let Some(value) = &prop.value {
                        self.expr(value)?;
                    }
                }
                _ => {}
            }
        }
        if let Some(ctor) = ctor {
            for param in &ctor.params {
                if let swc_ecma_ast::ParamOrTsParamProp::Param(param) = param {
                    if let swc_ecma_ast::Pat::Assign(assign) = &param.pat {
                        self.expr(&assign.right)?;
                    }
                }
            }
            if let Some(body) = &ctor.body {
                self.stmts(&body.stmts)?;
            }
        }
        for member in &class.body {
            let (name, function, is_static) = match member {
                ClassMember::Method(method) => (
                    crate::scope::builder::prop_name_str(&method.key)?.to_string(),
                    &method.function,
                    method.is_static,
                ),
                ClassMember::PrivateMethod(method) => {
                    (format!("#{}", method.key.id.sym), &method.function, method.is_static)
                }
                _ => continue,
            };
            self.nodes.push(CallableNode::Method {
                class,
                name,
                function,
                is_static,
            });
            self.function_body(function)?;
        }
        Ok(())
    }

    fn expr(&mut self, expr: &'a Expr) -> Result<()> {
        use swc_ecma_ast::{Callee, MemberProp, Prop, PropName, PropOrSpread};
        match expr {
            Expr::Fn(fn_expr) => {
                let name = match &fn_expr.ident {
                    Some(ident) => &ident.sym,
                    None => &*ANONYMOUS,
                };
                self.nodes.push(CallableNode::Function {
                    name,
                    function: &fn_expr.function,
                    is_decl: false,
                });
                self.function_body(&fn_expr.function)?;
            }
            Expr::Arrow(arrow) => {
                self.nodes.push(CallableNode::Arrow(arrow));
                for param in &arrow.params {
                    if let swc_ecma_ast::Pat::Assign(assign) = param {
                        self.expr(&assign.right)?;
                    }
                }
                match arrow.body.as_ref() {
                    BlockStmtOrExpr::BlockStmt(body) => self.stmts(&body.stmts)?,
                    BlockStmtOrExpr::Expr(body) => self.expr(body)?,
                }
            }
            // Rejected by the emitter.
            Expr::Class(_) => {}
            Expr::Array(array) => {
                for elem in array.elems.iter().flatten() {
                    self.expr(&elem.expr)?;
                }
            }
            Expr::Object(object) => {
                for prop in &object.props {
                    match prop {
                        PropOrSpread::Spread(spread) => self.expr(&spread.expr)?,
                        PropOrSpread::Prop(prop) => match prop.as_ref() {
                            Prop::KeyValue(kv) => {
                                if let PropName::Computed(computed) = &kv.key {
                                    self.expr(&computed.expr)?;
                                }
                                self.expr(&kv.value)?;
                            }
                            Prop::Method(method) => {
                                if let PropName::Computed(computed) = &method.key {
                                    self.expr(&computed.expr)?;
                                }
                                let name = crate::scope::builder::prop_name_str(&method.key).unwrap_or("method");
                                self.nodes.push(CallableNode::ObjectMethod {
                                    name: name.to_string(),
                                    function: &method.function,
                                });
                                self.function_body(&method.function)?;
                            }
                            _ => {}
                        },
                    }
                }
            }
            Expr::Unary(unary) => self.expr(&unary.arg)?,
            Expr::Update(update) => self.expr(&update.arg)?,
            Expr::Bin(bin) => {
                self.expr(&bin.left)?;
                self.expr(&bin.right)?;
            }
            Expr::Assign(assign) => {
                if let swc_ecma_ast::PatOrExpr::Expr(left) = &assign.left {
                    self.expr(left)?;
                }
                self.expr(&assign.right)?;
            }
            Expr::Member(member) => {
                self.expr(&member.obj)?;
                if let MemberProp::Computed(computed) = &member.prop {
                    self.expr(&computed.expr)?;
                }
            }
            Expr::Cond(cond) => {
                self.expr(&cond.test)?;
                self.expr(&cond.cons)?;
                self.expr(&cond.alt)?;
            }
            Expr::Call(call) => {
                if let Callee::Expr(callee) = &call.callee {
                    self.expr(callee)?;
                }
                for arg in &call.args {
                    self.expr(&arg.expr)?;
                }
            }
            Expr::New(new_expr) => {
                self.expr(&new_expr.callee)?;
                for arg in new_expr.args.iter().flatten() {
                    self.expr(&arg.expr)?;
                }
            }
            Expr::Seq(seq) => {
                for expr in &seq.exprs {
                    self.expr(expr)?;
                }
            }
            Expr::Tpl(tpl) => {
                for expr in &tpl.exprs {
                    self.expr(expr)?;
                }
            }
            Expr::Paren(paren) => self.expr(&paren.expr)?,
            _ => {}
        }
        Ok(())
    }
}

lazy_static::lazy_static! {
    static ref ANONYMOUS: JsWord = JsWord::from("function");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_mutual_references() {
        let compiled = compile_str(
            "
            console.log(isEven(10));
            function isEven(n) { return n === 0 ? true : isOdd(n - 1); }
            function isOdd(n) { return n === 0 ? false : isEven(n - 1); }
            ",
            CompileFlags::default(),
        )
        .unwrap();

        let asm = &compiled.assembly;
        let even = asm.find_method("Functions.isEven", "__js_call__").unwrap();
        let odd = asm.find_method("Functions.isOdd", "__js_call__").unwrap();
        let calls = |m: MethodHandle| -> Vec<MethodHandle> {
            asm.method(m)
                .body
                .as_ref()
                .unwrap()
                .instrs
                .iter()
                .filter_map(|instr| match instr {
                    crate::bytecode::Instr::Call(crate::bytecode::MethodRef::User(h)) => Some(*h),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(calls(even), vec![odd]);
        assert_eq!(calls(odd), vec![even]);
        assert!(asm.missing_bodies().is_empty());
        assert_eq!(asm.entry_point(), asm.find_method("Program", "Main"));
    }

    #[test]
    fn test_callable_index() {
        let compiled = compile_str(
            "
            function outer(a, b = 2) {
                const f = (x) => x + a;
                return f(b);
            }
            class K { constructor(v) { this.v = v; } get() { return this.v; } }
            ",
            CompileFlags::default(),
        )
        .unwrap();

        let kinds: Vec<_> = compiled.callables.iter().map(|c| (c.kind(), c.id.name.clone())).collect();
        assert_eq!(
            kinds,
            vec![
                (CallableKind::Main, "main".to_string()),
                (CallableKind::Function, "outer".to_string()),
                (CallableKind::Arrow, "arrow".to_string()),
                (CallableKind::Constructor, "K.constructor".to_string()),
                (CallableKind::ClassMethod, "get".to_string()),
            ]
        );

        let outer = compiled.callables.iter().find(|c| c.id.name == "outer").unwrap();
        assert_eq!(outer.params, ParamCount { min: 1, max: 2 });
        assert_eq!(outer.first_param, 1);
        assert_eq!(outer.id.line, 2);

        let arrow = compiled.callables.iter().find(|c| c.kind() == CallableKind::Arrow).unwrap();
        let arrow_owner = compiled.assembly.type_def(arrow.owner);
        assert_eq!(arrow_owner.kind, TypeKind::ArrowOwner);
        assert_eq!(arrow_owner.nested_in, Some(outer.owner));
    }

    #[test]
    fn test_unsupported_node_is_located() {
        let err = compile_file(
            "input.js",
            "let a = 1;\nlet o = { get x() { return a; } };\n".to_string(),
            CompileFlags::default(),
        )
        .err()
        .unwrap();
        let message = err.message();
        assert!(message.contains("unsupported"), "{}", message);
        assert!(message.contains("input.js: 2,"), "{}", message);
    }

    #[test]
    fn test_object_literal_methods_take_this() {
        let compiled = compile_str(
            "
            function make() {
                return { n: 1, get(extra) { return this.n + extra; } };
            }
            ",
            CompileFlags::default(),
        )
        .unwrap();

        let method = compiled.callables.iter().find(|c| c.kind() == CallableKind::ObjectMethod).unwrap();
        assert_eq!(method.id.name, "get");
        assert_eq!(method.first_param, 2);
        assert_eq!(method.scopes, ScopesSource::Arg(ArgIndex(0)));

        let asm = &compiled.assembly;
        let owner = asm.type_def(method.owner);
        assert_eq!(owner.name, "ObjectMethods.make.get");
        let make = compiled.callables.iter().find(|c| c.id.name == "make").unwrap();
        assert_eq!(owner.nested_in, Some(make.owner));
        let decl = asm.method(method.method);
        assert_eq!(decl.param_names, vec!["scopes", "this", "extra"]);
    }

    #[test]
    fn test_flags_from_env() {
        std::env::set_var("JSIL_PEEPHOLE", "0");
        std::env::set_var("JSIL_IR_METRICS", "1");
        let flags = CompileFlags::from_env();
        std::env::remove_var("JSIL_PEEPHOLE");
        std::env::remove_var("JSIL_IR_METRICS");
        assert!(flags.ir_pipeline);
        assert!(!flags.peephole);
        assert!(flags.collect_metrics);
    }
}
