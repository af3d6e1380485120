//! Builds the [`ScopeTree`] from a parsed script.
//!
//! Three steps: a walk of the AST that creates scopes, declares bindings
//! (with `var` hoisted to the enclosing frame) and records every identifier
//! use; a resolution step that marks captured bindings; a fixed-point type
//! inference over the recorded writes.

use std::collections::{HashMap, HashSet};

use slotmap::SlotMap;
use swc_atoms::JsWord;
use swc_common::{Span, Spanned};
use swc_ecma_ast::{
    BinaryOp, BlockStmtOrExpr, Class, ClassMember, Decl, Expr, ForHead, Function, Lit, Pat,
    PatOrExpr, Script, Stmt, UnaryOp, VarDecl, VarDeclKind,
};

use super::{
    Binding, BindingKind, ClassRef, JsType, NodeKey, Reference, Scope, ScopeId, ScopeKind, ScopeKindTag,
    ScopeTree,
};
use crate::common::Result;
use crate::runtime::{self, IntrinsicKind, ReturnKind};
use crate::unsupported_node;

pub fn build_scope_tree(script: &Script) -> Result<ScopeTree> {
    let mut builder = Builder::new(script.span);
    builder.hoist_vars(&script.body)?;
    builder.declare_lexical(&script.body)?;
    builder.walk_stmts(&script.body)?;
    Ok(builder.finish())
}

struct Use {
    from: ScopeId,
    name: JsWord,
    is_write: bool,
    is_call: bool,
}

#[derive(Clone, Copy)]
enum Written<'a> {
    Value(&'a Expr),
    /// `x op= value`
    Compound(BinaryOp, &'a Expr),
    /// `x &&= value` and friends: either the old value or `value`.
    Either(&'a Expr),
    Number,
    Unknown,
}

struct Write<'a> {
    from: ScopeId,
    name: JsWord,
    value: Written<'a>,
}

struct Builder<'a> {
    scopes: SlotMap<ScopeId, Scope>,
    root: ScopeId,
    by_node: HashMap<(NodeKey, ScopeKindTag), ScopeId>,
    cur: ScopeId,
    uses: Vec<Use>,
    writes: Vec<Write<'a>>,
    initialized: HashSet<(ScopeId, JsWord)>,
}

impl<'a> Builder<'a> {
    fn new(span: Span) -> Self {
        let mut scopes = SlotMap::with_key();
        let root = scopes.insert(new_scope("global".to_string(), ScopeKind::Global, None, span));
        Builder {
            scopes,
            root,
            by_node: HashMap::new(),
            cur: root,
            uses: Vec::new(),
            writes: Vec::new(),
            initialized: HashSet::new(),
        }
    }

    fn push_scope(&mut self, name: String, kind: ScopeKind, span: Span) -> Result<ScopeId> {
        let key = (NodeKey::from(span), ScopeKindTag::of(kind));
        if self.by_node.contains_key(&key) {
            return Err(crate::error!("internal: two {:?} scopes for the same node", kind).with_span(span));
        }
        let parent = self.cur;
        let id = self.scopes.insert(new_scope(name, kind, Some(parent), span));
        self.scopes[parent].children.push(id);
        self.by_node.insert(key, id);
        self.cur = id;
        Ok(id)
    }

    fn pop_scope(&mut self) {
        if let Some(parent) = self.scopes[self.cur].parent {
            self.cur = parent;
        }
    }

    fn cur_frame(&self) -> ScopeId {
        let mut id = self.cur;
        loop {
            let scope = &self.scopes[id];
            match (scope.kind, scope.parent) {
                (ScopeKind::Global | ScopeKind::Function, _) | (_, None) => return id,
                (_, Some(parent)) => id = parent,
            }
        }
    }

    /// Declare `name` in `scope`.  Redeclarations (`var x; var x;`) keep the
    /// first binding.
    fn declare(&mut self, scope: ScopeId, name: &JsWord, kind: BindingKind, span: Span) {
        let scope = &mut self.scopes[scope];
        if scope.binding_ndx.contains_key(name) {
            return;
        }
        let param_index = match kind {
            BindingKind::Param => Some(scope.parameters.len() as u16),
            _ => None,
        };
        if kind == BindingKind::Param {
            scope.parameters.push(name.clone());
        }
        scope.binding_ndx.insert(name.clone(), scope.bindings.len());
        scope.bindings.push(Binding {
            name: name.clone(),
            kind,
            is_captured: false,
            is_stable_type: false,
            inferred: JsType::Unknown,
            reassigned: false,
            param_index,
            instance_of: None,
            span,
        });
    }

    fn use_name(&mut self, name: &JsWord, is_write: bool, is_call: bool) {
        self.uses.push(Use {
            from: self.cur,
            name: name.clone(),
            is_write,
            is_call,
        });
    }

    fn write_name(&mut self, name: &JsWord, value: Written<'a>) {
        self.use_name(name, true, false);
        self.writes.push(Write {
            from: self.cur,
            name: name.clone(),
            value,
        });
    }

    //
    // Declarations
    //

    /// Hoist `var` declarations found in `stmts` (without entering nested
    /// functions) into the current frame.
    fn hoist_vars(&mut self, stmts: &'a [Stmt]) -> Result<()> {
        for stmt in stmts {
            self.hoist_vars_stmt(stmt)?;
        }
        Ok(())
    }

    fn hoist_vars_stmt(&mut self, stmt: &'a Stmt) -> Result<()> {
        let frame = self.cur_frame();
        match stmt {
            Stmt::Decl(Decl::Var(var_decl)) if var_decl.kind == VarDeclKind::Var => {
                self.declare_var_decl(frame, var_decl)?;
            }
            Stmt::Block(block) => self.hoist_vars(&block.stmts)?,
            Stmt::If(if_stmt) => {
                self.hoist_vars_stmt(&if_stmt.cons)?;
                if let Some(alt) = &if_stmt.alt {
                    self.hoist_vars_stmt(alt)?;
                }
            }
            Stmt::While(stmt) => self.hoist_vars_stmt(&stmt.body)?,
            Stmt::DoWhile(stmt) => self.hoist_vars_stmt(&stmt.body)?,
            Stmt::For(for_stmt) => {
                if let Some(swc_ecma_ast::VarDeclOrExpr::VarDecl(var_decl)) = &for_stmt.init {
                    if var_decl.kind == VarDeclKind::Var {
                        self.declare_var_decl(frame, var_decl)?;
                    }
                }
                self.hoist_vars_stmt(&for_stmt.body)?;
            }
            Stmt::ForOf(for_of) => {
                if let ForHead::VarDecl(var_decl) = &for_of.left {
                    if var_decl.kind == VarDeclKind::Var {
                        self.declare_var_decl(frame, var_decl)?;
                    }
                }
                self.hoist_vars_stmt(&for_of.body)?;
            }
            Stmt::ForIn(for_in) => {
                if let ForHead::VarDecl(var_decl) = &for_in.left {
                    if var_decl.kind == VarDeclKind::Var {
                        self.declare_var_decl(frame, var_decl)?;
                    }
                }
                self.hoist_vars_stmt(&for_in.body)?;
            }
            Stmt::Switch(switch) => {
                for case in &switch.cases {
                    self.hoist_vars(&case.cons)?;
                }
            }
            Stmt::Try(try_stmt) => {
                self.hoist_vars(&try_stmt.block.stmts)?;
                if let Some(handler) = &try_stmt.handler {
                    self.hoist_vars(&handler.body.stmts)?;
                }
                if let Some(finalizer) = &try_stmt.finalizer {
                    self.hoist_vars(&finalizer.stmts)?;
                }
            }
            Stmt::Labeled(labeled) => self.hoist_vars_stmt(&labeled.body)?,
            _ => {}
        }
        Ok(())
    }

    fn declare_var_decl(&mut self, scope: ScopeId, var_decl: &VarDecl) -> Result<()> {
        let kind = match var_decl.kind {
            VarDeclKind::Var => BindingKind::Var,
            VarDeclKind::Let => BindingKind::Let,
            VarDeclKind::Const => BindingKind::Const,
        };
        for declarator in &var_decl.decls {
            let ident = binding_ident(&declarator.name)?;
            self.declare(scope, &ident.sym, kind, ident.span);
        }
        Ok(())
    }

    /// Declare the block-scoped names of a statement list into the current
    /// scope.
    fn declare_lexical(&mut self, stmts: &'a [Stmt]) -> Result<()> {
        let scope = self.cur;
        for stmt in stmts {
            match stmt {
                Stmt::Decl(Decl::Var(var_decl)) if var_decl.kind != VarDeclKind::Var => {
                    self.declare_var_decl(scope, var_decl)?;
                }
                Stmt::Decl(Decl::Fn(fn_decl)) => {
                    self.declare(scope, &fn_decl.ident.sym, BindingKind::Function, fn_decl.ident.span);
                }
                Stmt::Decl(Decl::Class(class_decl)) => {
                    self.declare(scope, &class_decl.ident.sym, BindingKind::Class, class_decl.ident.span);
                }
                _ => {}
            }
        }
        Ok(())
    }

    //
    // Statements
    //

    fn walk_stmts(&mut self, stmts: &'a [Stmt]) -> Result<()> {
        for stmt in stmts {
            self.walk_stmt(stmt)?;
        }
        Ok(())
    }

    fn walk_block(&mut self, span: Span, stmts: &'a [Stmt]) -> Result<()> {
        self.push_scope("block".to_string(), ScopeKind::Block, span)?;
        self.declare_lexical(stmts)?;
        self.walk_stmts(stmts)?;
        self.pop_scope();
        Ok(())
    }

    fn walk_stmt(&mut self, stmt: &'a Stmt) -> Result<()> {
        match stmt {
            Stmt::Block(block) => self.walk_block(block.span, &block.stmts)?,
            Stmt::Empty(_) | Stmt::Debugger(_) => {}
            Stmt::Return(ret) => {
                if let Some(arg) = &ret.arg {
                    self.walk_expr(arg)?;
                }
            }
            Stmt::Labeled(labeled) => self.walk_stmt(&labeled.body)?,
            Stmt::Break(_) | Stmt::Continue(_) => {}
            Stmt::If(if_stmt) => {
                self.walk_expr(&if_stmt.test)?;
                self.walk_stmt(&if_stmt.cons)?;
                if let Some(alt) = &if_stmt.alt {
                    self.walk_stmt(alt)?;
                }
            }
            Stmt::Switch(switch) => {
                self.walk_expr(&switch.discriminant)?;
                self.push_scope("switch".to_string(), ScopeKind::Block, switch.span)?;
                for case in &switch.cases {
                    self.declare_lexical(&case.cons)?;
                }
                for case in &switch.cases {
                    if let Some(test) = &case.test {
                        self.walk_expr(test)?;
                    }
                    self.walk_stmts(&case.cons)?;
                }
                self.pop_scope();
            }
            Stmt::Throw(throw) => self.walk_expr(&throw.arg)?,
            Stmt::Try(try_stmt) => {
                self.walk_block(try_stmt.block.span, &try_stmt.block.stmts)?;
                if let Some(handler) = &try_stmt.handler {
                    self.push_scope("catch".to_string(), ScopeKind::Block, handler.span)?;
                    if let Some(param) = &handler.param {
                        let ident = binding_ident(param)?;
                        let scope = self.cur;
                        self.declare(scope, &ident.sym, BindingKind::Let, ident.span);
                    }
                    self.walk_block(handler.body.span, &handler.body.stmts)?;
                    self.pop_scope();
                }
                if let Some(finalizer) = &try_stmt.finalizer {
                    self.walk_block(finalizer.span, &finalizer.stmts)?;
                }
            }
            Stmt::While(stmt) => {
                self.walk_expr(&stmt.test)?;
                self.walk_stmt(&stmt.body)?;
            }
            Stmt::DoWhile(stmt) => {
                self.walk_stmt(&stmt.body)?;
                self.walk_expr(&stmt.test)?;
            }
            Stmt::For(for_stmt) => {
                self.push_scope("for".to_string(), ScopeKind::Block, for_stmt.span)?;
                match &for_stmt.init {
                    Some(swc_ecma_ast::VarDeclOrExpr::VarDecl(var_decl)) => {
                        if var_decl.kind != VarDeclKind::Var {
                            let scope = self.cur;
                            self.declare_var_decl(scope, var_decl)?;
                        }
                        self.walk_var_decl(var_decl)?;
                    }
                    Some(swc_ecma_ast::VarDeclOrExpr::Expr(expr)) => self.walk_expr(expr)?,
                    None => {}
                }
                if let Some(test) = &for_stmt.test {
                    self.walk_expr(test)?;
                }
                if let Some(update) = &for_stmt.update {
                    self.walk_expr(update)?;
                }
                self.walk_stmt(&for_stmt.body)?;
                self.pop_scope();
            }
            Stmt::ForOf(for_of) => {
                self.walk_expr(&for_of.right)?;
                self.push_scope("for_of".to_string(), ScopeKind::Block, for_of.span)?;
                self.walk_for_head(&for_of.left)?;
                self.walk_stmt(&for_of.body)?;
                self.pop_scope();
            }
            Stmt::ForIn(for_in) => {
                self.walk_expr(&for_in.right)?;
                self.push_scope("for_in".to_string(), ScopeKind::Block, for_in.span)?;
                self.walk_for_head(&for_in.left)?;
                self.walk_stmt(&for_in.body)?;
                self.pop_scope();
            }
            Stmt::Decl(decl) => self.walk_decl(decl)?,
            Stmt::Expr(expr_stmt) => self.walk_expr(&expr_stmt.expr)?,
            other => return Err(unsupported_node!("statement", other.span())),
        }
        Ok(())
    }

    fn walk_for_head(&mut self, head: &'a ForHead) -> Result<()> {
        match head {
            ForHead::VarDecl(var_decl) => {
                if var_decl.kind != VarDeclKind::Var {
                    let scope = self.cur;
                    self.declare_var_decl(scope, var_decl)?;
                }
                for declarator in &var_decl.decls {
                    let ident = binding_ident(&declarator.name)?;
                    self.write_name(&ident.sym, Written::Unknown);
                }
            }
            ForHead::Pat(pat) => {
                let ident = binding_ident(pat)?;
                self.write_name(&ident.sym, Written::Unknown);
            }
            ForHead::UsingDecl(using) => return Err(unsupported_node!("using declaration", using.span)),
        }
        Ok(())
    }

    fn walk_decl(&mut self, decl: &'a Decl) -> Result<()> {
        match decl {
            Decl::Var(var_decl) => self.walk_var_decl(var_decl),
            Decl::Fn(fn_decl) => self.walk_function(&fn_decl.ident.sym, None, &fn_decl.function),
            Decl::Class(class_decl) => self.walk_class(&class_decl.ident.sym, None, &class_decl.class),
            other => Err(unsupported_node!("declaration", other.span())),
        }
    }

    fn walk_var_decl(&mut self, var_decl: &'a VarDecl) -> Result<()> {
        for declarator in &var_decl.decls {
            let ident = binding_ident(&declarator.name)?;
            if let Some(init) = &declarator.init {
                self.walk_expr(init)?;
                // The write is recorded from the current scope, where the
                // name resolves to this very declaration.
                self.writes.push(Write {
                    from: self.cur,
                    name: ident.sym.clone(),
                    value: Written::Value(init),
                });
                if var_decl.kind != VarDeclKind::Var {
                    let scope = self.cur;
                    self.initialized.insert((scope, ident.sym.clone()));
                }
            }
        }
        Ok(())
    }

    //
    // Functions and classes
    //

    fn walk_params(&mut self, params: impl Iterator<Item = &'a Pat>) -> Result<()> {
        let scope = self.cur;
        for param in params {
            let (ident, default) = match param {
                Pat::Assign(assign) => (binding_ident(&assign.left)?, Some(&assign.right)),
                other => (binding_ident(other)?, None),
            };
            self.declare(scope, &ident.sym, BindingKind::Param, ident.span);
            if let Some(default) = default {
                self.walk_expr(default)?;
            }
        }
        Ok(())
    }

    fn walk_function_body(&mut self, stmts: &'a [Stmt]) -> Result<()> {
        self.hoist_vars(stmts)?;
        self.declare_lexical(stmts)?;
        self.walk_stmts(stmts)
    }

    /// `self_name` is set for named function expressions.
    fn walk_function(
        &mut self,
        name: &JsWord,
        self_name: Option<&JsWord>,
        function: &'a Function,
    ) -> Result<()> {
        let id = self.push_scope(name.to_string(), ScopeKind::Function, function.span)?;
        if let Some(self_name) = self_name {
            self.scopes[id].self_name = Some(self_name.clone());
            self.declare(id, self_name, BindingKind::Function, function.span);
        }
        self.walk_params(function.params.iter().map(|param| &param.pat))?;
        if let Some(body) = &function.body {
            self.walk_function_body(&body.stmts)?;
        }
        self.pop_scope();
        Ok(())
    }

    fn walk_class(&mut self, name: &JsWord, self_name: Option<&JsWord>, class: &'a Class) -> Result<()> {
        if let Some(super_class) = &class.super_class {
            self.walk_expr(super_class)?;
        }
        // Static field initializers run where the class is declared.
        for member in &class.body {
            match member {
                ClassMember::ClassProp(prop) if prop.is_static => {
                    if let Some(value) = &prop.value {
                        self.walk_expr(value)?;
                    }
                }
                ClassMember::PrivateProp(prop) if prop.is_static => {
                    if let Some(value) = &prop.value {
                        self.walk_expr(value)?;
                    }
                }
                _ => {}
            }
        }

        let class_scope = self.push_scope(name.to_string(), ScopeKind::Class, class.span)?;
        if let Some(self_name) = self_name {
            self.scopes[class_scope].self_name = Some(self_name.clone());
            self.declare(class_scope, self_name, BindingKind::Class, class.span);
        }

        let ctor = class.body.iter().find_map(|member| match member {
            ClassMember::Constructor(ctor) => Some(ctor),
            _ => None,
        });

        // Instance field initializers run inside the constructor, explicit
        // or implicit.
        let ctor_span = ctor.map(|ctor| ctor.span).unwrap_or(class.span);
        self.push_scope("constructor".to_string(), ScopeKind::Function, ctor_span)?;
        for member in &class.body {
            match member {
                ClassMember::ClassProp(prop) if !prop.is_static => {
                    if let Some(value) = &prop.value {
                        self.walk_expr(value)?;
                    }
                }
                ClassMember::PrivateProp(prop) if !prop.is_static => {
                    if let Some(value) = &prop.value {
                        self.walk_expr(value)?;
                    }
                }
                _ => {}
            }
        }
        if let Some(ctor) = ctor {
            let mut params = Vec::new();
            for param in &ctor.params {
                match param {
                    swc_ecma_ast::ParamOrTsParamProp::Param(param) => params.push(&param.pat),
                    swc_ecma_ast::ParamOrTsParamProp::TsParamProp(prop) => {
                        return Err(unsupported_node!("parameter property", prop.span))
                    }
                }
            }
            self.walk_params(params.into_iter())?;
            if let Some(body) = &ctor.body {
                self.walk_function_body(&body.stmts)?;
            }
        }
        self.pop_scope();

        for member in &class.body {
            match member {
                ClassMember::Method(method) => {
                    let name = prop_name_str(&method.key)?;
                    self.walk_function(&JsWord::from(name), None, &method.function)?;
                }
                ClassMember::PrivateMethod(method) => {
                    let name = format!("#{}", method.key.id.sym);
                    self.walk_function(&JsWord::from(name), None, &method.function)?;
                }
                ClassMember::Constructor(_)
                | ClassMember::ClassProp(_)
                | ClassMember::PrivateProp(_)
                | ClassMember::Empty(_) => {}
                other => return Err(unsupported_node!("class member", other.span())),
            }
        }

        self.pop_scope();
        Ok(())
    }

    //
    // Expressions
    //

    fn walk_expr(&mut self, expr: &'a Expr) -> Result<()> {
        match expr {
            Expr::This(_) | Expr::Lit(_) => {}
            Expr::Ident(ident) => self.use_name(&ident.sym, false, false),
            Expr::Array(array) => {
                for elem in array.elems.iter().flatten() {
                    self.walk_expr(&elem.expr)?;
                }
            }
            Expr::Object(object) => {
                use swc_ecma_ast::{Prop, PropName, PropOrSpread};
                for prop in &object.props {
                    match prop {
                        PropOrSpread::Spread(spread) => self.walk_expr(&spread.expr)?,
                        PropOrSpread::Prop(prop) => match prop.as_ref() {
                            Prop::Shorthand(ident) => self.use_name(&ident.sym, false, false),
                            Prop::KeyValue(kv) => {
                                if let PropName::Computed(computed) = &kv.key {
                                    self.walk_expr(&computed.expr)?;
                                }
                                self.walk_expr(&kv.value)?;
                            }
                            Prop::Method(method) => {
                                if let PropName::Computed(computed) = &method.key {
                                    self.walk_expr(&computed.expr)?;
                                }
                                let name = prop_name_str(&method.key).unwrap_or("method");
                                self.walk_function(&JsWord::from(name), None, &method.function)?;
                            }
                            other => return Err(unsupported_node!("object literal property", other.span())),
                        },
                    }
                }
            }
            Expr::Fn(fn_expr) => {
                let name = fn_expr
                    .ident
                    .as_ref()
                    .map(|ident| ident.sym.clone())
                    .unwrap_or_else(|| JsWord::from("function"));
                let self_name = fn_expr.ident.as_ref().map(|ident| &ident.sym);
                self.walk_function(&name, self_name, &fn_expr.function)?;
            }
            Expr::Arrow(arrow) => {
                self.push_scope("arrow".to_string(), ScopeKind::Function, arrow.span)?;
                self.walk_params(arrow.params.iter())?;
                match arrow.body.as_ref() {
                    BlockStmtOrExpr::BlockStmt(block) => self.walk_function_body(&block.stmts)?,
                    BlockStmtOrExpr::Expr(expr) => self.walk_expr(expr)?,
                }
                self.pop_scope();
            }
            Expr::Class(class_expr) => {
                let name = class_expr
                    .ident
                    .as_ref()
                    .map(|ident| ident.sym.clone())
                    .unwrap_or_else(|| JsWord::from("class"));
                let self_name = class_expr.ident.as_ref().map(|ident| &ident.sym);
                self.walk_class(&name, self_name, &class_expr.class)?;
            }
            Expr::Unary(unary) => self.walk_expr(&unary.arg)?,
            Expr::Update(update) => match update.arg.as_ref() {
                Expr::Ident(ident) => {
                    self.use_name(&ident.sym, false, false);
                    self.write_name(&ident.sym, Written::Number);
                }
                other => self.walk_expr(other)?,
            },
            Expr::Bin(bin) => {
                self.walk_expr(&bin.left)?;
                self.walk_expr(&bin.right)?;
            }
            Expr::Assign(assign) => {
                self.walk_expr(&assign.right)?;
                let target = match &assign.left {
                    PatOrExpr::Pat(pat) => match pat.as_ref() {
                        Pat::Ident(binding) => Some(&binding.id),
                        Pat::Expr(expr) => match expr.as_ref() {
                            Expr::Ident(ident) => Some(ident),
                            other => {
                                self.walk_expr(other)?;
                                None
                            }
                        },
                        other => return Err(unsupported_node!("destructuring assignment", other.span())),
                    },
                    PatOrExpr::Expr(expr) => match expr.as_ref() {
                        Expr::Ident(ident) => Some(ident),
                        other => {
                            self.walk_expr(other)?;
                            None
                        }
                    },
                };
                if let Some(ident) = target {
                    use swc_ecma_ast::AssignOp;
                    let value = match assign.op {
                        AssignOp::Assign => Written::Value(&assign.right),
                        AssignOp::AndAssign | AssignOp::OrAssign | AssignOp::NullishAssign => {
                            Written::Either(&assign.right)
                        }
                        op => match compound_binary_op(op) {
                            Some(bin_op) => Written::Compound(bin_op, &assign.right),
                            None => Written::Unknown,
                        },
                    };
                    if assign.op != AssignOp::Assign {
                        self.use_name(&ident.sym, false, false);
                    }
                    self.write_name(&ident.sym, value);
                }
            }
            Expr::Member(member) => {
                self.walk_expr(&member.obj)?;
                if let swc_ecma_ast::MemberProp::Computed(computed) = &member.prop {
                    self.walk_expr(&computed.expr)?;
                }
            }
            Expr::SuperProp(super_prop) => {
                if let swc_ecma_ast::SuperProp::Computed(computed) = &super_prop.prop {
                    self.walk_expr(&computed.expr)?;
                }
            }
            Expr::Cond(cond) => {
                self.walk_expr(&cond.test)?;
                self.walk_expr(&cond.cons)?;
                self.walk_expr(&cond.alt)?;
            }
            Expr::Call(call) => {
                match &call.callee {
                    swc_ecma_ast::Callee::Expr(callee) => match callee.as_ref() {
                        Expr::Ident(ident) => self.use_name(&ident.sym, false, true),
                        other => self.walk_expr(other)?,
                    },
                    swc_ecma_ast::Callee::Super(_) => {}
                    swc_ecma_ast::Callee::Import(import) => {
                        return Err(unsupported_node!("dynamic import", import.span))
                    }
                }
                for arg in &call.args {
                    self.walk_expr(&arg.expr)?;
                }
            }
            Expr::New(new_expr) => {
                match new_expr.callee.as_ref() {
                    Expr::Ident(ident) => self.use_name(&ident.sym, false, true),
                    other => self.walk_expr(other)?,
                }
                for arg in new_expr.args.iter().flatten() {
                    self.walk_expr(&arg.expr)?;
                }
            }
            Expr::Seq(seq) => {
                for expr in &seq.exprs {
                    self.walk_expr(expr)?;
                }
            }
            Expr::Tpl(tpl) => {
                for expr in &tpl.exprs {
                    self.walk_expr(expr)?;
                }
            }
            Expr::Paren(paren) => self.walk_expr(&paren.expr)?,
            other => return Err(unsupported_node!("expression", other.span())),
        }
        Ok(())
    }

    //
    // Resolution and inference
    //

    fn resolve(&self, from: ScopeId, name: &JsWord) -> Option<(ScopeId, usize)> {
        let mut id = Some(from);
        while let Some(cur) = id {
            let scope = &self.scopes[cur];
            if let Some(ndx) = scope.binding_ndx.get(name) {
                return Some((cur, *ndx));
            }
            id = scope.parent;
        }
        None
    }

    fn finish(mut self) -> ScopeTree {
        let mut references = Vec::new();
        let uses = std::mem::take(&mut self.uses);
        for use_ in uses {
            let Some((decl, ndx)) = self.resolve(use_.from, &use_.name) else {
                continue;
            };

            let mut crossed = false;
            let mut id = use_.from;
            while id != decl {
                let scope = &mut self.scopes[id];
                match scope.kind {
                    ScopeKind::Function => {
                        crossed = true;
                        scope.references_parent_scope_variables = true;
                    }
                    ScopeKind::Class => crossed = true,
                    ScopeKind::Block | ScopeKind::Global => {}
                }
                match scope.parent {
                    Some(parent) => id = parent,
                    None => break,
                }
            }

            let binding = &mut self.scopes[decl].bindings[ndx];
            if use_.is_write {
                binding.reassigned = true;
            }
            let is_storage = matches!(
                binding.kind,
                BindingKind::Var | BindingKind::Let | BindingKind::Const | BindingKind::Param
            );
            if crossed && is_storage {
                binding.is_captured = true;
            }

            if use_.from != decl {
                references.push(Reference {
                    from: use_.from,
                    decl,
                    name: use_.name,
                    is_write: use_.is_write,
                    is_call: use_.is_call,
                });
            }
        }

        self.infer_types();
        self.infer_instances();

        ScopeTree {
            scopes: self.scopes,
            root: self.root,
            by_node: self.by_node,
            references,
        }
    }

    fn infer_instances(&mut self) {
        let mut found = Vec::new();
        for write in &self.writes {
            let Written::Value(Expr::New(new_expr)) = write.value else {
                continue;
            };
            let Expr::Ident(callee) = new_expr.callee.as_ref() else {
                continue;
            };
            let (Some(target), Some((class_decl, class_ndx))) = (
                self.resolve(write.from, &write.name),
                self.resolve(write.from, &callee.sym),
            ) else {
                continue;
            };
            let binding = &self.scopes[target.0].bindings[target.1];
            let class = &self.scopes[class_decl].bindings[class_ndx];
            if matches!(binding.kind, BindingKind::Let | BindingKind::Const)
                && !binding.reassigned
                && class.kind == BindingKind::Class
            {
                found.push((target, ClassRef { decl: class_decl, name: callee.sym.clone() }));
            }
        }
        for ((scope, ndx), class) in found {
            self.scopes[scope].bindings[ndx].instance_of = Some(class);
        }
    }

    fn is_candidate(&self, decl: ScopeId, ndx: usize) -> bool {
        let binding = &self.scopes[decl].bindings[ndx];
        matches!(binding.kind, BindingKind::Let | BindingKind::Const)
            && !binding.is_captured
            && self.initialized.contains(&(decl, binding.name.clone()))
    }

    /// Optimistic fixed point: every candidate starts at `Top` and only moves
    /// down the lattice as writes are joined in.
    fn infer_types(&mut self) {
        let mut state: HashMap<(ScopeId, usize), Lattice> = HashMap::new();
        for (id, scope) in self.scopes.iter() {
            for ndx in 0..scope.bindings.len() {
                if self.is_candidate(id, ndx) {
                    state.insert((id, ndx), Lattice::Top);
                }
            }
        }

        loop {
            let mut changed = false;
            for write in &self.writes {
                let Some(key) = self.resolve(write.from, &write.name) else {
                    continue;
                };
                let Some(current) = state.get(&key).copied() else {
                    continue;
                };
                let written = match write.value {
                    Written::Value(expr) => self.expr_type(expr, write.from, &state),
                    Written::Compound(op, expr) => {
                        let rhs = self.expr_type(expr, write.from, &state);
                        binary_type(op, current, rhs)
                    }
                    Written::Either(expr) => current.join(self.expr_type(expr, write.from, &state)),
                    Written::Number => Lattice::Type(JsType::Number),
                    Written::Unknown => Lattice::Unknown,
                };
                let next = current.join(written);
                if next != current {
                    state.insert(key, next);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for ((id, ndx), value) in state {
            let binding = &mut self.scopes[id].bindings[ndx];
            if let Lattice::Type(ty @ (JsType::Number | JsType::Boolean | JsType::String)) = value {
                binding.is_stable_type = true;
                binding.inferred = ty;
            }
        }
    }

    fn expr_type(&self, expr: &Expr, from: ScopeId, state: &HashMap<(ScopeId, usize), Lattice>) -> Lattice {
        let known = |ty| Lattice::Type(ty);
        match expr {
            Expr::Lit(Lit::Num(_)) => known(JsType::Number),
            Expr::Lit(Lit::Str(_)) => known(JsType::String),
            Expr::Lit(Lit::Bool(_)) => known(JsType::Boolean),
            Expr::Lit(Lit::Null(_)) => known(JsType::Null),
            Expr::Lit(_) => Lattice::Unknown,
            Expr::Tpl(_) => known(JsType::String),
            Expr::Ident(ident) => match self.resolve(from, &ident.sym) {
                Some(key) => match state.get(&key) {
                    Some(value) => *value,
                    None => match self.scopes[key.0].bindings[key.1].kind {
                        BindingKind::Function | BindingKind::Class => known(JsType::Object),
                        _ => Lattice::Unknown,
                    },
                },
                None => match &*ident.sym {
                    "undefined" => known(JsType::Undefined),
                    "NaN" | "Infinity" => known(JsType::Number),
                    _ => Lattice::Unknown,
                },
            },
            Expr::Unary(unary) => match unary.op {
                UnaryOp::Minus | UnaryOp::Plus | UnaryOp::Tilde => known(JsType::Number),
                UnaryOp::Bang | UnaryOp::Delete => known(JsType::Boolean),
                UnaryOp::TypeOf => known(JsType::String),
                UnaryOp::Void => known(JsType::Undefined),
            },
            Expr::Update(_) => known(JsType::Number),
            Expr::Bin(bin) => {
                let left = self.expr_type(&bin.left, from, state);
                let right = self.expr_type(&bin.right, from, state);
                binary_type(bin.op, left, right)
            }
            Expr::Assign(assign) if assign.op == swc_ecma_ast::AssignOp::Assign => {
                self.expr_type(&assign.right, from, state)
            }
            Expr::Cond(cond) => self
                .expr_type(&cond.cons, from, state)
                .join(self.expr_type(&cond.alt, from, state)),
            Expr::Paren(paren) => self.expr_type(&paren.expr, from, state),
            Expr::Seq(seq) => match seq.exprs.last() {
                Some(last) => self.expr_type(last, from, state),
                None => Lattice::Unknown,
            },
            Expr::Array(_) | Expr::Object(_) | Expr::Fn(_) | Expr::Arrow(_) | Expr::Class(_) | Expr::New(_) => {
                known(JsType::Object)
            }
            Expr::Call(call) => self.intrinsic_call_type(call, from),
            _ => Lattice::Unknown,
        }
    }

    /// `Math.floor(x)` and friends have a statically known result type.
    fn intrinsic_call_type(&self, call: &swc_ecma_ast::CallExpr, from: ScopeId) -> Lattice {
        let swc_ecma_ast::Callee::Expr(callee) = &call.callee else {
            return Lattice::Unknown;
        };
        let Expr::Member(member) = callee.as_ref() else {
            return Lattice::Unknown;
        };
        let (Expr::Ident(obj), swc_ecma_ast::MemberProp::Ident(prop)) = (member.obj.as_ref(), &member.prop) else {
            return Lattice::Unknown;
        };
        if self.resolve(from, &obj.sym).is_some() {
            return Lattice::Unknown;
        }
        let returns = IntrinsicKind::from_global_name(&obj.sym)
            .and_then(|kind| runtime::capability(kind, &prop.sym))
            .map(|cap| cap.returns);
        match returns {
            Some(ReturnKind::Double) => Lattice::Type(JsType::Number),
            Some(ReturnKind::Boolean) => Lattice::Type(JsType::Boolean),
            Some(ReturnKind::String) => Lattice::Type(JsType::String),
            _ => Lattice::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lattice {
    /// No write seen yet.
    Top,
    Type(JsType),
    Unknown,
}

impl Lattice {
    fn join(self, other: Lattice) -> Lattice {
        match (self, other) {
            (Lattice::Top, x) | (x, Lattice::Top) => x,
            (Lattice::Type(a), Lattice::Type(b)) if a == b => self,
            _ => Lattice::Unknown,
        }
    }
}

fn binary_type(op: BinaryOp, left: Lattice, right: Lattice) -> Lattice {
    use BinaryOp::*;
    let number = Lattice::Type(JsType::Number);
    match op {
        Sub | Mul | Div | Mod | Exp | BitAnd | BitOr | BitXor | LShift | RShift | ZeroFillRShift => number,
        EqEq | NotEq | EqEqEq | NotEqEq | Lt | LtEq | Gt | GtEq | In | InstanceOf => {
            Lattice::Type(JsType::Boolean)
        }
        Add => match (left, right) {
            (Lattice::Type(JsType::String), _) | (_, Lattice::Type(JsType::String)) => {
                Lattice::Type(JsType::String)
            }
            (Lattice::Type(JsType::Number), Lattice::Type(JsType::Number)) => number,
            (Lattice::Top, _) | (_, Lattice::Top) => Lattice::Top,
            _ => Lattice::Unknown,
        },
        LogicalAnd | LogicalOr | NullishCoalescing => left.join(right),
    }
}

fn new_scope(name: String, kind: ScopeKind, parent: Option<ScopeId>, span: Span) -> Scope {
    Scope {
        name,
        kind,
        parent,
        children: Vec::new(),
        span,
        parameters: Vec::new(),
        self_name: None,
        references_parent_scope_variables: false,
        bindings: Vec::new(),
        binding_ndx: HashMap::new(),
    }
}

fn binding_ident(pat: &Pat) -> Result<&swc_ecma_ast::Ident> {
    match pat {
        Pat::Ident(binding) => Ok(&binding.id),
        other => Err(unsupported_node!("destructuring pattern", other.span())),
    }
}

pub(crate) fn prop_name_str(key: &swc_ecma_ast::PropName) -> Result<&str> {
    use swc_ecma_ast::PropName;
    match key {
        PropName::Ident(ident) => Ok(&*ident.sym),
        PropName::Str(s) => Ok(&*s.value),
        other => Err(unsupported_node!("computed member name", other.span())),
    }
}

/// The binary operator applied by a compound assignment (`+=` is `+`).
pub(crate) fn compound_binary_op(op: swc_ecma_ast::AssignOp) -> Option<BinaryOp> {
    use swc_ecma_ast::AssignOp;
    Some(match op {
        AssignOp::AddAssign => BinaryOp::Add,
        AssignOp::SubAssign => BinaryOp::Sub,
        AssignOp::MulAssign => BinaryOp::Mul,
        AssignOp::DivAssign => BinaryOp::Div,
        AssignOp::ModAssign => BinaryOp::Mod,
        AssignOp::ExpAssign => BinaryOp::Exp,
        AssignOp::LShiftAssign => BinaryOp::LShift,
        AssignOp::RShiftAssign => BinaryOp::RShift,
        AssignOp::ZeroFillRShiftAssign => BinaryOp::ZeroFillRShift,
        AssignOp::BitOrAssign => BinaryOp::BitOr,
        AssignOp::BitXorAssign => BinaryOp::BitXor,
        AssignOp::BitAndAssign => BinaryOp::BitAnd,
        AssignOp::AndAssign => BinaryOp::LogicalAnd,
        AssignOp::OrAssign => BinaryOp::LogicalOr,
        AssignOp::NullishAssign => BinaryOp::NullishCoalescing,
        AssignOp::Assign => return None,
    })
}
