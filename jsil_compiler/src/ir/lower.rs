//! AST → HIR → LIR.

use std::collections::HashMap;

use swc_atoms::JsWord;
use swc_ecma_ast::{
    AssignExpr, AssignOp, BinExpr, BinaryOp as AstBinaryOp, BlockStmtOrExpr, CallExpr, Callee, Decl, Expr as AstExpr,
    Ident, Lit, MemberProp, Pat, PatOrExpr, Stmt as AstStmt, UnaryOp as AstUnaryOp, UpdateOp as AstUpdateOp,
    VarDecl, VarDeclKind,
};

use super::hir::{self, BinaryOp, Body, Expr, ExprKind, LogicalOp, Place, Stmt, UnaryOp, UpdateOp, VarId, VarInfo};
use super::lir::{ArithOp, CmpOp, Constant, Instr, Lir, LirBuilder, Temp, UnOp, ValueStorage};
use super::{LowerError, LowerResult};
use crate::bytecode::ClrType;
use crate::coordinator::{Callable, CallableKind, CallableNode, EmitEnv};
use crate::runtime::{capability, ArgKind, CallShape, Capability, Dispatch, IntrinsicKind, ReturnKind, RuntimeFn};
use crate::scope::{BindingKind, JsType, ScopeId};

//
// AST → HIR
//

pub(super) fn build_hir(env: &EmitEnv<'_>, callable: &Callable, node: &CallableNode<'_>) -> LowerResult<Body> {
    match callable.kind() {
        CallableKind::ClassMethod => return Err(LowerError::unsupported("class method")),
        CallableKind::Constructor => return Err(LowerError::unsupported("class constructor")),
        CallableKind::ObjectMethod => return Err(LowerError::unsupported("object literal method")),
        CallableKind::Main | CallableKind::Function | CallableKind::Arrow => {}
    }

    let frame = callable.id.scope;
    let layout = env
        .frames
        .of_scope(frame)
        .map_err(|err| LowerError::internal(err.message()))?;
    if layout.shape.is_some() {
        return Err(LowerError::unsupported("frame with captured bindings"));
    }
    if !env.scopes.block_frames_within(frame).is_empty() {
        return Err(LowerError::unsupported("block with captured bindings"));
    }
    if env.scopes.get(frame).references_parent_scope_variables {
        return Err(LowerError::unsupported("reads bindings of enclosing scopes"));
    }

    let mut builder = HirBuilder {
        env,
        callable,
        frame,
        scope: frame,
        vars: Vec::new(),
        var_ids: HashMap::new(),
    };
    let mut stmts = Vec::new();
    match node {
        CallableNode::Main(script) => builder.stmts(&script.body, &mut stmts)?,
        CallableNode::Function { function, .. } => {
            if function.is_async || function.is_generator {
                return Err(LowerError::unsupported("async or generator function"));
            }
            check_params(function.params.iter().map(|param| &param.pat))?;
            if let Some(body) = &function.body {
                builder.stmts(&body.stmts, &mut stmts)?;
            }
        }
        CallableNode::Arrow(arrow) => {
            if arrow.is_async || arrow.is_generator {
                return Err(LowerError::unsupported("async arrow function"));
            }
            check_params(arrow.params.iter())?;
            match arrow.body.as_ref() {
                BlockStmtOrExpr::BlockStmt(block) => builder.stmts(&block.stmts, &mut stmts)?,
                BlockStmtOrExpr::Expr(expr) => {
                    let value = builder.expr(expr)?;
                    stmts.push(Stmt::Return(Some(value)));
                }
            }
        }
        CallableNode::ObjectMethod { .. } | CallableNode::Method { .. } | CallableNode::Constructor { .. } => {
            return Err(LowerError::internal("class member with a non-class callable kind"))
        }
    }

    Ok(Body {
        vars: builder.vars,
        stmts,
        returns_value: callable.returns_value,
    })
}

fn check_params<'p>(params: impl Iterator<Item = &'p Pat>) -> LowerResult<()> {
    for param in params {
        if !matches!(param, Pat::Ident(_)) {
            return Err(LowerError::unsupported("default or destructuring parameter"));
        }
    }
    Ok(())
}

struct HirBuilder<'a> {
    env: &'a EmitEnv<'a>,
    callable: &'a Callable,
    frame: ScopeId,
    scope: ScopeId,
    vars: Vec<VarInfo>,
    var_ids: HashMap<(ScopeId, JsWord), VarId>,
}

/// A resolved identifier.
enum Name {
    Place { place: Place, js: JsType, is_const: bool },
    Constant(ExprKind, JsType),
    Global,
}

impl<'a> HirBuilder<'a> {
    fn stmts(&mut self, stmts: &[AstStmt], out: &mut Vec<Stmt>) -> LowerResult<()> {
        for stmt in stmts {
            self.stmt(stmt, out)?;
        }
        Ok(())
    }

    fn nested(&mut self, stmt: &AstStmt) -> LowerResult<Vec<Stmt>> {
        let mut out = Vec::new();
        self.stmt(stmt, &mut out)?;
        Ok(out)
    }

    fn stmt(&mut self, stmt: &AstStmt, out: &mut Vec<Stmt>) -> LowerResult<()> {
        match stmt {
            AstStmt::Block(block) => {
                let scope = self
                    .env
                    .scopes
                    .block_scope(block.span)
                    .ok_or_else(|| LowerError::internal("no block scope"))?;
                let saved = std::mem::replace(&mut self.scope, scope);
                let res = self.stmts(&block.stmts, out);
                self.scope = saved;
                res?;
            }
            AstStmt::Empty(_) | AstStmt::Debugger(_) => {}
            AstStmt::Expr(expr_stmt) => out.push(Stmt::Expr(self.expr(&expr_stmt.expr)?)),
            AstStmt::Decl(Decl::Var(var_decl)) => self.var_decl(var_decl, out)?,
            // Compiled as a callable of its own; the declaration emits nothing.
            AstStmt::Decl(Decl::Fn(_)) => {}
            AstStmt::Decl(Decl::Class(_)) => return Err(LowerError::unsupported("class declaration")),
            AstStmt::If(if_stmt) => {
                let test = self.expr(&if_stmt.test)?;
                let cons = self.nested(&if_stmt.cons)?;
                let alt = match &if_stmt.alt {
                    Some(alt) => self.nested(alt)?,
                    None => Vec::new(),
                };
                out.push(Stmt::If { test, cons, alt });
            }
            AstStmt::While(while_stmt) => {
                let test = self.expr(&while_stmt.test)?;
                let body = self.nested(&while_stmt.body)?;
                out.push(Stmt::While { test, body });
            }
            AstStmt::Return(ret) => {
                let value = match &ret.arg {
                    Some(arg) => Some(self.expr(arg)?),
                    None => None,
                };
                out.push(Stmt::Return(value));
            }
            other => return Err(LowerError::unsupported(format!("statement {}", stmt_name(other)))),
        }
        Ok(())
    }

    fn var_decl(&mut self, var_decl: &VarDecl, out: &mut Vec<Stmt>) -> LowerResult<()> {
        for declarator in &var_decl.decls {
            let ident = match &declarator.name {
                Pat::Ident(ident) => &ident.id,
                _ => return Err(LowerError::unsupported("destructuring declaration")),
            };
            let var = match self.resolve(ident)? {
                Name::Place {
                    place: Place::Var(var), ..
                } => var,
                _ => return Err(LowerError::internal(format!("{} is not a local variable", ident.sym))),
            };
            match &declarator.init {
                Some(init) => {
                    let init = self.expr(init)?;
                    out.push(Stmt::Declare { var, init: Some(init) });
                }
                None if var_decl.kind != VarDeclKind::Var => out.push(Stmt::Declare { var, init: None }),
                None => {}
            }
        }
        Ok(())
    }

    fn resolve(&mut self, ident: &Ident) -> LowerResult<Name> {
        let scopes = self.env.scopes;
        let Some((decl, binding)) = scopes.resolve(self.scope, &ident.sym) else {
            return Ok(match &*ident.sym {
                "undefined" => Name::Constant(ExprKind::Undefined, JsType::Undefined),
                "NaN" => Name::Constant(ExprKind::Number(f64::NAN), JsType::Number),
                "Infinity" => Name::Constant(ExprKind::Number(f64::INFINITY), JsType::Number),
                _ => Name::Global,
            });
        };

        match binding.kind {
            BindingKind::Function | BindingKind::Class => {
                return Err(LowerError::unsupported(format!("reference to {}", ident.sym)))
            }
            BindingKind::Var | BindingKind::Let | BindingKind::Const | BindingKind::Param => {}
        }
        if binding.is_captured || scopes.function_of(decl) != self.frame {
            return Err(LowerError::unsupported(format!("captured binding {}", ident.sym)));
        }

        let place = if binding.kind == BindingKind::Param {
            let index = binding
                .param_index
                .ok_or_else(|| LowerError::internal(format!("parameter {} has no position", ident.sym)))?;
            Place::Arg(self.callable.first_param + index)
        } else {
            let key = (decl, binding.name.clone());
            let var = match self.var_ids.get(&key) {
                Some(var) => *var,
                None => {
                    let var = u16::try_from(self.vars.len())
                        .map(VarId)
                        .map_err(|_| LowerError::unsupported("more than 65535 variables"))?;
                    self.vars.push(VarInfo {
                        name: binding.name.clone(),
                        storage: binding.storage_type(),
                        js: binding.js_type(),
                    });
                    self.var_ids.insert(key, var);
                    var
                }
            };
            Place::Var(var)
        };
        Ok(Name::Place {
            place,
            js: binding.js_type(),
            is_const: binding.kind == BindingKind::Const,
        })
    }

    fn storage(&self, place: Place) -> ClrType {
        match place {
            Place::Var(var) => self.vars[var.0 as usize].storage,
            Place::Arg(_) => ClrType::Object,
        }
    }

    /// A variable or parameter that can be written.
    fn writable(&mut self, ident: &Ident) -> LowerResult<Place> {
        match self.resolve(ident)? {
            // The direct emitter compiles the runtime TypeError.
            Name::Place { is_const: true, .. } => Err(LowerError::unsupported("assignment to a constant")),
            Name::Place { place, .. } => Ok(place),
            _ => Err(LowerError::unsupported(format!("assignment to {}", ident.sym))),
        }
    }

    fn expr(&mut self, expr: &AstExpr) -> LowerResult<Expr> {
        match expr {
            AstExpr::Lit(lit) => match lit {
                Lit::Num(num) => Ok(Expr::new(ExprKind::Number(num.value), JsType::Number)),
                Lit::Str(s) => Ok(Expr::new(ExprKind::Str(s.value.to_string()), JsType::String)),
                Lit::Bool(value) => Ok(Expr::new(ExprKind::Bool(value.value), JsType::Boolean)),
                Lit::Null(_) => Ok(Expr::new(ExprKind::Null, JsType::Null)),
                _ => Err(LowerError::unsupported("literal")),
            },
            AstExpr::Ident(ident) => match self.resolve(ident)? {
                Name::Place { place, js, .. } => Ok(Expr::new(ExprKind::Load(place), js)),
                Name::Constant(kind, js) => Ok(Expr::new(kind, js)),
                Name::Global => Err(LowerError::unsupported(format!("global {}", ident.sym))),
            },
            AstExpr::Paren(paren) => self.expr(&paren.expr),
            AstExpr::Unary(unary) => {
                let (op, js) = match unary.op {
                    AstUnaryOp::Minus => (UnaryOp::Neg, JsType::Number),
                    AstUnaryOp::Plus => (UnaryOp::Plus, JsType::Number),
                    AstUnaryOp::Bang => (UnaryOp::Not, JsType::Boolean),
                    other => return Err(LowerError::unsupported(format!("unary operator {:?}", other))),
                };
                let arg = self.expr(&unary.arg)?;
                Ok(Expr::new(ExprKind::Unary(op, Box::new(arg)), js))
            }
            AstExpr::Bin(bin) => self.binary(bin),
            AstExpr::Cond(cond) => {
                let test = self.expr(&cond.test)?;
                let cons = self.expr(&cond.cons)?;
                let alt = self.expr(&cond.alt)?;
                let js = if cons.js == alt.js { cons.js } else { JsType::Unknown };
                Ok(Expr::new(
                    ExprKind::Conditional {
                        test: Box::new(test),
                        cons: Box::new(cons),
                        alt: Box::new(alt),
                    },
                    js,
                ))
            }
            AstExpr::Assign(assign) => self.assign(assign),
            AstExpr::Update(update) => {
                let AstExpr::Ident(ident) = update.arg.as_ref() else {
                    return Err(LowerError::unsupported("update of a property"));
                };
                let place = self.writable(ident)?;
                if self.storage(place) != ClrType::Double {
                    return Err(LowerError::unsupported("update of a variable not known to be a number"));
                }
                let op = match update.op {
                    AstUpdateOp::PlusPlus => UpdateOp::Increment,
                    AstUpdateOp::MinusMinus => UpdateOp::Decrement,
                };
                Ok(Expr::new(
                    ExprKind::Update {
                        place,
                        op,
                        prefix: update.prefix,
                    },
                    JsType::Number,
                ))
            }
            AstExpr::Call(call) => self.call(call),
            AstExpr::Seq(seq) => {
                let exprs = seq
                    .exprs
                    .iter()
                    .map(|expr| self.expr(expr))
                    .collect::<LowerResult<Vec<_>>>()?;
                let js = exprs.last().map(|expr| expr.js).unwrap_or(JsType::Undefined);
                Ok(Expr::new(ExprKind::Seq(exprs), js))
            }
            other => Err(LowerError::unsupported(format!("expression {}", expr_name(other)))),
        }
    }

    fn binary(&mut self, bin: &BinExpr) -> LowerResult<Expr> {
        let logical = match bin.op {
            AstBinaryOp::LogicalAnd => Some(LogicalOp::And),
            AstBinaryOp::LogicalOr => Some(LogicalOp::Or),
            _ => None,
        };
        if let Some(op) = logical {
            let left = self.expr(&bin.left)?;
            let right = self.expr(&bin.right)?;
            let js = if left.js == right.js { left.js } else { JsType::Unknown };
            return Ok(Expr::new(ExprKind::Logical(op, Box::new(left), Box::new(right)), js));
        }

        let op = binary_op(bin.op).ok_or_else(|| LowerError::unsupported(format!("binary operator {:?}", bin.op)))?;
        // `x == null` needs the null-or-undefined test of the direct emitter.
        if op.is_equality() && (is_nullish_literal(&bin.left) || is_nullish_literal(&bin.right)) {
            return Err(LowerError::unsupported("comparison with a nullish literal"));
        }
        let left = self.expr(&bin.left)?;
        let right = self.expr(&bin.right)?;
        let js = binary_js_type(op, left.js, right.js);
        Ok(Expr::new(ExprKind::Binary(op, Box::new(left), Box::new(right)), js))
    }

    fn assign(&mut self, assign: &AssignExpr) -> LowerResult<Expr> {
        let ident = match &assign.left {
            PatOrExpr::Expr(expr) => match expr.as_ref() {
                AstExpr::Ident(ident) => ident,
                _ => return Err(LowerError::unsupported("assignment to a property")),
            },
            PatOrExpr::Pat(pat) => match pat.as_ref() {
                Pat::Ident(ident) => &ident.id,
                Pat::Expr(expr) => match expr.as_ref() {
                    AstExpr::Ident(ident) => ident,
                    _ => return Err(LowerError::unsupported("assignment to a property")),
                },
                _ => return Err(LowerError::unsupported("destructuring assignment")),
            },
        };
        let op = match assign.op {
            AssignOp::Assign => None,
            AssignOp::AddAssign => Some(BinaryOp::Add),
            AssignOp::SubAssign => Some(BinaryOp::Sub),
            AssignOp::MulAssign => Some(BinaryOp::Mul),
            AssignOp::DivAssign => Some(BinaryOp::Div),
            AssignOp::ModAssign => Some(BinaryOp::Rem),
            other => return Err(LowerError::unsupported(format!("assignment operator {:?}", other))),
        };
        let place = self.writable(ident)?;
        let value = self.expr(&assign.right)?;

        let value_js = match op {
            None => value.js,
            Some(op) => {
                let current = match place {
                    Place::Var(var) => self.vars[var.0 as usize].js,
                    Place::Arg(_) => JsType::Unknown,
                };
                binary_js_type(op, current, value.js)
            }
        };
        let js = match self.storage(place) {
            ClrType::Double => JsType::Number,
            ClrType::Boolean => JsType::Boolean,
            _ => value_js,
        };
        Ok(Expr::new(
            ExprKind::Assign {
                place,
                op,
                value: Box::new(value),
            },
            js,
        ))
    }

    fn call(&mut self, call: &CallExpr) -> LowerResult<Expr> {
        let Callee::Expr(callee) = &call.callee else {
            return Err(LowerError::unsupported("super or import call"));
        };
        let cap = self.intrinsic(callee)?;
        if cap.dispatch == Dispatch::Getter {
            return Err(LowerError::unsupported(format!("calling property {}", cap.name)));
        }

        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            if arg.spread.is_some() {
                return Err(LowerError::unsupported("spread argument"));
            }
            args.push(self.expr(&arg.expr)?);
        }
        let js = match cap.returns {
            ReturnKind::Void => JsType::Undefined,
            ReturnKind::Object => JsType::Unknown,
            ReturnKind::String => JsType::String,
            ReturnKind::Double => JsType::Number,
            ReturnKind::Boolean => JsType::Boolean,
        };
        Ok(Expr::new(ExprKind::IntrinsicCall { cap, args }, js))
    }

    /// The host method named by a call's callee.
    fn intrinsic(&mut self, callee: &AstExpr) -> LowerResult<&'static Capability> {
        match callee {
            AstExpr::Ident(ident) => match self.resolve(ident)? {
                Name::Global => capability(IntrinsicKind::Global, &ident.sym)
                    .ok_or_else(|| LowerError::unsupported(format!("call to {}", ident.sym))),
                _ => Err(LowerError::unsupported(format!("call through {}", ident.sym))),
            },
            AstExpr::Member(member) => {
                let (AstExpr::Ident(obj), MemberProp::Ident(prop)) = (member.obj.as_ref(), &member.prop) else {
                    return Err(LowerError::unsupported("call on a computed receiver"));
                };
                let kind = IntrinsicKind::from_global_name(&obj.sym);
                match (kind, self.resolve(obj)?) {
                    (Some(kind), Name::Global) => capability(kind, &prop.sym)
                        .ok_or_else(|| LowerError::unsupported(format!("call to {}.{}", obj.sym, prop.sym))),
                    _ => Err(LowerError::unsupported(format!("method call on {}", obj.sym))),
                }
            }
            other => Err(LowerError::unsupported(format!("call through {}", expr_name(other)))),
        }
    }
}

fn binary_op(op: AstBinaryOp) -> Option<BinaryOp> {
    Some(match op {
        AstBinaryOp::Add => BinaryOp::Add,
        AstBinaryOp::Sub => BinaryOp::Sub,
        AstBinaryOp::Mul => BinaryOp::Mul,
        AstBinaryOp::Div => BinaryOp::Div,
        AstBinaryOp::Mod => BinaryOp::Rem,
        AstBinaryOp::Lt => BinaryOp::Lt,
        AstBinaryOp::Gt => BinaryOp::Gt,
        AstBinaryOp::LtEq => BinaryOp::LtEq,
        AstBinaryOp::GtEq => BinaryOp::GtEq,
        AstBinaryOp::EqEq => BinaryOp::LooseEq,
        AstBinaryOp::NotEq => BinaryOp::LooseNe,
        AstBinaryOp::EqEqEq => BinaryOp::StrictEq,
        AstBinaryOp::NotEqEq => BinaryOp::StrictNe,
        _ => return None,
    })
}

fn binary_js_type(op: BinaryOp, left: JsType, right: JsType) -> JsType {
    match op {
        BinaryOp::Add if left == JsType::Number && right == JsType::Number => JsType::Number,
        BinaryOp::Add if left == JsType::String || right == JsType::String => JsType::String,
        BinaryOp::Add => JsType::Unknown,
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => JsType::Number,
        _ => JsType::Boolean,
    }
}

fn is_nullish_literal(expr: &AstExpr) -> bool {
    match expr {
        AstExpr::Lit(Lit::Null(_)) => true,
        AstExpr::Ident(ident) => &*ident.sym == "undefined",
        AstExpr::Unary(unary) => unary.op == AstUnaryOp::Void,
        AstExpr::Paren(paren) => is_nullish_literal(&paren.expr),
        _ => false,
    }
}

fn stmt_name(stmt: &AstStmt) -> &'static str {
    match stmt {
        AstStmt::DoWhile(_) => "do-while",
        AstStmt::For(_) => "for",
        AstStmt::ForIn(_) => "for-in",
        AstStmt::ForOf(_) => "for-of",
        AstStmt::Switch(_) => "switch",
        AstStmt::Break(_) => "break",
        AstStmt::Continue(_) => "continue",
        AstStmt::Throw(_) => "throw",
        AstStmt::Try(_) => "try",
        AstStmt::Labeled(_) => "labeled",
        AstStmt::With(_) => "with",
        AstStmt::Decl(_) => "declaration",
        _ => "other",
    }
}

fn expr_name(expr: &AstExpr) -> &'static str {
    match expr {
        AstExpr::This(_) => "this",
        AstExpr::Array(_) => "array literal",
        AstExpr::Object(_) => "object literal",
        AstExpr::Fn(_) => "function expression",
        AstExpr::Arrow(_) => "arrow function",
        AstExpr::Member(_) => "member access",
        AstExpr::SuperProp(_) => "super property",
        AstExpr::New(_) => "new",
        AstExpr::Tpl(_) => "template literal",
        AstExpr::TaggedTpl(_) => "tagged template",
        AstExpr::Class(_) => "class expression",
        AstExpr::Call(_) => "call",
        _ => "other",
    }
}

//
// HIR → LIR
//

pub(super) fn lower_hir(body: &Body) -> LowerResult<Lir> {
    let mut lowering = Lowering {
        body,
        b: LirBuilder::new(),
    };
    lowering.stmts(&body.stmts)?;
    lowering.emit_return(None)?;
    let vars = body.vars.iter().map(|var| var.storage).collect();
    Ok(lowering.b.finish(vars, body.returns_value))
}

struct Lowering<'h> {
    body: &'h Body,
    b: LirBuilder,
}

impl<'h> Lowering<'h> {
    fn stmts(&mut self, stmts: &[Stmt]) -> LowerResult<()> {
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> LowerResult<()> {
        match stmt {
            Stmt::Expr(expr) => {
                self.expr(expr)?;
            }
            Stmt::Declare { var, init } => {
                let place = Place::Var(*var);
                let value = match init {
                    Some(init) => self.expr(init)?,
                    None => self.constant(Constant::Undefined),
                };
                let value = self.to_storage(value, self.body.storage(place));
                self.b.push(Instr::Store { place, src: value });
            }
            Stmt::If { test, cons, alt } => {
                let cond = self.condition(test)?;
                let else_label = self.b.new_label();
                self.b.push(Instr::Branch {
                    cond,
                    if_true: false,
                    target: else_label,
                });
                self.stmts(cons)?;
                if alt.is_empty() {
                    self.b.push(Instr::Label(else_label));
                } else {
                    let end = self.b.new_label();
                    self.b.push(Instr::Jump(end));
                    self.b.push(Instr::Label(else_label));
                    self.stmts(alt)?;
                    self.b.push(Instr::Label(end));
                }
            }
            Stmt::While { test, body } => {
                let top = self.b.new_label();
                let end = self.b.new_label();
                self.b.push(Instr::Label(top));
                let cond = self.condition(test)?;
                self.b.push(Instr::Branch {
                    cond,
                    if_true: false,
                    target: end,
                });
                self.stmts(body)?;
                self.b.push(Instr::Jump(top));
                self.b.push(Instr::Label(end));
            }
            Stmt::Return(value) => self.emit_return(value.as_ref())?,
        }
        Ok(())
    }

    fn emit_return(&mut self, value: Option<&Expr>) -> LowerResult<()> {
        let value = match value {
            Some(value) => Some(self.expr(value)?),
            None => None,
        };
        if !self.body.returns_value {
            self.b.push(Instr::Return(None));
            return Ok(());
        }
        let value = match value {
            Some(value) => value,
            None => self.constant(Constant::Undefined),
        };
        let value = self.to_object(value);
        self.b.push(Instr::Return(Some(value)));
        Ok(())
    }

    fn condition(&mut self, test: &Expr) -> LowerResult<Temp> {
        let value = self.expr(test)?;
        Ok(self.truthy(value))
    }

    fn new_temp(&mut self, repr: ClrType, js: JsType) -> Temp {
        self.b.new_temp(ValueStorage::of(repr, js), js)
    }

    fn constant(&mut self, value: Constant) -> Temp {
        let (repr, js) = match &value {
            Constant::Number(_) => (ClrType::Double, JsType::Number),
            Constant::Str(_) => (ClrType::String, JsType::String),
            Constant::Bool(_) => (ClrType::Boolean, JsType::Boolean),
            Constant::Undefined => (ClrType::Object, JsType::Undefined),
            Constant::Null => (ClrType::Object, JsType::Null),
        };
        let dst = self.new_temp(repr, js);
        self.b.push(Instr::Const { dst, value });
        dst
    }

    fn expr(&mut self, expr: &Expr) -> LowerResult<Temp> {
        match &expr.kind {
            ExprKind::Number(value) => Ok(self.constant(Constant::Number(*value))),
            ExprKind::Str(value) => Ok(self.constant(Constant::Str(value.clone()))),
            ExprKind::Bool(value) => Ok(self.constant(Constant::Bool(*value))),
            ExprKind::Undefined => Ok(self.constant(Constant::Undefined)),
            ExprKind::Null => Ok(self.constant(Constant::Null)),
            ExprKind::Load(place) => {
                let dst = self.new_temp(self.body.storage(*place), self.body.js_type(*place));
                self.b.push(Instr::Load { dst, place: *place });
                Ok(dst)
            }
            ExprKind::Unary(op, arg) => {
                let value = self.expr(arg)?;
                Ok(match op {
                    UnaryOp::Plus => self.to_double(value),
                    UnaryOp::Neg => {
                        let src = self.to_double(value);
                        let dst = self.new_temp(ClrType::Double, JsType::Number);
                        self.b.push(Instr::Unary { dst, op: UnOp::Neg, src });
                        dst
                    }
                    UnaryOp::Not => {
                        let src = self.truthy(value);
                        self.not(src)
                    }
                })
            }
            ExprKind::Binary(op, left, right) => {
                let left = self.expr(left)?;
                self.apply_binary(*op, left, right)
            }
            ExprKind::Logical(..) => Err(LowerError::unsupported("logical operator in value position")),
            ExprKind::Conditional { .. } => Err(LowerError::unsupported("conditional expression")),
            ExprKind::Assign { place, op, value } => {
                let value = match op {
                    None => self.expr(value)?,
                    Some(op) => {
                        let current = self.expr(&Expr::new(ExprKind::Load(*place), self.body.js_type(*place)))?;
                        self.apply_binary(*op, current, value)?
                    }
                };
                let value = self.to_storage(value, self.body.storage(*place));
                self.b.push(Instr::Store {
                    place: *place,
                    src: value,
                });
                Ok(value)
            }
            ExprKind::Update { place, op, prefix } => {
                if self.body.storage(*place) != ClrType::Double {
                    return Err(LowerError::internal("update of a variable not stored as float64"));
                }
                let dst = self.new_temp(ClrType::Double, JsType::Number);
                self.b.push(Instr::Update {
                    dst,
                    place: *place,
                    op: *op,
                    prefix: *prefix,
                });
                Ok(dst)
            }
            ExprKind::IntrinsicCall { cap, args } => self.intrinsic_call(cap, args),
            ExprKind::Seq(exprs) => {
                let mut last = None;
                for expr in exprs {
                    last = Some(self.expr(expr)?);
                }
                match last {
                    Some(last) => Ok(last),
                    None => Err(LowerError::internal("empty sequence")),
                }
            }
        }
    }

    /// `left op right`, with `left` already evaluated.
    fn apply_binary(&mut self, op: BinaryOp, left: Temp, right: &Expr) -> LowerResult<Temp> {
        if matches!(op, BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem) {
            let a = self.to_double(left);
            let right = self.expr(right)?;
            let b = self.to_double(right);
            let dst = self.new_temp(ClrType::Double, JsType::Number);
            let op = match op {
                BinaryOp::Mul => ArithOp::Mul,
                BinaryOp::Div => ArithOp::Div,
                _ => ArithOp::Rem,
            };
            self.b.push(Instr::Arith { dst, op, a, b });
            return Ok(dst);
        }

        let right = self.expr(right)?;
        let left_info = self.b.info(left);
        let right_info = self.b.info(right);
        let both_numbers = left_info.js == JsType::Number && right_info.js == JsType::Number;

        match op {
            BinaryOp::Add | BinaryOp::Sub if both_numbers => {
                let a = self.to_double(left);
                let b = self.to_double(right);
                let dst = self.new_temp(ClrType::Double, JsType::Number);
                let op = if op == BinaryOp::Add { ArithOp::Add } else { ArithOp::Sub };
                self.b.push(Instr::Arith { dst, op, a, b });
                Ok(dst)
            }
            BinaryOp::Add | BinaryOp::Sub => {
                let a = self.to_object(left);
                let b = self.to_object(right);
                let (func, js) = if op == BinaryOp::Add {
                    (RuntimeFn::Add, binary_js_type(op, left_info.js, right_info.js))
                } else {
                    (RuntimeFn::Subtract, JsType::Number)
                };
                let dst = self.new_temp(ClrType::Object, js);
                self.b.push(Instr::CallRuntime {
                    dst,
                    func,
                    args: vec![a, b],
                });
                Ok(dst)
            }
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::LtEq | BinaryOp::GtEq if both_numbers => {
                let a = self.to_double(left);
                let b = self.to_double(right);
                let op = match op {
                    BinaryOp::Lt => CmpOp::Lt,
                    BinaryOp::Gt => CmpOp::Gt,
                    BinaryOp::LtEq => CmpOp::Le,
                    _ => CmpOp::Ge,
                };
                Ok(self.cmp(op, a, b))
            }
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::LtEq | BinaryOp::GtEq => {
                let func = match op {
                    BinaryOp::Lt => RuntimeFn::LessThan,
                    BinaryOp::Gt => RuntimeFn::GreaterThan,
                    BinaryOp::LtEq => RuntimeFn::LessThanOrEqual,
                    _ => RuntimeFn::GreaterThanOrEqual,
                };
                Ok(self.runtime_predicate(func, left, right))
            }
            BinaryOp::LooseEq | BinaryOp::LooseNe | BinaryOp::StrictEq | BinaryOp::StrictNe => {
                let negate = matches!(op, BinaryOp::LooseNe | BinaryOp::StrictNe);
                let both_bools = left_info.storage == ValueStorage::UnboxedValue(ClrType::Boolean)
                    && right_info.storage == ValueStorage::UnboxedValue(ClrType::Boolean);
                if both_numbers || both_bools {
                    let a = if both_numbers { self.to_double(left) } else { left };
                    let b = if both_numbers { self.to_double(right) } else { right };
                    return Ok(self.cmp(if negate { CmpOp::Ne } else { CmpOp::Eq }, a, b));
                }
                let func = if matches!(op, BinaryOp::StrictEq | BinaryOp::StrictNe) {
                    RuntimeFn::StrictEquals
                } else {
                    RuntimeFn::LooseEquals
                };
                let equal = self.runtime_predicate(func, left, right);
                Ok(if negate { self.not(equal) } else { equal })
            }
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                Err(LowerError::internal("arithmetic operator reached the generic path"))
            }
        }
    }

    fn cmp(&mut self, op: CmpOp, a: Temp, b: Temp) -> Temp {
        let dst = self.new_temp(ClrType::Boolean, JsType::Boolean);
        self.b.push(Instr::Cmp { dst, op, a, b });
        dst
    }

    fn not(&mut self, src: Temp) -> Temp {
        let dst = self.new_temp(ClrType::Boolean, JsType::Boolean);
        self.b.push(Instr::Unary { dst, op: UnOp::Not, src });
        dst
    }

    fn runtime_predicate(&mut self, func: RuntimeFn, left: Temp, right: Temp) -> Temp {
        let a = self.to_object(left);
        let b = self.to_object(right);
        let dst = self.new_temp(ClrType::Boolean, JsType::Boolean);
        self.b.push(Instr::CallRuntime {
            dst,
            func,
            args: vec![a, b],
        });
        dst
    }

    fn intrinsic_call(&mut self, cap: &'static Capability, args: &[Expr]) -> LowerResult<Temp> {
        let receiver = match cap.dispatch {
            Dispatch::Instance => {
                let dst = self.new_temp(ClrType::Object, JsType::Object);
                self.b.push(Instr::CallRuntime {
                    dst,
                    func: RuntimeFn::GetIntrinsicGlobal(cap.receiver),
                    args: Vec::new(),
                });
                Some(dst)
            }
            Dispatch::Static => None,
            Dispatch::Getter => return Err(LowerError::internal("getter called as a method")),
        };

        let mut call_args = Vec::new();
        match cap.shape {
            CallShape::ParamsArray => {
                let array = self.new_temp(ClrType::ObjectArray, JsType::Object);
                self.b.push(Instr::NewArgsArray {
                    dst: array,
                    len: args.len() as u32,
                });
                for (ndx, arg) in args.iter().enumerate() {
                    let value = self.expr(arg)?;
                    let value = self.to_object(value);
                    self.b.push(Instr::StoreElem {
                        array,
                        index: ndx as u32,
                        value,
                    });
                }
                call_args.push(array);
            }
            CallShape::Fixed(params) => {
                for (ndx, arg) in args.iter().enumerate() {
                    let value = self.expr(arg)?;
                    match params.get(ndx) {
                        Some(ArgKind::Object) => call_args.push(self.to_object(value)),
                        Some(ArgKind::Double) => call_args.push(self.to_double(value)),
                        // Evaluated for its effects only.
                        None => {}
                    }
                }
                for kind in params.iter().skip(args.len()) {
                    let padding = match kind {
                        ArgKind::Object => self.constant(Constant::Undefined),
                        ArgKind::Double => self.constant(Constant::Number(f64::NAN)),
                    };
                    call_args.push(padding);
                }
            }
        }

        let dst = cap.returns.clr_type().map(|repr| {
            let js = match cap.returns {
                ReturnKind::String => JsType::String,
                ReturnKind::Double => JsType::Number,
                ReturnKind::Boolean => JsType::Boolean,
                ReturnKind::Object | ReturnKind::Void => JsType::Unknown,
            };
            self.new_temp(repr, js)
        });
        self.b.push(Instr::CallIntrinsic {
            dst,
            cap,
            receiver,
            args: call_args,
        });
        Ok(match dst {
            Some(dst) => dst,
            None => self.constant(Constant::Undefined),
        })
    }

    //
    // Conversions
    //

    fn to_object(&mut self, value: Temp) -> Temp {
        let info = self.b.info(value);
        if !info.storage.is_unboxed() {
            return value;
        }
        let dst = self.new_temp(ClrType::Object, info.js);
        self.b.push(Instr::Box { dst, src: value });
        dst
    }

    fn to_double(&mut self, value: Temp) -> Temp {
        if self.b.info(value).storage == ValueStorage::UnboxedValue(ClrType::Double) {
            return value;
        }
        let dst = self.new_temp(ClrType::Double, JsType::Number);
        self.b.push(Instr::Coerce {
            dst,
            src: value,
            to: ClrType::Double,
        });
        dst
    }

    fn truthy(&mut self, value: Temp) -> Temp {
        if self.b.info(value).storage == ValueStorage::UnboxedValue(ClrType::Boolean) {
            return value;
        }
        let dst = self.new_temp(ClrType::Boolean, JsType::Boolean);
        self.b.push(Instr::Truthy { dst, src: value });
        dst
    }

    fn to_storage(&mut self, value: Temp, storage: ClrType) -> Temp {
        match storage {
            ClrType::Double => self.to_double(value),
            ClrType::Boolean => self.truthy(value),
            _ => self.to_object(value),
        }
    }
}
