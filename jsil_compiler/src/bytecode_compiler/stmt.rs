use swc_common::Spanned;
use swc_common::Span;
use swc_ecma_ast::{
    BlockStmt, ClassDecl, Decl, DoWhileStmt, Expr, ForHead, ForStmt, IfStmt, LabeledStmt, Pat, ReturnStmt, Stmt,
    SwitchStmt, TryStmt, VarDecl, VarDeclKind, VarDeclOrExpr, WhileStmt,
};

use super::operators::compile_branch;
use super::{compile_expr, compile_expr_discard, Emitted, FnBuilder, Resolved};
use crate::bytecode::{ClrType, Instr};
use crate::common::Result;
use crate::coordinator::CallableKind;
use crate::runtime::RuntimeFn;
use crate::scope::{BindingKind, ClassRef};
use crate::variables::emit_coerce;
use crate::{error, unsupported_node};

pub(crate) fn compile_stmts(b: &mut FnBuilder<'_>, stmts: &[Stmt]) -> Result<()> {
    for stmt in stmts {
        compile_stmt(b, stmt)?;
    }
    Ok(())
}

fn compile_block(b: &mut FnBuilder<'_>, block: &BlockStmt) -> Result<()> {
    b.in_block(block.span, |b| compile_stmts(b, &block.stmts))
}

pub(crate) fn compile_stmt(b: &mut FnBuilder<'_>, stmt: &Stmt) -> Result<()> {
    match stmt {
        Stmt::Block(block) => compile_block(b, block),
        Stmt::Empty(_) | Stmt::Debugger(_) => Ok(()),
        Stmt::Expr(expr_stmt) => compile_expr_discard(b, &expr_stmt.expr),
        Stmt::Decl(decl) => compile_decl(b, decl),
        Stmt::If(if_stmt) => compile_if(b, if_stmt),
        Stmt::While(while_stmt) => compile_while(b, while_stmt),
        Stmt::DoWhile(do_while) => compile_do_while(b, do_while),
        Stmt::For(for_stmt) => compile_for(b, for_stmt),
        Stmt::ForOf(for_of) => {
            if for_of.is_await {
                return Err(unsupported_node!("for await", for_of.span));
            }
            compile_indexed_loop(b, for_of.span, &for_of.left, &for_of.right, &for_of.body, LoopOver::Values)
        }
        Stmt::ForIn(for_in) => {
            compile_indexed_loop(b, for_in.span, &for_in.left, &for_in.right, &for_in.body, LoopOver::Keys)
        }
        Stmt::Switch(switch) => compile_switch(b, switch),
        Stmt::Break(brk) => b.emit_jump(false, brk.label.as_ref().map(|label| &label.sym), brk.span),
        Stmt::Continue(cont) => b.emit_jump(true, cont.label.as_ref().map(|label| &label.sym), cont.span),
        Stmt::Return(ret) => compile_return(b, ret),
        Stmt::Throw(throw) => {
            let value = compile_expr(b, &throw.arg)?;
            b.to_object(value);
            b.call_runtime(RuntimeFn::WrapException);
            b.emit(Instr::Throw);
            Ok(())
        }
        Stmt::Try(try_stmt) => compile_try(b, try_stmt),
        Stmt::Labeled(labeled) => compile_labeled(b, labeled),
        Stmt::With(with) => Err(unsupported_node!("with statement", with.span)),
    }
}

fn compile_labeled(b: &mut FnBuilder<'_>, labeled: &LabeledStmt) -> Result<()> {
    b.add_pending_label(labeled.label.sym.clone());
    let res = match labeled.body.as_ref() {
        body @ (Stmt::Labeled(_)
        | Stmt::While(_)
        | Stmt::DoWhile(_)
        | Stmt::For(_)
        | Stmt::ForOf(_)
        | Stmt::ForIn(_)) => compile_stmt(b, body),
        body => {
            let end = b.new_label();
            b.push_labeled_target(end);
            let res = compile_stmt(b, body);
            b.pop_jump_targets();
            b.place(end);
            res
        }
    };
    b.clear_pending_labels();
    res
}

fn compile_decl(b: &mut FnBuilder<'_>, decl: &Decl) -> Result<()> {
    match decl {
        Decl::Var(var_decl) => compile_var_decl(b, var_decl),
        // Hoisted: the method exists already and calls bind to it directly.
        Decl::Fn(_) => Ok(()),
        Decl::Class(class_decl) => compile_class_decl(b, class_decl),
        other => Err(unsupported_node!("declaration", other.span())),
    }
}

fn compile_var_decl(b: &mut FnBuilder<'_>, var_decl: &VarDecl) -> Result<()> {
    for declarator in &var_decl.decls {
        let ident = match &declarator.name {
            Pat::Ident(ident) => &ident.id,
            other => return Err(unsupported_node!("destructuring declaration", other.span())),
        };
        let var = match b.resolve(&ident.sym, ident.span)? {
            Resolved::Binding { var, .. } => var,
            _ => return Err(error!("internal: {} is not a variable", ident.sym).with_span(ident.span)),
        };

        match &declarator.init {
            Some(init) => {
                var.emit_instance(b.out());
                let value = compile_expr(b, init)?;
                b.to_storage(value, var.storage());
                var.emit_store(b.out());
            }
            // `let x;` inside a loop starts over as undefined on every
            // iteration; `var x;` keeps its value.
            None if var_decl.kind != VarDeclKind::Var => {
                var.emit_instance(b.out());
                b.emit(Instr::Ldnull);
                emit_coerce(b.out(), ClrType::Object, var.storage());
                var.emit_store(b.out());
            }
            None => {}
        }
    }
    Ok(())
}

/// Classes are declared up front; only the static field initializers run
/// where the declaration appears.
fn compile_class_decl(b: &mut FnBuilder<'_>, class_decl: &ClassDecl) -> Result<()> {
    let class_ref = ClassRef {
        decl: b.scope(),
        name: class_decl.ident.sym.clone(),
    };
    let class = b
        .env()
        .classes
        .by_ref(&class_ref)
        .ok_or_else(|| error!("internal: class {} was not declared", class_decl.ident.sym).with_span(class_decl.class.span))?;
    crate::classes::emit_static_initializers(b, class, &class_decl.class)
}

fn compile_if(b: &mut FnBuilder<'_>, if_stmt: &IfStmt) -> Result<()> {
    let otherwise = b.new_label();
    compile_branch(b, &if_stmt.test, false, otherwise)?;
    compile_stmt(b, &if_stmt.cons)?;
    match &if_stmt.alt {
        Some(alt) => {
            let end = b.new_label();
            b.emit(Instr::Br(end));
            b.place(otherwise);
            compile_stmt(b, alt)?;
            b.place(end);
        }
        None => b.place(otherwise),
    }
    Ok(())
}

fn compile_while(b: &mut FnBuilder<'_>, while_stmt: &WhileStmt) -> Result<()> {
    let top = b.new_label();
    let end = b.new_label();
    b.place(top);
    compile_branch(b, &while_stmt.test, false, end)?;
    b.push_jump_targets(end, Some(top));
    let res = compile_stmt(b, &while_stmt.body);
    b.pop_jump_targets();
    res?;
    b.emit(Instr::Br(top));
    b.place(end);
    Ok(())
}

fn compile_do_while(b: &mut FnBuilder<'_>, do_while: &DoWhileStmt) -> Result<()> {
    let top = b.new_label();
    let test = b.new_label();
    let end = b.new_label();
    b.place(top);
    b.push_jump_targets(end, Some(test));
    let res = compile_stmt(b, &do_while.body);
    b.pop_jump_targets();
    res?;
    b.place(test);
    compile_branch(b, &do_while.test, true, top)?;
    b.place(end);
    Ok(())
}

/// Captured `let` bindings of the head get a fresh frame per iteration,
/// holding the values the previous iteration left.
fn compile_for(b: &mut FnBuilder<'_>, for_stmt: &ForStmt) -> Result<()> {
    b.in_block(for_stmt.span, |b| {
        match &for_stmt.init {
            Some(VarDeclOrExpr::VarDecl(var_decl)) => compile_var_decl(b, var_decl)?,
            Some(VarDeclOrExpr::Expr(expr)) => compile_expr_discard(b, expr)?,
            None => {}
        }
        b.renew_block_frame(b.scope(), true, for_stmt.span)?;

        let top = b.new_label();
        let next = b.new_label();
        let end = b.new_label();
        b.place(top);
        if let Some(test) = &for_stmt.test {
            compile_branch(b, test, false, end)?;
        }
        b.push_jump_targets(end, Some(next));
        let res = compile_stmt(b, &for_stmt.body);
        b.pop_jump_targets();
        res?;
        b.place(next);
        b.renew_block_frame(b.scope(), true, for_stmt.span)?;
        if let Some(update) = &for_stmt.update {
            compile_expr_discard(b, update)?;
        }
        b.emit(Instr::Br(top));
        b.place(end);
        Ok(())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopOver {
    /// `for (x of xs)`: the elements of an array-like.
    Values,
    /// `for (k in o)`: the enumerable keys of `o`.
    Keys,
}

/// `for...of` and `for...in`, by index over an array-like.  A captured loop
/// binding gets a fresh frame per iteration.
fn compile_indexed_loop(
    b: &mut FnBuilder<'_>,
    span: Span,
    left: &ForHead,
    right: &Expr,
    body: &Stmt,
    over: LoopOver,
) -> Result<()> {
    let what = match over {
        LoopOver::Values => "for...of",
        LoopOver::Keys => "for...in",
    };
    let iterable = compile_expr(b, right)?;
    b.to_object(iterable);
    if over == LoopOver::Keys {
        b.call_runtime(RuntimeFn::GetKeys);
    }
    let iterable = b.temp(ClrType::Object);
    b.emit(Instr::Stloc(iterable));
    let index = b.temp(ClrType::Double);
    b.emit(Instr::LdcR8(0.0));
    b.emit(Instr::Stloc(index));

    let res = b.in_block(span, |b| {
        let top = b.new_label();
        let next = b.new_label();
        let end = b.new_label();

        b.place(top);
        b.emit(Instr::Ldloc(index));
        b.emit(Instr::Ldloc(iterable));
        b.call_runtime(RuntimeFn::GetLength);
        b.emit(Instr::Clt);
        b.emit(Instr::Brfalse(end));

        let (ident, is_decl) = match left {
            ForHead::VarDecl(var_decl) => match var_decl.decls.as_slice() {
                [declarator] => match &declarator.name {
                    Pat::Ident(ident) => (&ident.id, true),
                    other => return Err(unsupported_node!(format!("destructuring in {}", what), other.span())),
                },
                _ => return Err(unsupported_node!(format!("{} with several declarations", what), var_decl.span)),
            },
            ForHead::Pat(pat) => match pat.as_ref() {
                Pat::Ident(ident) => (&ident.id, false),
                other => return Err(unsupported_node!(format!("destructuring in {}", what), other.span())),
            },
            ForHead::UsingDecl(using) => return Err(unsupported_node!("using declaration", using.span)),
        };
        let (binding, var) = match b.resolve(&ident.sym, ident.span)? {
            Resolved::Binding { binding, var, .. } => (binding, var),
            _ => return Err(unsupported_node!(format!("{} target", what), ident.span)),
        };
        if !is_decl && binding.kind == BindingKind::Const {
            return Err(unsupported_node!(format!("{} assigning a const binding", what), ident.span));
        }

        b.renew_block_frame(b.scope(), false, span)?;
        b.emit(Instr::Ldloc(iterable));
        b.emit(Instr::Ldloc(index));
        b.emit(Instr::Box(ClrType::Double));
        b.call_runtime(RuntimeFn::GetItem);
        b.store_from_stack(var, Emitted::unknown());

        b.push_jump_targets(end, Some(next));
        let res = compile_stmt(b, body);
        b.pop_jump_targets();
        res?;

        b.place(next);
        b.emit(Instr::Ldloc(index));
        b.emit(Instr::LdcR8(1.0));
        b.emit(Instr::Add);
        b.emit(Instr::Stloc(index));
        b.emit(Instr::Br(top));
        b.place(end);
        Ok(())
    });

    b.release(ClrType::Object, iterable);
    b.release(ClrType::Double, index);
    res
}

fn compile_switch(b: &mut FnBuilder<'_>, switch: &SwitchStmt) -> Result<()> {
    let value = compile_expr(b, &switch.discriminant)?;
    b.to_object(value);
    let discriminant = b.temp(ClrType::Object);
    b.emit(Instr::Stloc(discriminant));

    b.in_block(switch.span, |b| {
        let end = b.new_label();
        let labels: Vec<_> = switch.cases.iter().map(|_| b.new_label()).collect();

        let mut default = None;
        for (case, label) in switch.cases.iter().zip(&labels) {
            match &case.test {
                Some(test) => {
                    b.emit(Instr::Ldloc(discriminant));
                    let value = compile_expr(b, test)?;
                    b.to_object(value);
                    b.call_runtime(RuntimeFn::StrictEquals);
                    b.emit(Instr::Brtrue(*label));
                }
                None => default = Some(*label),
            }
        }
        b.emit(Instr::Br(default.unwrap_or(end)));
        b.release(ClrType::Object, discriminant);

        b.push_jump_targets(end, None);
        let res = switch.cases.iter().zip(&labels).try_for_each(|(case, label)| {
            b.place(*label);
            compile_stmts(b, &case.cons)
        });
        b.pop_jump_targets();
        res?;
        b.place(end);
        Ok(())
    })
}

fn compile_return(b: &mut FnBuilder<'_>, ret: &ReturnStmt) -> Result<()> {
    let callable = b.callable();
    match (callable.kind(), &ret.arg) {
        (CallableKind::Constructor, Some(arg)) => {
            let class = callable
                .class
                .ok_or_else(|| error!("internal: constructor without a class").with_span(ret.span))?;
            let field = b
                .env()
                .classes
                .get(class)
                .ctor_return_field
                .ok_or_else(|| error!("internal: constructor return value has no field").with_span(ret.span))?;
            b.emit(Instr::Ldarg(crate::bytecode::ArgIndex(0)));
            let value = compile_expr(b, arg)?;
            b.to_object(value);
            b.emit(Instr::Stfld(field));
            b.emit_return(false);
        }
        (_, Some(arg)) if callable.returns_value => {
            let value = compile_expr(b, arg)?;
            b.to_object(value);
            b.emit_return(true);
        }
        (_, Some(arg)) => {
            compile_expr_discard(b, arg)?;
            b.emit_return(false);
        }
        (_, None) if callable.returns_value => {
            b.emit(Instr::Ldnull);
            b.emit_return(true);
        }
        (_, None) => b.emit_return(false),
    }
    Ok(())
}

/// ```text
/// BeginTry     <block>  leave end
/// BeginCatch   unwrap; store param; <handler>  leave end
/// BeginFinally <finalizer>  endfinally
/// EndTry
/// end:
/// ```
fn compile_try(b: &mut FnBuilder<'_>, try_stmt: &TryStmt) -> Result<()> {
    let end = b.new_label();

    b.emit(Instr::BeginTry);
    b.enter_try();
    let res = compile_try_parts(b, try_stmt, end);
    b.exit_try();
    res?;
    b.emit(Instr::EndTry);
    b.place(end);
    Ok(())
}

fn compile_try_parts(b: &mut FnBuilder<'_>, try_stmt: &TryStmt, end: crate::bytecode::Label) -> Result<()> {
    compile_block(b, &try_stmt.block)?;
    b.emit(Instr::Leave(end));

    if let Some(handler) = &try_stmt.handler {
        b.emit(Instr::BeginCatch);
        b.call_runtime(RuntimeFn::UnwrapException);
        b.in_block(handler.span, |b| {
            match &handler.param {
                Some(Pat::Ident(ident)) => match b.resolve(&ident.id.sym, ident.id.span)? {
                    Resolved::Binding { var, .. } => b.store_from_stack(var, Emitted::unknown()),
                    _ => return Err(error!("internal: catch parameter is not a variable").with_span(ident.id.span)),
                },
                Some(other) => return Err(unsupported_node!("destructuring catch parameter", other.span())),
                None => b.emit(Instr::Pop),
            }
            compile_block(b, &handler.body)
        })?;
        b.emit(Instr::Leave(end));
    }

    if let Some(finalizer) = &try_stmt.finalizer {
        b.emit(Instr::BeginFinally);
        compile_block(b, finalizer)?;
        b.emit(Instr::EndFinally);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::bytecode::{Instr, MethodRef};
    use crate::coordinator::{compile_str, CompileFlags};
    use crate::runtime::RuntimeFn;

    fn main_body(code: &str) -> Vec<Instr> {
        let flags = CompileFlags {
            ir_pipeline: false,
            ..Default::default()
        };
        let compiled = compile_str(code, flags).unwrap();
        let handle = compiled.assembly.find_method("Program", "Main").unwrap();
        compiled.assembly.method(handle).body.clone().unwrap().instrs
    }

    #[test]
    fn test_break_inside_try_leaves() {
        let instrs = main_body("while (true) { try { break; } finally { console.log(1); } }");
        let leaves = instrs.iter().filter(|instr| matches!(instr, Instr::Leave(_))).count();
        // break, end of the protected block
        assert_eq!(leaves, 2);
        assert!(instrs.contains(&Instr::BeginFinally));
        assert!(instrs.contains(&Instr::EndTry));
    }

    #[test]
    fn test_switch_uses_strict_equality() {
        let instrs = main_body("let x = 2; switch (x) { case 1: x = 0; break; default: x = 5; }");
        assert_eq!(
            instrs
                .iter()
                .filter(|instr| **instr == Instr::Call(MethodRef::Runtime(RuntimeFn::StrictEquals)))
                .count(),
            1
        );
    }

    #[test]
    fn test_catch_unwraps_exception() {
        let instrs = main_body("try { throw new Error('x'); } catch (e) { console.log(e); }");
        let catch = instrs.iter().position(|instr| *instr == Instr::BeginCatch).unwrap();
        assert_eq!(instrs[catch + 1], Instr::Call(MethodRef::Runtime(RuntimeFn::UnwrapException)));
        assert!(instrs.contains(&Instr::Call(MethodRef::Runtime(RuntimeFn::WrapException))));
    }

    #[test]
    fn test_break_to_outer_label() {
        let instrs = main_body("outer: while (true) { while (true) { break outer; } }");
        let outer_end = instrs
            .iter()
            .rev()
            .find_map(|instr| match instr {
                Instr::Label(label) => Some(*label),
                _ => None,
            })
            .unwrap();
        assert!(instrs.contains(&Instr::Br(outer_end)));
    }

    #[test]
    fn test_labeled_block_break() {
        let instrs = main_body("done: { console.log(1); break done; console.log(2); }");
        let last_label = instrs.iter().rposition(|instr| matches!(instr, Instr::Label(_))).unwrap();
        let Instr::Label(end) = instrs[last_label] else { unreachable!() };
        assert!(instrs.contains(&Instr::Br(end)));
    }

    #[test]
    fn test_unlabeled_break_in_a_labeled_block_is_rejected() {
        assert!(compile_str("block: { break; }", CompileFlags::default()).is_err());
    }

    #[test]
    fn test_for_in_iterates_keys() {
        let instrs = main_body("for (const k in { a: 1 }) console.log(k);");
        let keys = instrs
            .iter()
            .position(|instr| *instr == Instr::Call(MethodRef::Runtime(RuntimeFn::GetKeys)))
            .unwrap();
        let length = instrs
            .iter()
            .position(|instr| *instr == Instr::Call(MethodRef::Runtime(RuntimeFn::GetLength)))
            .unwrap();
        assert!(keys < length);
    }

    #[test]
    fn test_captured_loop_binding_gets_a_frame_per_iteration() {
        let instrs = main_body("const fns = []; for (let i = 0; i < 3; i++) fns.push(() => i);");
        let frames = instrs
            .iter()
            .filter(|instr| matches!(instr, Instr::Newobj(MethodRef::User(_))))
            .count();
        // entering the loop, after the initializer, before each update
        assert_eq!(frames, 3);

        let instrs = main_body("const gs = []; for (const v of [10, 20]) gs.push(() => v);");
        let frames = instrs
            .iter()
            .filter(|instr| matches!(instr, Instr::Newobj(MethodRef::User(_))))
            .count();
        // entering the loop, then once per element
        assert_eq!(frames, 2);
    }

    #[test]
    fn test_unsupported_statement_is_reported() {
        let err = compile_str("const o = {}; with (o) { console.log(1); }", CompileFlags::default())
            .err()
            .unwrap();
        assert!(err.message().contains("unsupported: with statement"), "{}", err.message());
    }
}
