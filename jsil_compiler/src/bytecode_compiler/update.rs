//! Assignments, compound assignments and `++`/`--`.

use swc_common::{Span, Spanned};
use swc_ecma_ast::{AssignExpr, AssignOp, BinaryOp, Expr, Ident, MemberExpr, MemberProp, Pat, PatOrExpr, UpdateExpr, UpdateOp};

use super::expr::{classify_receiver, emit_receiver, instance_field, member_name, static_field, Receiver};
use super::{compile_expr, compile_expr_discard, operators, Emitted, FnBuilder, Resolved};
use crate::bytecode::{ClrType, Instr};
use crate::classes::FieldInfo;
use crate::common::Result;
use crate::runtime::{ErrorKind, RuntimeFn};
use crate::scope::builder::compound_binary_op;
use crate::scope::{Binding, BindingKind};
use crate::{error, unsupported_node};
use crate::variables::{emit_coerce, Variable};

/// Where an assignment writes.
enum Target<'b, 'e> {
    Var { binding: &'b Binding, var: Variable },
    Field { receiver: Receiver, field: FieldInfo },
    StaticField(FieldInfo),
    Named { obj: &'e Expr, name: String },
    Computed { obj: &'e Expr, key: &'e Expr },
}

fn ident_target<'b, 'e>(b: &mut FnBuilder<'b>, ident: &Ident) -> Result<Target<'b, 'e>> {
    match b.resolve(&ident.sym, ident.span)? {
        Resolved::Binding { binding, var, .. } => Ok(Target::Var { binding, var }),
        Resolved::Global => Err(unsupported_node!(format!("assignment to undeclared global {}", ident.sym), ident.span)),
        Resolved::Function(_) | Resolved::SelfName(_) | Resolved::Class(_) => Err(unsupported_node!(
            "assignment to a function or class declaration",
            ident.span
        )),
    }
}

fn member_target<'b, 'e>(b: &mut FnBuilder<'b>, member: &'e MemberExpr) -> Result<Target<'b, 'e>> {
    if let MemberProp::Computed(computed) = &member.prop {
        return Ok(Target::Computed {
            obj: &member.obj,
            key: &computed.expr,
        });
    }
    let name = member_name(&member.prop).unwrap_or_default();
    let receiver = classify_receiver(b, &member.obj)?;
    if let Some(field) = instance_field(b, &receiver, &name) {
        return Ok(Target::Field { receiver, field });
    }
    if let Some(field) = static_field(b, &receiver, &name) {
        return Ok(Target::StaticField(field));
    }
    if let Receiver::Static(_) = receiver {
        return Err(unsupported_node!(format!("assignment to static member {}", name), member.span));
    }
    if name.starts_with('#') {
        return Err(unsupported_node!("private name on an untyped receiver", member.span));
    }
    Ok(Target::Named { obj: &member.obj, name })
}

fn expr_target<'b, 'e>(b: &mut FnBuilder<'b>, expr: &'e Expr) -> Result<Target<'b, 'e>> {
    match expr {
        Expr::Paren(paren) => expr_target(b, &paren.expr),
        Expr::Ident(ident) => ident_target(b, ident),
        Expr::Member(member) => member_target(b, member),
        other => Err(unsupported_node!("assignment target", other.span())),
    }
}

fn assign_target<'b, 'e>(b: &mut FnBuilder<'b>, left: &'e PatOrExpr) -> Result<Target<'b, 'e>> {
    match left {
        PatOrExpr::Expr(expr) => expr_target(b, expr),
        PatOrExpr::Pat(pat) => match pat.as_ref() {
            Pat::Ident(ident) => ident_target(b, &ident.id),
            Pat::Expr(expr) => expr_target(b, expr),
            other => Err(unsupported_node!("destructuring assignment", other.span())),
        },
    }
}

/// Throw the `TypeError` of a write to a `const` binding.
fn emit_const_error(b: &mut FnBuilder<'_>) {
    b.emit(Instr::Ldstr("Assignment to constant variable.".to_string()));
    b.call_runtime(RuntimeFn::NewError(ErrorKind::TypeError));
    b.call_runtime(RuntimeFn::WrapException);
    b.emit(Instr::Throw);
}

fn is_const(target: &Target<'_, '_>) -> bool {
    matches!(target, Target::Var { binding, .. } if binding.kind == BindingKind::Const)
}

/// Store the value on top of the stack, with the instance (if any) below
/// it, keeping a copy of the value when `want_value` is set.
fn finish_store(
    b: &mut FnBuilder<'_>,
    value: Emitted,
    has_instance: bool,
    want_value: bool,
    store: impl FnOnce(&mut FnBuilder<'_>),
) -> Option<Emitted> {
    if !want_value {
        store(b);
        return None;
    }
    if has_instance {
        let t = b.temp(value.repr);
        b.emit(Instr::Dup);
        b.emit(Instr::Stloc(t));
        store(b);
        b.emit(Instr::Ldloc(t));
        b.release(value.repr, t);
    } else {
        b.emit(Instr::Dup);
        store(b);
    }
    Some(value)
}

/// Returns the assigned value when `want_value` is set.
pub(crate) fn compile_assign(b: &mut FnBuilder<'_>, assign: &AssignExpr, want_value: bool) -> Result<Option<Emitted>> {
    let target = assign_target(b, &assign.left)?;
    if is_const(&target) && !matches!(assign.op, AssignOp::AndAssign | AssignOp::OrAssign | AssignOp::NullishAssign) {
        compile_expr_discard(b, &assign.right)?;
        emit_const_error(b);
        return Ok(want_value.then(|| {
            b.emit(Instr::Ldnull);
            Emitted::undefined()
        }));
    }

    match assign.op {
        AssignOp::Assign => simple_assign(b, target, &assign.right, want_value),
        AssignOp::AndAssign | AssignOp::OrAssign | AssignOp::NullishAssign => {
            logical_assign(b, target, assign.op, &assign.right, want_value, assign.span)
        }
        op => {
            let bin_op = compound_binary_op(op).ok_or_else(|| unsupported_node!("assignment operator", assign.span))?;
            compound_assign(b, target, bin_op, &assign.right, want_value, assign.span)
        }
    }
}

fn simple_assign(b: &mut FnBuilder<'_>, target: Target<'_, '_>, right: &Expr, want_value: bool) -> Result<Option<Emitted>> {
    match target {
        Target::Var { var, .. } => {
            var.emit_instance(b.out());
            let value = compile_expr(b, right)?;
            let value = b.to_storage(value, var.storage());
            Ok(finish_store(b, value, var.is_field(), want_value, |b| var.emit_store(b.out())))
        }
        Target::Field { receiver, field } => {
            emit_receiver(b, &receiver);
            let value = compile_expr(b, right)?;
            let value = b.to_storage(value, field.ty);
            Ok(finish_store(b, value, true, want_value, |b| b.emit(Instr::Stfld(field.handle))))
        }
        Target::StaticField(field) => {
            let value = compile_expr(b, right)?;
            let value = b.to_storage(value, field.ty);
            Ok(finish_store(b, value, false, want_value, |b| b.emit(Instr::Stsfld(field.handle))))
        }
        Target::Named { obj, name } => {
            let obj = compile_expr(b, obj)?;
            b.to_object(obj);
            b.emit(Instr::Ldstr(name));
            let value = compile_expr(b, right)?;
            let value = b.to_object(value);
            b.call_runtime(RuntimeFn::SetProperty);
            Ok(keep_or_pop(b, value, want_value))
        }
        Target::Computed { obj, key } => {
            let obj = compile_expr(b, obj)?;
            b.to_object(obj);
            let key = compile_expr(b, key)?;
            b.to_object(key);
            let value = compile_expr(b, right)?;
            let value = b.to_object(value);
            b.call_runtime(RuntimeFn::AssignItem);
            Ok(keep_or_pop(b, value, want_value))
        }
    }
}

/// The runtime setters return the stored value.
fn keep_or_pop(b: &mut FnBuilder<'_>, value: Emitted, want_value: bool) -> Option<Emitted> {
    if want_value {
        Some(value)
    } else {
        b.emit(Instr::Pop);
        None
    }
}

fn compound_assign(
    b: &mut FnBuilder<'_>,
    target: Target<'_, '_>,
    op: BinaryOp,
    right: &Expr,
    want_value: bool,
    span: Span,
) -> Result<Option<Emitted>> {
    match target {
        Target::Var { binding, var } => {
            var.emit_instance(b.out());
            if var.is_field() {
                b.emit(Instr::Dup);
            }
            var.emit_load_from_instance(b.out());
            let current = Emitted::new(binding.js_type(), var.storage());
            let value = operators::apply_binary(b, op, current, right, span)?;
            let value = b.to_storage(value, var.storage());
            Ok(finish_store(b, value, var.is_field(), want_value, |b| var.emit_store(b.out())))
        }
        Target::Field { receiver, field } => {
            emit_receiver(b, &receiver);
            b.emit(Instr::Dup);
            b.emit(Instr::Ldfld(field.handle));
            let current = Emitted::new(field.js_type(), field.ty);
            let value = operators::apply_binary(b, op, current, right, span)?;
            let value = b.to_storage(value, field.ty);
            Ok(finish_store(b, value, true, want_value, |b| b.emit(Instr::Stfld(field.handle))))
        }
        Target::StaticField(field) => {
            b.emit(Instr::Ldsfld(field.handle));
            let current = Emitted::new(field.js_type(), field.ty);
            let value = operators::apply_binary(b, op, current, right, span)?;
            let value = b.to_storage(value, field.ty);
            Ok(finish_store(b, value, false, want_value, |b| b.emit(Instr::Stsfld(field.handle))))
        }
        Target::Named { obj, name } => {
            let obj_local = stash_object(b, obj)?;
            b.emit(Instr::Ldloc(obj_local));
            b.emit(Instr::Ldstr(name.clone()));
            b.emit(Instr::Ldloc(obj_local));
            b.emit(Instr::Ldstr(name));
            b.call_runtime(RuntimeFn::GetProperty);
            b.release(ClrType::Object, obj_local);
            let value = operators::apply_binary(b, op, Emitted::unknown(), right, span)?;
            let value = b.to_object(value);
            b.call_runtime(RuntimeFn::SetProperty);
            Ok(keep_or_pop(b, value, want_value))
        }
        Target::Computed { obj, key } => {
            let obj_local = stash_object(b, obj)?;
            let key_local = stash_object(b, key)?;
            b.emit(Instr::Ldloc(obj_local));
            b.emit(Instr::Ldloc(key_local));
            b.emit(Instr::Ldloc(obj_local));
            b.emit(Instr::Ldloc(key_local));
            b.call_runtime(RuntimeFn::GetItem);
            b.release(ClrType::Object, obj_local);
            b.release(ClrType::Object, key_local);
            let value = operators::apply_binary(b, op, Emitted::unknown(), right, span)?;
            let value = b.to_object(value);
            b.call_runtime(RuntimeFn::AssignItem);
            Ok(keep_or_pop(b, value, want_value))
        }
    }
}

/// Evaluate `expr` into a fresh object temp.
fn stash_object(b: &mut FnBuilder<'_>, expr: &Expr) -> Result<crate::bytecode::LocalIndex> {
    let value = compile_expr(b, expr)?;
    b.to_object(value);
    let local = b.temp(ClrType::Object);
    b.emit(Instr::Stloc(local));
    Ok(local)
}

/// `a &&= b`, `a ||= b`, `a ??= b`: the store happens only when `b` is
/// evaluated.
fn logical_assign(
    b: &mut FnBuilder<'_>,
    target: Target<'_, '_>,
    op: AssignOp,
    right: &Expr,
    want_value: bool,
    span: Span,
) -> Result<Option<Emitted>> {
    let end = b.new_label();

    let current = match &target {
        Target::Var { binding, var } => {
            var.emit_load(b.out());
            Emitted::new(binding.js_type(), var.storage())
        }
        Target::Field { receiver, field } => {
            emit_receiver(b, receiver);
            b.emit(Instr::Ldfld(field.handle));
            Emitted::new(field.js_type(), field.ty)
        }
        Target::StaticField(field) => {
            b.emit(Instr::Ldsfld(field.handle));
            Emitted::new(field.js_type(), field.ty)
        }
        Target::Named { .. } | Target::Computed { .. } => {
            return Err(unsupported_node!("logical assignment to a dynamic property", span))
        }
    };
    b.to_object(current);
    b.emit(Instr::Dup);
    match op {
        AssignOp::AndAssign => {
            b.call_runtime(RuntimeFn::ToBoolean);
            b.emit(Instr::Brfalse(end));
        }
        AssignOp::OrAssign => {
            b.call_runtime(RuntimeFn::ToBoolean);
            b.emit(Instr::Brtrue(end));
        }
        _ => {
            operators::emit_is_nullish(b);
            b.emit(Instr::Brfalse(end));
        }
    }
    b.emit(Instr::Pop);

    if is_const(&target) {
        compile_expr_discard(b, right)?;
        emit_const_error(b);
        b.emit(Instr::Ldnull);
    } else {
        let storage = match &target {
            Target::Var { var, .. } => var.storage(),
            Target::Field { field, .. } | Target::StaticField(field) => field.ty,
            Target::Named { .. } | Target::Computed { .. } => ClrType::Object,
        };
        let value = compile_expr(b, right)?;
        let value = b.to_storage(value, storage);
        let t = b.temp(storage);
        b.emit(Instr::Stloc(t));
        match &target {
            Target::Var { var, .. } => {
                var.emit_instance(b.out());
                b.emit(Instr::Ldloc(t));
                var.emit_store(b.out());
            }
            Target::Field { receiver, field } => {
                emit_receiver(b, receiver);
                b.emit(Instr::Ldloc(t));
                b.emit(Instr::Stfld(field.handle));
            }
            Target::StaticField(field) => {
                b.emit(Instr::Ldloc(t));
                b.emit(Instr::Stsfld(field.handle));
            }
            Target::Named { .. } | Target::Computed { .. } => {}
        }
        b.emit(Instr::Ldloc(t));
        b.release(storage, t);
        b.to_object(value);
    }
    b.place(end);

    if want_value {
        Ok(Some(Emitted::unknown()))
    } else {
        b.emit(Instr::Pop);
        Ok(None)
    }
}

/// `++x`, `x--` and friends.  The result is always a number.
pub(crate) fn compile_update(b: &mut FnBuilder<'_>, update: &UpdateExpr, want_value: bool) -> Result<Option<Emitted>> {
    let target = expr_target(b, &update.arg)?;
    let step = if update.op == UpdateOp::PlusPlus { Instr::Add } else { Instr::Sub };
    let keep_old = want_value && !update.prefix;
    let keep_new = want_value && update.prefix;

    if is_const(&target) {
        emit_const_error(b);
        return Ok(want_value.then(|| {
            b.emit(Instr::Ldnull);
            Emitted::undefined()
        }));
    }

    match target {
        Target::Var { binding, var } if !var.is_field() => {
            var.emit_load(b.out());
            b.to_double(Emitted::new(binding.js_type(), var.storage()));
            if keep_old {
                b.emit(Instr::Dup);
            }
            b.emit(Instr::LdcR8(1.0));
            b.emit(step);
            if keep_new {
                b.emit(Instr::Dup);
            }
            emit_coerce(b.out(), ClrType::Double, var.storage());
            var.emit_store(b.out());
        }
        Target::Var { .. } | Target::Field { .. } | Target::StaticField(_) => {
            let (current, storage) = match &target {
                Target::Var { binding, var } => {
                    var.emit_instance(b.out());
                    b.emit(Instr::Dup);
                    var.emit_load_from_instance(b.out());
                    (Emitted::new(binding.js_type(), var.storage()), var.storage())
                }
                Target::Field { receiver, field } => {
                    emit_receiver(b, receiver);
                    b.emit(Instr::Dup);
                    b.emit(Instr::Ldfld(field.handle));
                    (Emitted::new(field.js_type(), field.ty), field.ty)
                }
                Target::StaticField(field) => {
                    b.emit(Instr::Ldsfld(field.handle));
                    (Emitted::new(field.js_type(), field.ty), field.ty)
                }
                Target::Named { .. } | Target::Computed { .. } => {
                    return Err(error!("internal: dynamic update target").with_span(update.span))
                }
            };
            b.to_double(current);

            let result = want_value.then(|| b.temp(ClrType::Double));
            if let (true, Some(t)) = (keep_old, result) {
                b.emit(Instr::Dup);
                b.emit(Instr::Stloc(t));
            }
            b.emit(Instr::LdcR8(1.0));
            b.emit(step);
            if let (true, Some(t)) = (keep_new, result) {
                b.emit(Instr::Dup);
                b.emit(Instr::Stloc(t));
            }
            emit_coerce(b.out(), ClrType::Double, storage);
            match &target {
                Target::Var { var, .. } => var.emit_store(b.out()),
                Target::Field { field, .. } => b.emit(Instr::Stfld(field.handle)),
                Target::StaticField(field) => b.emit(Instr::Stsfld(field.handle)),
                Target::Named { .. } | Target::Computed { .. } => {}
            }
            if let Some(t) = result {
                b.emit(Instr::Ldloc(t));
                b.release(ClrType::Double, t);
            }
        }
        Target::Named { obj, name } => {
            let obj_local = stash_object(b, obj)?;
            b.emit(Instr::Ldloc(obj_local));
            b.emit(Instr::Ldstr(name.clone()));
            b.emit(Instr::Ldloc(obj_local));
            b.emit(Instr::Ldstr(name));
            b.call_runtime(RuntimeFn::GetProperty);
            b.release(ClrType::Object, obj_local);
            emit_dynamic_step(b, step, keep_old, keep_new, RuntimeFn::SetProperty);
        }
        Target::Computed { obj, key } => {
            let obj_local = stash_object(b, obj)?;
            let key_local = stash_object(b, key)?;
            b.emit(Instr::Ldloc(obj_local));
            b.emit(Instr::Ldloc(key_local));
            b.emit(Instr::Ldloc(obj_local));
            b.emit(Instr::Ldloc(key_local));
            b.call_runtime(RuntimeFn::GetItem);
            b.release(ClrType::Object, obj_local);
            b.release(ClrType::Object, key_local);
            emit_dynamic_step(b, step, keep_old, keep_new, RuntimeFn::AssignItem);
        }
    }

    Ok(want_value.then(Emitted::number))
}

/// With `target, key, current` on the stack, store `current ± 1` through
/// `setter` and leave the requested value.
fn emit_dynamic_step(b: &mut FnBuilder<'_>, step: Instr, keep_old: bool, keep_new: bool, setter: RuntimeFn) {
    b.call_runtime(RuntimeFn::ToNumber);
    let result = (keep_old || keep_new).then(|| b.temp(ClrType::Double));
    if let (true, Some(t)) = (keep_old, result) {
        b.emit(Instr::Dup);
        b.emit(Instr::Stloc(t));
    }
    b.emit(Instr::LdcR8(1.0));
    b.emit(step);
    if let (true, Some(t)) = (keep_new, result) {
        b.emit(Instr::Dup);
        b.emit(Instr::Stloc(t));
    }
    b.emit(Instr::Box(ClrType::Double));
    b.call_runtime(setter);
    b.emit(Instr::Pop);
    if let Some(t) = result {
        b.emit(Instr::Ldloc(t));
        b.release(ClrType::Double, t);
    }
}
