use swc_common::Span;
use swc_ecma_ast::{CallExpr, Callee, Expr, ExprOrSpread, Ident, MemberExpr, MemberProp, NewExpr, SuperProp, SuperPropExpr};

use super::expr::{classify_receiver, emit_receiver, member_name, static_field, Receiver};
use super::{compile_expr, Emitted, FnBuilder, Resolved};
use crate::bytecode::{ClrType, Instr, MethodRef};
use crate::classes::ClassId;
use crate::closures;
use crate::common::Result;
use crate::coordinator::CallableKind;
use crate::runtime::{capability, ArgKind, CallShape, Capability, Dispatch, ErrorKind, IntrinsicKind, ReturnKind, RuntimeFn};
use crate::scope::JsType;
use crate::{error, unsupported_node};

/// Push exactly `max` boxed arguments: missing ones are `undefined`, extra
/// ones are evaluated for their side effects and dropped.  Spread arguments
/// have no fixed count and are rejected.
pub(crate) fn emit_padded_args(b: &mut FnBuilder<'_>, args: &[ExprOrSpread], max: u16) -> Result<()> {
    for (ndx, arg) in args.iter().enumerate() {
        if let Some(spread) = arg.spread {
            return Err(unsupported_node!("spread argument", spread));
        }
        let value = compile_expr(b, &arg.expr)?;
        if ndx < max as usize {
            b.to_object(value);
        } else {
            b.emit(Instr::Pop);
        }
    }
    for _ in args.len()..max as usize {
        b.emit(Instr::Ldnull);
    }
    Ok(())
}

/// Returns `None` only when `discard` is set and the callee returns nothing.
pub(crate) fn compile_call(b: &mut FnBuilder<'_>, call: &CallExpr, discard: bool) -> Result<Option<Emitted>> {
    let span = call.span;
    let callee = match &call.callee {
        Callee::Super(_) => return compile_super_call(b, &call.args, span).map(Some),
        Callee::Import(import) => return Err(unsupported_node!("dynamic import", import.span)),
        Callee::Expr(callee) => callee.as_ref(),
    };

    match callee {
        Expr::Ident(ident) => compile_ident_call(b, ident, &call.args, discard, span),
        Expr::Member(member) => compile_member_call(b, member, &call.args, discard, span),
        Expr::SuperProp(super_prop) => compile_super_method_call(b, super_prop, &call.args).map(Some),
        other => {
            let func = compile_expr(b, other)?;
            b.to_object(func);
            closures::emit_value_call(b, &call.args).map(Some)
        }
    }
}

fn compile_ident_call(
    b: &mut FnBuilder<'_>,
    ident: &Ident,
    args: &[ExprOrSpread],
    discard: bool,
    span: Span,
) -> Result<Option<Emitted>> {
    match b.resolve(&ident.sym, ident.span)? {
        Resolved::Function(scope) | Resolved::SelfName(scope) => closures::emit_direct_call(b, scope, args, span).map(Some),
        Resolved::Binding { var, binding, .. } => {
            var.emit_load(b.out());
            b.to_object(Emitted::new(binding.js_type(), var.storage()));
            closures::emit_value_call(b, args).map(Some)
        }
        Resolved::Class(_) => Err(unsupported_node!("class constructor called without `new`", span)),
        Resolved::Global => match capability(IntrinsicKind::Global, &ident.sym) {
            Some(cap) => emit_intrinsic_call(b, cap, args, discard, span),
            None => Err(unsupported_node!(format!("call to undeclared function {}", ident.sym), ident.span)),
        },
    }
}

fn compile_member_call(
    b: &mut FnBuilder<'_>,
    member: &MemberExpr,
    args: &[ExprOrSpread],
    discard: bool,
    span: Span,
) -> Result<Option<Emitted>> {
    let name = member_name(&member.prop);

    if let Some(name) = &name {
        let receiver = classify_receiver(b, &member.obj)?;
        match &receiver {
            // With spread arguments, public methods are reached through
            // `CallMember`, which pads at run time.
            Receiver::This(class) | Receiver::Instance(class, _)
                if !closures::has_spread(args) || name.starts_with('#') =>
            {
                if let Some((_, method)) = b.env().classes.method(*class, name).filter(|(_, m)| !m.is_static) {
                    emit_receiver(b, &receiver);
                    emit_padded_args(b, args, method.params.max)?;
                    let target = MethodRef::User(method.handle);
                    // Private methods are never overridden.
                    b.emit(if name.starts_with('#') {
                        Instr::Call(target)
                    } else {
                        Instr::Callvirt(target)
                    });
                    return Ok(Some(Emitted::unknown()));
                }
            }
            Receiver::Static(class) => {
                let class = *class;
                if let Some((owner, method)) = b.env().classes.method(class, name).filter(|(_, m)| m.is_static) {
                    if b.env().classes.get(owner).needs_scopes {
                        closures::emit_scopes_for(b, method.scope, span)?;
                    }
                    emit_padded_args(b, args, method.params.max)?;
                    b.emit(Instr::Call(MethodRef::User(method.handle)));
                    return Ok(Some(Emitted::unknown()));
                }
                if let Some(field) = static_field(b, &receiver, name) {
                    b.emit(Instr::Ldsfld(field.handle));
                    b.to_object(Emitted::new(field.js_type(), field.ty));
                    return closures::emit_value_call(b, args).map(Some);
                }
                let class_name = &b.env().classes.get(class).name;
                return Err(unsupported_node!(format!("unknown static method {}.{}", class_name, name), span));
            }
            Receiver::This(_) | Receiver::Instance(..) | Receiver::Other => {}
        }

        if let Expr::Ident(obj) = member.obj.as_ref() {
            if let Some(kind) = IntrinsicKind::from_global_name(&obj.sym) {
                let is_global = matches!(b.resolve(&obj.sym, obj.span)?, Resolved::Global);
                if let (true, Some(cap)) = (is_global, capability(kind, name)) {
                    return emit_intrinsic_call(b, cap, args, discard, span);
                }
            }
        }

        if name.starts_with('#') {
            return Err(unsupported_node!("private name on an untyped receiver", member.span));
        }
    }

    let receiver = compile_expr(b, &member.obj)?;
    match (&member.prop, name) {
        (MemberProp::Computed(computed), _) => {
            b.to_object(receiver);
            let key = compile_expr(b, &computed.expr)?;
            b.to_object(key);
            b.call_runtime(RuntimeFn::GetItem);
            closures::emit_value_call(b, args).map(Some)
        }
        (_, Some(name)) => {
            if receiver.js == JsType::String {
                let string_method = capability(IntrinsicKind::String, &name).filter(|cap| cap.dispatch == Dispatch::Instance);
                if let Some(cap) = string_method {
                    b.to_object(receiver);
                    return emit_intrinsic_args_and_call(b, cap, args, discard);
                }
            }
            b.to_object(receiver);
            b.emit(Instr::Ldstr(name));
            closures::emit_args_array(b, args)?;
            b.call_runtime(RuntimeFn::CallMember);
            Ok(Some(Emitted::unknown()))
        }
        (_, None) => Err(error!("internal: named member without a name").with_span(member.span)),
    }
}

/// A host method from the capability table, receiver included.
fn emit_intrinsic_call(
    b: &mut FnBuilder<'_>,
    cap: &'static Capability,
    args: &[ExprOrSpread],
    discard: bool,
    span: Span,
) -> Result<Option<Emitted>> {
    match cap.dispatch {
        Dispatch::Instance => b.call_runtime(RuntimeFn::GetIntrinsicGlobal(cap.receiver)),
        Dispatch::Static => {}
        Dispatch::Getter => return Err(unsupported_node!(format!("calling property {}", cap.name), span)),
    }
    emit_intrinsic_args_and_call(b, cap, args, discard)
}

fn emit_intrinsic_args_and_call(
    b: &mut FnBuilder<'_>,
    cap: &'static Capability,
    args: &[ExprOrSpread],
    discard: bool,
) -> Result<Option<Emitted>> {
    match cap.shape {
        CallShape::ParamsArray => closures::emit_args_array(b, args)?,
        CallShape::Fixed(params) => {
            for (ndx, arg) in args.iter().enumerate() {
                if let Some(spread) = arg.spread {
                    return Err(unsupported_node!("spread argument", spread));
                }
                let value = compile_expr(b, &arg.expr)?;
                match params.get(ndx) {
                    Some(ArgKind::Object) => {
                        b.to_object(value);
                    }
                    Some(ArgKind::Double) => {
                        b.to_double(value);
                    }
                    None => b.emit(Instr::Pop),
                }
            }
            for kind in params.iter().skip(args.len()) {
                b.emit(match kind {
                    ArgKind::Object => Instr::Ldnull,
                    ArgKind::Double => Instr::LdcR8(f64::NAN),
                });
            }
        }
    }

    b.emit(Instr::Call(MethodRef::Intrinsic(cap.method())));
    Ok(match cap.returns {
        ReturnKind::Void if discard => None,
        ReturnKind::Void => {
            b.emit(Instr::Ldnull);
            Some(Emitted::undefined())
        }
        ReturnKind::Object => Some(Emitted::unknown()),
        ReturnKind::String => Some(Emitted::string()),
        ReturnKind::Double => Some(Emitted::number()),
        ReturnKind::Boolean => Some(Emitted::boolean()),
    })
}

/// The class of `this` in a constructor of a derived class.
fn derived_ctor_class(b: &FnBuilder<'_>, span: Span) -> Result<(ClassId, ClassId)> {
    let callable = b.callable();
    let class = match (callable.kind(), callable.this_class()) {
        (CallableKind::Constructor, Some(class)) => class,
        _ => return Err(unsupported_node!("`super(...)` outside of a constructor", span)),
    };
    let base = b
        .env()
        .classes
        .get(class)
        .base
        .ok_or_else(|| unsupported_node!("`super(...)` in a class without a base", span))?;
    Ok((class, base))
}

fn compile_super_call(b: &mut FnBuilder<'_>, args: &[ExprOrSpread], span: Span) -> Result<Emitted> {
    let (class, base) = derived_ctor_class(b, span)?;
    let base_entry = b.env().classes.get(base);

    b.emit(Instr::Ldarg(crate::bytecode::ArgIndex(0)));
    if base_entry.needs_scopes {
        closures::emit_scopes_for(b, base_entry.ctor_scope, span)?;
    }
    emit_padded_args(b, args, base_entry.ctor_params.max)?;
    b.emit(Instr::Call(MethodRef::User(base_entry.ctor)));

    if let Some(class_decl) = b.take_pending_field_inits() {
        crate::classes::emit_field_initializers(b, class_decl)?;
    }

    b.emit(Instr::Ldarg(crate::bytecode::ArgIndex(0)));
    let ty = b.env().classes.get(class).ty;
    Ok(Emitted::new(JsType::Object, ClrType::Class(ty)))
}

/// `super.m(...)`: a non-virtual call to the base implementation.
fn compile_super_method_call(b: &mut FnBuilder<'_>, super_prop: &SuperPropExpr, args: &[ExprOrSpread]) -> Result<Emitted> {
    let span = super_prop.span;
    let name = match &super_prop.prop {
        SuperProp::Ident(ident) => ident.sym.to_string(),
        SuperProp::Computed(_) => return Err(unsupported_node!("computed super member", span)),
    };
    let class = b
        .callable()
        .this_class()
        .ok_or_else(|| unsupported_node!("`super` outside of an instance method", span))?;
    let base = b
        .env()
        .classes
        .get(class)
        .base
        .ok_or_else(|| unsupported_node!("`super` in a class without a base", span))?;
    let (_, method) = b
        .env()
        .classes
        .method(base, &name)
        .filter(|(_, m)| !m.is_static)
        .ok_or_else(|| unsupported_node!(format!("unknown base method {}", name), span))?;

    b.emit(Instr::Ldarg(crate::bytecode::ArgIndex(0)));
    emit_padded_args(b, args, method.params.max)?;
    b.emit(Instr::Call(MethodRef::User(method.handle)));
    Ok(Emitted::unknown())
}

pub(crate) fn compile_new(b: &mut FnBuilder<'_>, new_expr: &NewExpr) -> Result<Emitted> {
    let span = new_expr.span;
    let args = new_expr.args.as_deref().unwrap_or(&[]);

    if let Expr::Ident(ident) = new_expr.callee.as_ref() {
        match b.resolve(&ident.sym, ident.span)? {
            Resolved::Class(class) => return construct_class(b, class, args, span),
            Resolved::Global => {
                let array_ctor = IntrinsicKind::from_global_name(&ident.sym).and_then(|kind| capability(kind, "constructor"));
                if let Some(cap) = array_ctor {
                    let value = emit_intrinsic_call(b, cap, args, false, span)?;
                    return Ok(value.unwrap_or_else(Emitted::unknown));
                }
                if let Some(kind) = ErrorKind::from_name(&ident.sym) {
                    return construct_error(b, kind, args);
                }
                return Err(unsupported_node!(format!("constructor {}", ident.sym), ident.span));
            }
            _ => {}
        }
    }

    let callee = compile_expr(b, &new_expr.callee)?;
    b.to_object(callee);
    closures::emit_args_array(b, args)?;
    b.call_runtime(RuntimeFn::Construct);
    Ok(Emitted::new(JsType::Object, ClrType::Object))
}

fn construct_class(b: &mut FnBuilder<'_>, class: ClassId, args: &[ExprOrSpread], span: Span) -> Result<Emitted> {
    let entry = b.env().classes.get(class);
    if entry.needs_scopes {
        closures::emit_scopes_for(b, entry.ctor_scope, span)?;
    }
    emit_padded_args(b, args, entry.ctor_params.max)?;
    b.emit(Instr::Newobj(MethodRef::User(entry.ctor)));

    match entry.ctor_return_field {
        Some(field) => {
            b.emit(Instr::Dup);
            b.emit(Instr::Ldfld(field));
            b.call_runtime(RuntimeFn::ConstructorResult);
            Ok(Emitted::new(JsType::Object, ClrType::Object))
        }
        None => Ok(Emitted::new(JsType::Object, ClrType::Class(entry.ty))),
    }
}

fn construct_error(b: &mut FnBuilder<'_>, kind: ErrorKind, args: &[ExprOrSpread]) -> Result<Emitted> {
    match args.first() {
        Some(message) => {
            let value = compile_expr(b, &message.expr)?;
            b.to_object(value);
        }
        None => b.emit(Instr::Ldnull),
    }
    for extra in args.iter().skip(1) {
        compile_expr(b, &extra.expr)?;
        b.emit(Instr::Pop);
    }
    b.call_runtime(RuntimeFn::NewError(kind));
    Ok(Emitted::new(JsType::Object, ClrType::Object))
}
