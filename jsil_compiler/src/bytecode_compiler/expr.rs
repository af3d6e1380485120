use swc_common::{Span, Spanned};
use swc_ecma_ast::{ArrayLit, Expr, Ident, Lit, MemberExpr, MemberProp, ObjectLit, Prop, PropName, PropOrSpread, Tpl};

use super::{calls, operators, update, Emitted, FnBuilder, Resolved};
use crate::bytecode::{ClrType, Instr, MethodRef};
use crate::classes::{ClassId, FieldInfo};
use crate::closures;
use crate::common::Result;
use crate::coordinator::CallableKind;
use crate::runtime::{capability, Dispatch, IntrinsicKind, RuntimeFn};
use crate::scope::{Binding, JsType};
use crate::variables::Variable;
use crate::{error, unsupported_node};

pub(crate) fn compile_expr(b: &mut FnBuilder<'_>, expr: &Expr) -> Result<Emitted> {
    match expr {
        Expr::Lit(lit) => compile_lit(b, lit),
        Expr::Ident(ident) => compile_ident(b, ident),
        Expr::This(this) => compile_this(b, this.span),
        Expr::Paren(paren) => compile_expr(b, &paren.expr),
        Expr::Array(array) => compile_array(b, array),
        Expr::Object(object) => compile_object(b, object),
        Expr::Tpl(tpl) => compile_template(b, tpl),
        Expr::Fn(fn_expr) => {
            let span = fn_expr.function.span;
            let scope = function_scope(b, span)?;
            closures::emit_function_value(b, scope, span)
        }
        Expr::Arrow(arrow) => {
            let scope = function_scope(b, arrow.span)?;
            closures::emit_function_value(b, scope, arrow.span)
        }
        Expr::Unary(unary) => operators::compile_unary(b, unary),
        Expr::Bin(bin) => operators::compile_binary(b, bin),
        Expr::Cond(cond) => operators::compile_conditional(b, cond),
        Expr::Assign(assign) => expect_value(update::compile_assign(b, assign, true)?, assign.span),
        Expr::Update(upd) => expect_value(update::compile_update(b, upd, true)?, upd.span),
        Expr::Member(member) => compile_member_get(b, member),
        Expr::Call(call) => expect_value(calls::compile_call(b, call, false)?, call.span),
        Expr::New(new_expr) => calls::compile_new(b, new_expr),
        Expr::Seq(seq) => {
            let (last, init) = seq
                .exprs
                .split_last()
                .ok_or_else(|| error!("internal: empty sequence").with_span(seq.span))?;
            for expr in init {
                compile_expr_discard(b, expr)?;
            }
            compile_expr(b, last)
        }
        Expr::Class(class) => Err(unsupported_node!("class expression", class.class.span)),
        Expr::SuperProp(super_prop) => Err(unsupported_node!("super property read", super_prop.span)),
        Expr::TaggedTpl(tagged) => Err(unsupported_node!("tagged template", tagged.span)),
        other => Err(unsupported_node!("expression", other.span())),
    }
}

/// Compile `expr` for its side effects only.
pub(crate) fn compile_expr_discard(b: &mut FnBuilder<'_>, expr: &Expr) -> Result<()> {
    match expr {
        Expr::Paren(paren) => compile_expr_discard(b, &paren.expr),
        Expr::Assign(assign) => update::compile_assign(b, assign, false).map(|_| ()),
        Expr::Update(upd) => update::compile_update(b, upd, false).map(|_| ()),
        Expr::Call(call) => {
            if calls::compile_call(b, call, true)?.is_some() {
                b.emit(Instr::Pop);
            }
            Ok(())
        }
        Expr::Seq(seq) => {
            for expr in &seq.exprs {
                compile_expr_discard(b, expr)?;
            }
            Ok(())
        }
        other => {
            compile_expr(b, other)?;
            b.emit(Instr::Pop);
            Ok(())
        }
    }
}

fn expect_value(value: Option<Emitted>, span: Span) -> Result<Emitted> {
    value.ok_or_else(|| error!("internal: expression produced no value").with_span(span))
}

fn function_scope(b: &FnBuilder<'_>, span: Span) -> Result<crate::scope::ScopeId> {
    b.env()
        .scopes
        .function_scope(span)
        .ok_or_else(|| error!("internal: no scope for function").with_span(span))
}

fn compile_lit(b: &mut FnBuilder<'_>, lit: &Lit) -> Result<Emitted> {
    match lit {
        Lit::Num(num) => {
            b.emit(Instr::LdcR8(num.value));
            Ok(Emitted::number())
        }
        Lit::Str(s) => {
            b.emit(Instr::Ldstr(s.value.to_string()));
            Ok(Emitted::string())
        }
        Lit::Bool(value) => {
            b.emit(Instr::LdcI4(value.value as i32));
            Ok(Emitted::boolean())
        }
        Lit::Null(_) => {
            b.call_runtime(RuntimeFn::LoadJsNull);
            Ok(Emitted::new(JsType::Null, ClrType::Object))
        }
        other => Err(unsupported_node!("literal", other.span())),
    }
}

pub(super) fn compile_ident(b: &mut FnBuilder<'_>, ident: &Ident) -> Result<Emitted> {
    match b.resolve(&ident.sym, ident.span)? {
        Resolved::Binding { binding, var, .. } => {
            var.emit_load(b.out());
            Ok(Emitted::new(binding.js_type(), var.storage()))
        }
        Resolved::Function(scope) => closures::emit_function_value(b, scope, ident.span),
        Resolved::SelfName(scope) => closures::emit_self_delegate(b, scope, ident.span),
        Resolved::Class(_) => Err(unsupported_node!("class used as a value", ident.span)),
        Resolved::Global => compile_global(b, ident),
    }
}

fn compile_global(b: &mut FnBuilder<'_>, ident: &Ident) -> Result<Emitted> {
    match &*ident.sym {
        "undefined" => {
            b.emit(Instr::Ldnull);
            Ok(Emitted::undefined())
        }
        "NaN" => {
            b.emit(Instr::LdcR8(f64::NAN));
            Ok(Emitted::number())
        }
        "Infinity" => {
            b.emit(Instr::LdcR8(f64::INFINITY));
            Ok(Emitted::number())
        }
        name => match IntrinsicKind::from_global_name(name) {
            Some(kind) => {
                b.call_runtime(RuntimeFn::GetIntrinsicGlobal(kind));
                Ok(Emitted::new(JsType::Object, ClrType::Object))
            }
            None => Err(unsupported_node!(format!("undeclared global {}", name), ident.span)),
        },
    }
}

/// A global name with a compile-time meaning (as opposed to an undeclared
/// variable).
pub(super) fn is_known_global(name: &str) -> bool {
    matches!(name, "undefined" | "NaN" | "Infinity") || IntrinsicKind::from_global_name(name).is_some()
}

fn compile_this(b: &mut FnBuilder<'_>, span: Span) -> Result<Emitted> {
    if b.callable().kind() == CallableKind::ObjectMethod {
        b.emit(Instr::Ldarg(crate::bytecode::ArgIndex(1)));
        return Ok(Emitted::unknown());
    }
    let class = b
        .callable()
        .this_class()
        .ok_or_else(|| unsupported_node!("`this` outside of a class method or constructor", span))?;
    b.emit(Instr::Ldarg(crate::bytecode::ArgIndex(0)));
    let ty = b.env().classes.get(class).ty;
    Ok(Emitted::new(JsType::Object, ClrType::Class(ty)))
}

fn compile_array(b: &mut FnBuilder<'_>, array: &ArrayLit) -> Result<Emitted> {
    let elems: Vec<_> = array.elems.iter().map(Option::as_ref).collect();
    closures::emit_elements_array(b, &elems)?;
    b.call_runtime(RuntimeFn::NewArray);
    Ok(Emitted::new(JsType::Object, ClrType::Object))
}

fn compile_object(b: &mut FnBuilder<'_>, object: &ObjectLit) -> Result<Emitted> {
    b.call_runtime(RuntimeFn::NewObject);
    for prop in &object.props {
        let prop = match prop {
            PropOrSpread::Prop(prop) => prop,
            PropOrSpread::Spread(spread) => return Err(unsupported_node!("object spread", spread.dot3_token)),
        };
        b.emit(Instr::Dup);
        let setter = match prop.as_ref() {
            Prop::Shorthand(ident) => {
                b.emit(Instr::Ldstr(ident.sym.to_string()));
                let value = compile_ident(b, ident)?;
                b.to_object(value);
                RuntimeFn::SetProperty
            }
            Prop::KeyValue(kv) => {
                let setter = emit_prop_key(b, &kv.key)?;
                let value = compile_expr(b, &kv.value)?;
                b.to_object(value);
                setter
            }
            Prop::Method(method) => {
                let setter = emit_prop_key(b, &method.key)?;
                let span = method.function.span;
                let scope = function_scope(b, span)?;
                closures::emit_function_value(b, scope, span)?;
                setter
            }
            // Getters and setters.
            other => return Err(unsupported_node!("object literal property", other.span())),
        };
        b.call_runtime(setter);
        b.emit(Instr::Pop);
    }
    Ok(Emitted::new(JsType::Object, ClrType::Object))
}

/// Push the key of an object literal property; returns the runtime function
/// storing a value under it.
fn emit_prop_key(b: &mut FnBuilder<'_>, key: &PropName) -> Result<RuntimeFn> {
    Ok(match key {
        PropName::Ident(ident) => {
            b.emit(Instr::Ldstr(ident.sym.to_string()));
            RuntimeFn::SetProperty
        }
        PropName::Str(s) => {
            b.emit(Instr::Ldstr(s.value.to_string()));
            RuntimeFn::SetProperty
        }
        PropName::Num(num) => {
            b.emit(Instr::LdcR8(num.value));
            b.emit(Instr::Box(ClrType::Double));
            RuntimeFn::AssignItem
        }
        PropName::Computed(computed) => {
            let key = compile_expr(b, &computed.expr)?;
            b.to_object(key);
            RuntimeFn::AssignItem
        }
        PropName::BigInt(big) => return Err(unsupported_node!("bigint property name", big.span)),
    })
}

fn compile_template(b: &mut FnBuilder<'_>, tpl: &Tpl) -> Result<Emitted> {
    let text = |ndx: usize| -> String {
        tpl.quasis
            .get(ndx)
            .map(|quasi| match &quasi.cooked {
                Some(cooked) => cooked.to_string(),
                None => quasi.raw.to_string(),
            })
            .unwrap_or_default()
    };

    b.emit(Instr::Ldstr(text(0)));
    for (ndx, expr) in tpl.exprs.iter().enumerate() {
        let value = compile_expr(b, expr)?;
        b.to_object(value);
        b.call_runtime(RuntimeFn::Add);
        let tail = text(ndx + 1);
        if !tail.is_empty() {
            b.emit(Instr::Ldstr(tail));
            b.call_runtime(RuntimeFn::Add);
        }
    }
    Ok(Emitted::new(JsType::String, ClrType::Object))
}

//
// Members
//

/// Key of a named member in the class registry (`#x` for private names).
pub(super) fn member_name(prop: &MemberProp) -> Option<String> {
    match prop {
        MemberProp::Ident(ident) => Some(ident.sym.to_string()),
        MemberProp::PrivateName(private) => Some(format!("#{}", private.id.sym)),
        MemberProp::Computed(_) => None,
    }
}

/// A member receiver whose class is known statically.
pub(super) enum Receiver {
    This(ClassId),
    /// A binding always holding an instance created by `new C(...)`.
    Instance(ClassId, Variable),
    /// The class itself (`C.x`).
    Static(ClassId),
    Other,
}

impl Receiver {
    pub fn instance_class(&self) -> Option<ClassId> {
        match self {
            Receiver::This(class) | Receiver::Instance(class, _) => Some(*class),
            Receiver::Static(_) | Receiver::Other => None,
        }
    }
}

pub(super) fn classify_receiver(b: &mut FnBuilder<'_>, obj: &Expr) -> Result<Receiver> {
    match obj {
        Expr::Paren(paren) => classify_receiver(b, &paren.expr),
        Expr::This(_) => Ok(b.callable().this_class().map_or(Receiver::Other, Receiver::This)),
        Expr::Ident(ident) => Ok(match b.resolve(&ident.sym, ident.span)? {
            Resolved::Class(class) => Receiver::Static(class),
            Resolved::Binding { binding, var, .. } => match instance_class(b, binding) {
                Some(class) => Receiver::Instance(class, var),
                None => Receiver::Other,
            },
            _ => Receiver::Other,
        }),
        _ => Ok(Receiver::Other),
    }
}

/// The class of the instances a binding holds, when every `new` result is
/// the instance itself.
fn instance_class(b: &FnBuilder<'_>, binding: &Binding) -> Option<ClassId> {
    let classes = b.env().classes;
    let class = classes.by_ref(binding.instance_of.as_ref()?)?;
    if classes.get(class).ctor_return_field.is_some() {
        return None;
    }
    Some(class)
}

/// Push the receiver of an instance member, typed as its class.
pub(super) fn emit_receiver(b: &mut FnBuilder<'_>, receiver: &Receiver) {
    match receiver {
        Receiver::This(_) => b.emit(Instr::Ldarg(crate::bytecode::ArgIndex(0))),
        Receiver::Instance(class, var) => {
            var.emit_load(b.out());
            let ty = b.env().classes.get(*class).ty;
            b.emit(Instr::Castclass(ty));
        }
        Receiver::Static(_) | Receiver::Other => {}
    }
}

/// The instance field `name` of the receiver's class.
pub(super) fn instance_field(b: &FnBuilder<'_>, receiver: &Receiver, name: &str) -> Option<FieldInfo> {
    let class = receiver.instance_class()?;
    b.env().classes.field(class, name).filter(|field| !field.is_static)
}

pub(super) fn static_field(b: &FnBuilder<'_>, receiver: &Receiver, name: &str) -> Option<FieldInfo> {
    match receiver {
        Receiver::Static(class) => b.env().classes.field(*class, name).filter(|field| field.is_static),
        _ => None,
    }
}

fn compile_member_get(b: &mut FnBuilder<'_>, member: &MemberExpr) -> Result<Emitted> {
    let name = member_name(&member.prop);

    if let Some(name) = &name {
        let receiver = classify_receiver(b, &member.obj)?;
        if let Some(field) = instance_field(b, &receiver, name) {
            emit_receiver(b, &receiver);
            b.emit(Instr::Ldfld(field.handle));
            return Ok(Emitted::new(field.js_type(), field.ty));
        }
        if let Some(field) = static_field(b, &receiver, name) {
            b.emit(Instr::Ldsfld(field.handle));
            return Ok(Emitted::new(field.js_type(), field.ty));
        }
        if let Receiver::Static(class) = receiver {
            let class_name = &b.env().classes.get(class).name;
            return Err(unsupported_node!(format!("static member {}.{}", class_name, name), member.span));
        }
        if let Some(class) = receiver.instance_class() {
            if b.env().classes.method(class, name).is_some() {
                return Err(unsupported_node!("method used as a value", member.span));
            }
        }
        if name.starts_with('#') {
            return Err(unsupported_node!("private name on an untyped receiver", member.span));
        }
    }

    let obj = compile_expr(b, &member.obj)?;
    match &member.prop {
        MemberProp::Computed(computed) => {
            b.to_object(obj);
            let key = compile_expr(b, &computed.expr)?;
            b.to_object(key);
            b.call_runtime(RuntimeFn::GetItem);
            Ok(Emitted::unknown())
        }
        _ => {
            let name = name.unwrap_or_default();
            if obj.js == JsType::String {
                if let Some(cap) = capability(IntrinsicKind::String, &name).filter(|cap| cap.dispatch == Dispatch::Getter) {
                    b.to_object(obj);
                    b.emit(Instr::Call(MethodRef::Intrinsic(cap.method())));
                    return Ok(match cap.returns.clr_type() {
                        Some(ClrType::Double) => Emitted::number(),
                        _ => Emitted::unknown(),
                    });
                }
            }
            b.to_object(obj);
            b.emit(Instr::Ldstr(name));
            b.call_runtime(RuntimeFn::GetProperty);
            Ok(Emitted::unknown())
        }
    }
}
