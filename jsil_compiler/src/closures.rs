//! Function values and the scope arrays handed to callees.
//!
//! A callee whose frame sits at depth `d` receives an array of `d` entries:
//! the frames of its lexical ancestors, global first.  Entries for frames
//! without a heap instance stay null.  Every function value carries the
//! array of the context that created it.

use swc_common::Span;
use swc_ecma_ast::ExprOrSpread;

use crate::bytecode::{ClrType, Instr, MethodRef};
use crate::bytecode_compiler::{compile_expr, emit_padded_args, Emitted, FnBuilder};
use crate::common::Result;
use crate::coordinator::CallableKind;
use crate::error;
use crate::runtime::RuntimeFn;
use crate::scope::{JsType, ScopeId};
use crate::variables::ScopesSource;

/// Push a scope array with the first `len` frames of the current chain.
fn emit_scope_array(b: &mut FnBuilder<'_>, len: u16, span: Span) -> Result<()> {
    let own_depth = b.own_depth();
    b.emit(Instr::LdcI4(len as i32));
    b.emit(Instr::Newarr(ClrType::Object));

    for depth in 0..len {
        let frame = b
            .chain_frame(depth)
            .ok_or_else(|| error!("internal: scope array longer than the scope chain").with_span(span))?;
        let has_instance = b.env().frames.of_scope(frame)?.shape.is_some();
        if !has_instance {
            continue;
        }

        b.emit(Instr::Dup);
        b.emit(Instr::LdcI4(depth as i32));
        if depth < own_depth {
            let source = b.callable().scopes;
            if source == ScopesSource::None {
                return Err(error!("internal: {} has no incoming scopes", b.callable().id).with_span(span));
            }
            source.emit_load(b.out());
            b.emit(Instr::LdcI4(depth as i32));
            b.emit(Instr::Ldelem);
        } else {
            let local = b
                .frame_instance(depth)
                .ok_or_else(|| error!("internal: frame instance used before creation").with_span(span))?;
            b.emit(Instr::Ldloc(local));
        }
        b.emit(Instr::Stelem);
    }
    Ok(())
}

/// The scope array expected by the callee whose own frame is `callee_frame`.
pub(crate) fn emit_scopes_for(b: &mut FnBuilder<'_>, callee_frame: ScopeId, span: Span) -> Result<()> {
    let callee_chain = b.env().scopes.frame_chain(callee_frame);
    let len = callee_chain.len().saturating_sub(1);
    for (depth, frame) in callee_chain.iter().take(len).enumerate() {
        if b.chain_frame(depth as u16) != Some(*frame) {
            return Err(error!(
                "internal: {} is not lexically visible from {}",
                b.env().scopes.qualified_name(callee_frame),
                b.callable().id
            )
            .with_span(span));
        }
    }
    emit_scope_array(b, len as u16, span)
}

/// A delegate over the function whose own scope is `fn_scope`, bound to the
/// scope array of the creating context.
pub(crate) fn emit_function_value(b: &mut FnBuilder<'_>, fn_scope: ScopeId, span: Span) -> Result<Emitted> {
    let callable = b.env().callables.get(fn_scope)?;
    let arity = u8::try_from(callable.params.max)
        .map_err(|_| error!("{} takes more than {} parameters", callable.id, u8::MAX).with_span(span))?;
    b.emit(Instr::Ldftn(callable.method));
    if callable.kind() == CallableKind::ObjectMethod {
        b.call_runtime(RuntimeFn::NewMethodDelegate(arity));
    } else {
        b.call_runtime(RuntimeFn::NewDelegate(arity));
    }
    emit_scopes_for(b, fn_scope, span)?;
    b.call_runtime(RuntimeFn::Bind);
    Ok(Emitted::new(JsType::Object, ClrType::Object))
}

/// The value of a named function expression's own name, inside its body.
pub(crate) fn emit_self_delegate(b: &mut FnBuilder<'_>, fn_scope: ScopeId, span: Span) -> Result<Emitted> {
    let callable = b.env().callables.get(fn_scope)?;
    b.emit(Instr::Ldftn(callable.method));
    emit_scopes_for(b, fn_scope, span)?;
    b.call_runtime(RuntimeFn::CreateSelfDelegate);
    Ok(Emitted::new(JsType::Object, ClrType::Object))
}

pub(crate) fn has_spread(args: &[ExprOrSpread]) -> bool {
    args.iter().any(|arg| arg.spread.is_some())
}

/// Push an `object[]` holding every argument.
pub(crate) fn emit_args_array(b: &mut FnBuilder<'_>, args: &[ExprOrSpread]) -> Result<()> {
    let elems: Vec<_> = args.iter().map(Some).collect();
    emit_elements_array(b, &elems)
}

/// Push an `object[]` of `elems`.  Holes are `undefined`; spread elements
/// are expanded at run time.
pub(crate) fn emit_elements_array(b: &mut FnBuilder<'_>, elems: &[Option<&ExprOrSpread>]) -> Result<()> {
    if elems.iter().flatten().all(|elem| elem.spread.is_none()) {
        return emit_object_array(b, elems);
    }

    b.emit(Instr::LdcI4(0));
    b.emit(Instr::Newarr(ClrType::Object));
    let mut run = Vec::new();
    for elem in elems {
        match elem {
            Some(spread) if spread.spread.is_some() => {
                if !run.is_empty() {
                    emit_object_array(b, &run)?;
                    b.call_runtime(RuntimeFn::ConcatArgs);
                    run.clear();
                }
                let value = compile_expr(b, &spread.expr)?;
                b.to_object(value);
                b.call_runtime(RuntimeFn::ConcatArgs);
            }
            other => run.push(*other),
        }
    }
    if !run.is_empty() {
        emit_object_array(b, &run)?;
        b.call_runtime(RuntimeFn::ConcatArgs);
    }
    Ok(())
}

fn emit_object_array(b: &mut FnBuilder<'_>, elems: &[Option<&ExprOrSpread>]) -> Result<()> {
    b.emit(Instr::LdcI4(elems.len() as i32));
    b.emit(Instr::Newarr(ClrType::Object));
    for (ndx, elem) in elems.iter().enumerate() {
        b.emit(Instr::Dup);
        b.emit(Instr::LdcI4(ndx as i32));
        match elem {
            Some(elem) => {
                let value = compile_expr(b, &elem.expr)?;
                b.to_object(value);
            }
            None => b.emit(Instr::Ldnull),
        }
        b.emit(Instr::Stelem);
    }
    Ok(())
}

/// Invoke the function value on top of the stack.
pub(crate) fn emit_value_call(b: &mut FnBuilder<'_>, args: &[ExprOrSpread]) -> Result<Emitted> {
    emit_args_array(b, args)?;
    b.call_runtime(RuntimeFn::InvokeWithArgs);
    Ok(Emitted::unknown())
}

/// Call a function declaration (or a function expression from inside its
/// own body) through its method handle.  With spread arguments the call
/// goes through the function value instead.
pub(crate) fn emit_direct_call(
    b: &mut FnBuilder<'_>,
    fn_scope: ScopeId,
    args: &[ExprOrSpread],
    span: Span,
) -> Result<Emitted> {
    if has_spread(args) {
        emit_function_value(b, fn_scope, span)?;
        return emit_value_call(b, args);
    }
    let callable = b.env().callables.get(fn_scope)?;
    emit_scopes_for(b, fn_scope, span)?;
    emit_padded_args(b, args, callable.params.max)?;
    b.emit(Instr::Call(MethodRef::User(callable.method)));
    Ok(Emitted::unknown())
}
