//! Unary, binary, logical and conditional operators.
//!
//! Numeric operands known to be numbers take the unboxed `float64` fast path;
//! everything else goes through the runtime's generic operators.

use swc_common::Span;
use swc_ecma_ast::{BinExpr, BinaryOp, CondExpr, Expr, Lit, UnaryExpr, UnaryOp};

use super::expr::is_known_global;
use super::{compile_expr, compile_expr_discard, Emitted, FnBuilder, Resolved};
use crate::bytecode::{ClrType, Instr, Label};
use crate::common::Result;
use crate::runtime::RuntimeFn;
use crate::scope::JsType;
use crate::unsupported_node;

pub(crate) fn compile_unary(b: &mut FnBuilder<'_>, unary: &UnaryExpr) -> Result<Emitted> {
    match unary.op {
        UnaryOp::Minus => {
            let value = compile_expr(b, &unary.arg)?;
            b.to_double(value);
            b.emit(Instr::Neg);
            Ok(Emitted::number())
        }
        UnaryOp::Plus => {
            let value = compile_expr(b, &unary.arg)?;
            Ok(b.to_double(value))
        }
        UnaryOp::Bang => {
            let value = compile_expr(b, &unary.arg)?;
            b.to_bool(value);
            b.emit(Instr::LdcI4(0));
            b.emit(Instr::Ceq);
            Ok(Emitted::boolean())
        }
        UnaryOp::Tilde => {
            let value = compile_expr(b, &unary.arg)?;
            b.to_double(value);
            b.call_runtime(RuntimeFn::ToInt32);
            b.emit(Instr::Not);
            b.emit(Instr::ConvR8);
            Ok(Emitted::number())
        }
        UnaryOp::TypeOf => {
            // `typeof x` never throws, even for undeclared globals.
            if let Expr::Ident(ident) = unary.arg.as_ref() {
                let undeclared = matches!(b.resolve(&ident.sym, ident.span)?, Resolved::Global) && !is_known_global(&ident.sym);
                if undeclared {
                    b.emit(Instr::Ldstr("undefined".to_string()));
                    return Ok(Emitted::string());
                }
            }
            let value = compile_expr(b, &unary.arg)?;
            b.to_object(value);
            b.call_runtime(RuntimeFn::Typeof);
            Ok(Emitted::new(JsType::String, ClrType::Object))
        }
        UnaryOp::Void => {
            compile_expr_discard(b, &unary.arg)?;
            b.emit(Instr::Ldnull);
            Ok(Emitted::undefined())
        }
        UnaryOp::Delete => Err(unsupported_node!("delete", unary.span)),
    }
}

pub(crate) fn compile_binary(b: &mut FnBuilder<'_>, bin: &BinExpr) -> Result<Emitted> {
    if is_equality(bin.op) {
        let negate = matches!(bin.op, BinaryOp::NotEq | BinaryOp::NotEqEq);
        let strict = matches!(bin.op, BinaryOp::EqEqEq | BinaryOp::NotEqEq);
        let nullish = match (nullish_literal(b, &bin.left), nullish_literal(b, &bin.right)) {
            (_, Some(kind)) => Some((kind, &bin.left)),
            (Some(kind), None) => Some((kind, &bin.right)),
            (None, None) => None,
        };
        if let Some((kind, other)) = nullish {
            let value = compile_expr(b, other)?;
            b.to_object(value);
            match (strict, kind) {
                (false, _) => emit_is_nullish(b),
                (true, Nullish::Null) => emit_is_js_null(b),
                (true, Nullish::Undefined) => {
                    b.emit(Instr::Ldnull);
                    b.emit(Instr::Ceq);
                }
            }
            if negate {
                emit_not(b);
            }
            return Ok(Emitted::boolean());
        }
    }

    let left = compile_expr(b, &bin.left)?;
    apply_binary(b, bin.op, left, &bin.right, bin.span)
}

fn is_equality(op: BinaryOp) -> bool {
    matches!(op, BinaryOp::EqEq | BinaryOp::NotEq | BinaryOp::EqEqEq | BinaryOp::NotEqEq)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nullish {
    Null,
    Undefined,
}

/// `null`, `undefined` or `void <expr>` spelled out in the source.
fn nullish_literal(b: &FnBuilder<'_>, expr: &Expr) -> Option<Nullish> {
    match expr {
        Expr::Paren(paren) => nullish_literal(b, &paren.expr),
        Expr::Lit(Lit::Null(_)) => Some(Nullish::Null),
        Expr::Ident(ident) if &*ident.sym == "undefined" => {
            let shadowed = b.env().scopes.resolve(b.scope(), &ident.sym).is_some();
            (!shadowed).then_some(Nullish::Undefined)
        }
        Expr::Unary(unary) if unary.op == UnaryOp::Void && matches!(unary.arg.as_ref(), Expr::Lit(_)) => {
            Some(Nullish::Undefined)
        }
        _ => None,
    }
}

/// object -> bool: `undefined` or the `null` sentinel.
pub(super) fn emit_is_nullish(b: &mut FnBuilder<'_>) {
    let is_undefined = b.new_label();
    let end = b.new_label();
    b.emit(Instr::Dup);
    b.emit(Instr::Ldnull);
    b.emit(Instr::Ceq);
    b.emit(Instr::Brtrue(is_undefined));
    emit_is_js_null(b);
    b.emit(Instr::Br(end));
    b.place(is_undefined);
    b.emit(Instr::Pop);
    b.emit(Instr::LdcI4(1));
    b.place(end);
}

/// object -> bool
fn emit_is_js_null(b: &mut FnBuilder<'_>) {
    b.emit(Instr::Isinst(ClrType::JsNull));
    b.emit(Instr::Ldnull);
    b.emit(Instr::CgtUn);
}

fn emit_not(b: &mut FnBuilder<'_>) {
    b.emit(Instr::LdcI4(0));
    b.emit(Instr::Ceq);
}

/// Convert the two topmost values, `right` above `left`.
fn convert_pair<'a>(
    b: &mut FnBuilder<'a>,
    left: Emitted,
    right: Emitted,
    target: ClrType,
    convert: fn(&mut FnBuilder<'a>, Emitted) -> Emitted,
) {
    if left.repr != target {
        let t = b.temp(right.repr);
        b.emit(Instr::Stloc(t));
        convert(b, left);
        b.emit(Instr::Ldloc(t));
        b.release(right.repr, t);
    }
    convert(b, right);
}

fn pair_to_doubles<'a>(b: &mut FnBuilder<'a>, left: Emitted, right: Emitted) {
    convert_pair(b, left, right, ClrType::Double, FnBuilder::to_double);
}

fn pair_to_objects<'a>(b: &mut FnBuilder<'a>, left: Emitted, right: Emitted) {
    // Reference types are already objects.
    let left = if left.repr.is_value_type() {
        left
    } else {
        Emitted::new(left.js, ClrType::Object)
    };
    convert_pair(b, left, right, ClrType::Object, FnBuilder::to_object);
}

/// Value on top of the stack -> int32.
fn to_int32(b: &mut FnBuilder<'_>, value: Emitted) {
    b.to_double(value);
    b.call_runtime(RuntimeFn::ToInt32);
}

fn join(a: JsType, b: JsType) -> JsType {
    if a == b {
        a
    } else {
        JsType::Unknown
    }
}

/// Apply `op` to `left`, already on the stack, and `right`.
pub(crate) fn apply_binary(
    b: &mut FnBuilder<'_>,
    op: BinaryOp,
    left: Emitted,
    right: &Expr,
    span: Span,
) -> Result<Emitted> {
    match op {
        BinaryOp::LogicalAnd | BinaryOp::LogicalOr => return logical_value(b, op, left, right),
        BinaryOp::NullishCoalescing => return nullish_value(b, left, right),
        _ => {}
    }

    match op {
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod | BinaryOp::Exp => {
            b.to_double(left);
            let right = compile_expr(b, right)?;
            b.to_double(right);
            match op {
                BinaryOp::Mul => b.emit(Instr::Mul),
                BinaryOp::Div => b.emit(Instr::Div),
                BinaryOp::Mod => b.emit(Instr::Rem),
                _ => b.call_runtime(RuntimeFn::Pow),
            }
            return Ok(Emitted::number());
        }
        BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::LShift | BinaryOp::RShift | BinaryOp::ZeroFillRShift => {
            to_int32(b, left);
            let right = compile_expr(b, right)?;
            to_int32(b, right);
            if matches!(op, BinaryOp::LShift | BinaryOp::RShift | BinaryOp::ZeroFillRShift) {
                b.emit(Instr::LdcI4(31));
                b.emit(Instr::And);
            }
            match op {
                BinaryOp::BitAnd => b.emit(Instr::And),
                BinaryOp::BitOr => b.emit(Instr::Or),
                BinaryOp::BitXor => b.emit(Instr::Xor),
                BinaryOp::LShift => b.emit(Instr::Shl),
                BinaryOp::RShift => b.emit(Instr::Shr),
                _ => {
                    b.emit(Instr::ShrUn);
                    b.emit(Instr::ConvU4);
                    b.emit(Instr::ConvRUn);
                }
            }
            b.emit(Instr::ConvR8);
            return Ok(Emitted::number());
        }
        BinaryOp::In => {
            b.to_object(left);
            let right = compile_expr(b, right)?;
            b.to_object(right);
            b.call_runtime(RuntimeFn::In);
            return Ok(Emitted::boolean());
        }
        BinaryOp::InstanceOf => {
            b.to_object(left);
            if let Expr::Ident(ident) = right {
                if let Resolved::Class(class) = b.resolve(&ident.sym, ident.span)? {
                    let ty = b.env().classes.get(class).ty;
                    b.emit(Instr::Isinst(ClrType::Class(ty)));
                    b.emit(Instr::Ldnull);
                    b.emit(Instr::CgtUn);
                    return Ok(Emitted::boolean());
                }
            }
            let right = compile_expr(b, right)?;
            b.to_object(right);
            b.call_runtime(RuntimeFn::InstanceOf);
            return Ok(Emitted::boolean());
        }
        _ => {}
    }

    let right = compile_expr(b, right)?;
    let both_numbers = left.is_number() && right.is_number();

    match op {
        BinaryOp::Add | BinaryOp::Sub if both_numbers => {
            pair_to_doubles(b, left, right);
            b.emit(if op == BinaryOp::Add { Instr::Add } else { Instr::Sub });
            Ok(Emitted::number())
        }
        BinaryOp::Add => {
            pair_to_objects(b, left, right);
            b.call_runtime(RuntimeFn::Add);
            let js = if left.js == JsType::String || right.js == JsType::String {
                JsType::String
            } else {
                JsType::Unknown
            };
            Ok(Emitted::new(js, ClrType::Object))
        }
        BinaryOp::Sub => {
            pair_to_objects(b, left, right);
            b.call_runtime(RuntimeFn::Subtract);
            Ok(Emitted::new(JsType::Number, ClrType::Object))
        }

        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::LtEq | BinaryOp::GtEq if both_numbers => {
            pair_to_doubles(b, left, right);
            match op {
                BinaryOp::Lt => b.emit(Instr::Clt),
                BinaryOp::Gt => b.emit(Instr::Cgt),
                // a <= b  <=>  !(a > b), with NaN comparing unordered
                BinaryOp::LtEq => {
                    b.emit(Instr::CgtUn);
                    emit_not(b);
                }
                _ => {
                    b.emit(Instr::CltUn);
                    emit_not(b);
                }
            }
            Ok(Emitted::boolean())
        }
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::LtEq | BinaryOp::GtEq => {
            pair_to_objects(b, left, right);
            b.call_runtime(match op {
                BinaryOp::Lt => RuntimeFn::LessThan,
                BinaryOp::Gt => RuntimeFn::GreaterThan,
                BinaryOp::LtEq => RuntimeFn::LessThanOrEqual,
                _ => RuntimeFn::GreaterThanOrEqual,
            });
            Ok(Emitted::boolean())
        }

        BinaryOp::EqEq | BinaryOp::NotEq | BinaryOp::EqEqEq | BinaryOp::NotEqEq => {
            let strict = matches!(op, BinaryOp::EqEqEq | BinaryOp::NotEqEq);
            if both_numbers {
                pair_to_doubles(b, left, right);
                b.emit(Instr::Ceq);
            } else if left.repr == ClrType::Boolean && right.repr == ClrType::Boolean {
                b.emit(Instr::Ceq);
            } else {
                pair_to_objects(b, left, right);
                b.call_runtime(if strict {
                    RuntimeFn::StrictEquals
                } else {
                    RuntimeFn::LooseEquals
                });
            }
            if matches!(op, BinaryOp::NotEq | BinaryOp::NotEqEq) {
                emit_not(b);
            }
            Ok(Emitted::boolean())
        }

        other => Err(unsupported_node!(format!("operator {:?}", other), span)),
    }
}

/// Syntactically a boolean: comparisons, negations and boolean literals.
fn is_boolean_expr(expr: &Expr) -> bool {
    match expr {
        Expr::Paren(paren) => is_boolean_expr(&paren.expr),
        Expr::Lit(Lit::Bool(_)) => true,
        Expr::Unary(unary) => unary.op == UnaryOp::Bang,
        Expr::Bin(bin) => match bin.op {
            BinaryOp::EqEq
            | BinaryOp::NotEq
            | BinaryOp::EqEqEq
            | BinaryOp::NotEqEq
            | BinaryOp::Lt
            | BinaryOp::Gt
            | BinaryOp::LtEq
            | BinaryOp::GtEq
            | BinaryOp::In
            | BinaryOp::InstanceOf => true,
            BinaryOp::LogicalAnd | BinaryOp::LogicalOr => is_boolean_expr(&bin.left) && is_boolean_expr(&bin.right),
            _ => false,
        },
        _ => false,
    }
}

/// `a && b` / `a || b` as a value: the deciding operand itself.
fn logical_value(b: &mut FnBuilder<'_>, op: BinaryOp, left: Emitted, right: &Expr) -> Result<Emitted> {
    let end = b.new_label();
    let short_circuit = |label| {
        if op == BinaryOp::LogicalAnd {
            Instr::Brfalse(label)
        } else {
            Instr::Brtrue(label)
        }
    };

    if left.repr == ClrType::Boolean && is_boolean_expr(right) {
        b.emit(Instr::Dup);
        b.emit(short_circuit(end));
        b.emit(Instr::Pop);
        let right = compile_expr(b, right)?;
        b.to_bool(right);
        b.place(end);
        return Ok(Emitted::boolean());
    }

    b.to_object(left);
    b.emit(Instr::Dup);
    b.call_runtime(RuntimeFn::ToBoolean);
    b.emit(short_circuit(end));
    b.emit(Instr::Pop);
    let right = compile_expr(b, right)?;
    b.to_object(right);
    b.place(end);
    Ok(Emitted::new(join(left.js, right.js), ClrType::Object))
}

/// `a ?? b`
fn nullish_value(b: &mut FnBuilder<'_>, left: Emitted, right: &Expr) -> Result<Emitted> {
    let end = b.new_label();
    b.to_object(left);
    b.emit(Instr::Dup);
    emit_is_nullish(b);
    b.emit(Instr::Brfalse(end));
    b.emit(Instr::Pop);
    let right = compile_expr(b, right)?;
    b.to_object(right);
    b.place(end);
    Ok(Emitted::new(join(left.js, right.js), ClrType::Object))
}

/// Jump to `target` when the truthiness of `expr` equals `jump_if`;
/// otherwise fall through.  Leaves nothing on the stack.
pub(crate) fn compile_branch(b: &mut FnBuilder<'_>, expr: &Expr, jump_if: bool, target: Label) -> Result<()> {
    match expr {
        Expr::Paren(paren) => compile_branch(b, &paren.expr, jump_if, target),
        Expr::Unary(unary) if unary.op == UnaryOp::Bang => compile_branch(b, &unary.arg, !jump_if, target),
        Expr::Bin(bin) if matches!(bin.op, BinaryOp::LogicalAnd | BinaryOp::LogicalOr) => {
            let is_and = bin.op == BinaryOp::LogicalAnd;
            if is_and != jump_if {
                // (a && b) jumping when false, (a || b) jumping when true:
                // either operand alone decides.
                compile_branch(b, &bin.left, jump_if, target)?;
                compile_branch(b, &bin.right, jump_if, target)
            } else {
                let skip = b.new_label();
                compile_branch(b, &bin.left, !jump_if, skip)?;
                compile_branch(b, &bin.right, jump_if, target)?;
                b.place(skip);
                Ok(())
            }
        }
        _ => {
            let value = compile_expr(b, expr)?;
            b.to_bool(value);
            b.emit(if jump_if {
                Instr::Brtrue(target)
            } else {
                Instr::Brfalse(target)
            });
            Ok(())
        }
    }
}

pub(crate) fn compile_conditional(b: &mut FnBuilder<'_>, cond: &CondExpr) -> Result<Emitted> {
    let otherwise = b.new_label();
    let end = b.new_label();

    compile_branch(b, &cond.test, false, otherwise)?;
    let cons = compile_expr(b, &cond.cons)?;
    b.to_object(cons);
    b.emit(Instr::Br(end));
    b.place(otherwise);
    let alt = compile_expr(b, &cond.alt)?;
    b.to_object(alt);
    b.place(end);

    Ok(Emitted::new(join(cons.js, alt.js), ClrType::Object))
}
