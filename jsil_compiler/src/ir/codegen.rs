//! LIR → bytecode.
//!
//! Each instruction loads its inputs from their slots, computes, and stores
//! its result into its own slot.  Temps planned as stack-only are computed
//! in place at their use.  Pure instructions whose result is never read
//! are dropped; impure ones run and have their result popped.

use super::alloc::Allocation;
use super::lir::{ArithOp, CmpOp, Constant, Instr as LirInstr, Lir, Place, Temp, UnOp, UpdateOp};
use super::peephole::Plan;
use super::{LowerError, LowerResult};
use crate::bytecode::{ArgIndex, ClrType, Instr, MethodBody, MethodRef};
use crate::runtime::RuntimeFn;
use crate::variables::emit_coerce;

pub(super) fn emit(lir: &Lir, allocation: &Allocation, plan: &Plan) -> LowerResult<MethodBody> {
    let mut codegen = Codegen {
        lir,
        allocation,
        plan,
        defs: lir.def_sites(),
        uses: lir.use_counts(),
        out: Vec::with_capacity(lir.instrs.len() * 2),
    };
    for instr in &lir.instrs {
        codegen.instr(instr)?;
    }
    Ok(MethodBody {
        instrs: codegen.out,
        locals: allocation.locals.clone(),
    })
}

struct Codegen<'a> {
    lir: &'a Lir,
    allocation: &'a Allocation,
    plan: &'a Plan,
    defs: Vec<Option<usize>>,
    uses: Vec<u32>,
    out: Vec<Instr>,
}

impl<'a> Codegen<'a> {
    fn emit(&mut self, instr: Instr) {
        self.out.push(instr);
    }

    fn instr(&mut self, instr: &'a LirInstr) -> LowerResult<()> {
        match instr {
            LirInstr::Store { place, src } => {
                self.push(*src)?;
                self.store(*place);
            }
            LirInstr::StoreElem { array, index, value } => {
                if self.plan.stack_arrays.contains_key(array) {
                    self.emit(Instr::Dup);
                } else {
                    self.push(*array)?;
                }
                self.emit(Instr::LdcI4(*index as i32));
                self.push(*value)?;
                self.emit(Instr::Stelem);
            }
            LirInstr::Label(label) => self.emit(Instr::Label(*label)),
            LirInstr::Jump(label) => self.emit(Instr::Br(*label)),
            LirInstr::Branch { cond, if_true, target } => {
                self.push(*cond)?;
                self.emit(if *if_true {
                    Instr::Brtrue(*target)
                } else {
                    Instr::Brfalse(*target)
                });
            }
            LirInstr::Return(value) => {
                if let Some(value) = value {
                    self.push(*value)?;
                }
                self.emit(Instr::Ret);
            }
            LirInstr::Update {
                dst,
                place,
                op,
                prefix,
            } => {
                let keep = self.uses[dst.0 as usize] > 0;
                if keep && self.plan.inlined.contains(dst) {
                    return Ok(());
                }
                self.update(*place, *op, *prefix, keep)?;
                if keep {
                    self.store_temp(*dst)?;
                }
            }
            LirInstr::NewArgsArray { dst, len } if self.plan.stack_arrays.contains_key(dst) => {
                if let Some(Some(receiver)) = self.plan.stack_arrays.get(dst) {
                    self.push(*receiver)?;
                }
                self.emit(Instr::LdcI4(*len as i32));
                self.emit(Instr::Newarr(ClrType::Object));
            }
            LirInstr::CallIntrinsic { dst, .. } => {
                self.value(instr)?;
                if let Some(dst) = dst {
                    self.finish(*dst)?;
                }
            }
            _ => {
                let Some(dst) = instr.dst() else {
                    return Err(LowerError::internal(format!("no code for {:?}", instr)));
                };
                if self.plan.inlined.contains(&dst) {
                    return Ok(());
                }
                if self.uses[dst.0 as usize] == 0 && !instr.has_side_effects() {
                    return Ok(());
                }
                self.value(instr)?;
                self.finish(dst)?;
            }
        }
        Ok(())
    }

    /// Store the value just computed for `dst`, or drop it if unused.
    fn finish(&mut self, dst: Temp) -> LowerResult<()> {
        if self.uses[dst.0 as usize] == 0 {
            self.emit(Instr::Pop);
            Ok(())
        } else {
            self.store_temp(dst)
        }
    }

    fn store_temp(&mut self, dst: Temp) -> LowerResult<()> {
        let slot = self
            .allocation
            .slot_of(dst)
            .ok_or_else(|| LowerError::internal(format!("{:?} has no slot", dst)))?;
        self.emit(Instr::Stloc(slot));
        Ok(())
    }

    fn store(&mut self, place: Place) {
        match place {
            Place::Var(var) => self.emit(Instr::Stloc(self.allocation.var_slot(var))),
            Place::Arg(arg) => self.emit(Instr::Starg(ArgIndex(arg))),
        }
    }

    fn load(&mut self, place: Place) {
        match place {
            Place::Var(var) => self.emit(Instr::Ldloc(self.allocation.var_slot(var))),
            Place::Arg(arg) => self.emit(Instr::Ldarg(ArgIndex(arg))),
        }
    }

    /// Push the value of `temp`.
    fn push(&mut self, temp: Temp) -> LowerResult<()> {
        if self.plan.inlined.contains(&temp) {
            let def = self.defs[temp.0 as usize]
                .ok_or_else(|| LowerError::internal(format!("{:?} is never defined", temp)))?;
            let def = &self.lir.instrs[def];
            if let LirInstr::Update { place, op, prefix, .. } = def {
                return self.update(*place, *op, *prefix, true);
            }
            return self.value(def);
        }
        let slot = self
            .allocation
            .slot_of(temp)
            .ok_or_else(|| LowerError::internal(format!("{:?} read without a slot", temp)))?;
        self.emit(Instr::Ldloc(slot));
        Ok(())
    }

    fn clr_type(&self, temp: Temp) -> ClrType {
        self.lir.temp(temp).storage.clr_type()
    }

    /// Push the result of a value-producing instruction.
    fn value(&mut self, instr: &LirInstr) -> LowerResult<()> {
        match instr {
            LirInstr::Const { value, .. } => match value {
                Constant::Number(n) => self.emit(Instr::LdcR8(*n)),
                Constant::Str(s) => self.emit(Instr::Ldstr(s.clone())),
                Constant::Bool(b) => self.emit(Instr::LdcI4(*b as i32)),
                Constant::Undefined => self.emit(Instr::Ldnull),
                Constant::Null => self.emit(Instr::Call(MethodRef::Runtime(RuntimeFn::LoadJsNull))),
            },
            LirInstr::Load { place, .. } => self.load(*place),
            LirInstr::Box { src, .. } => {
                let from = self.clr_type(*src);
                self.push(*src)?;
                emit_coerce(&mut self.out, from, ClrType::Object);
            }
            LirInstr::Coerce { src, to, .. } => {
                let from = self.clr_type(*src);
                self.push(*src)?;
                emit_coerce(&mut self.out, from, *to);
            }
            LirInstr::Truthy { src, .. } => match self.clr_type(*src) {
                ClrType::Boolean => self.push(*src)?,
                ClrType::Double => {
                    // x != 0 && x == x
                    self.push(*src)?;
                    self.emit(Instr::LdcR8(0.0));
                    self.emit(Instr::Ceq);
                    self.emit(Instr::LdcI4(0));
                    self.emit(Instr::Ceq);
                    self.push(*src)?;
                    self.push(*src)?;
                    self.emit(Instr::Ceq);
                    self.emit(Instr::And);
                }
                _ => {
                    self.push(*src)?;
                    self.emit(Instr::Call(MethodRef::Runtime(RuntimeFn::ToBoolean)));
                }
            },
            LirInstr::Unary { op, src, .. } => {
                self.push(*src)?;
                match op {
                    UnOp::Neg => self.emit(Instr::Neg),
                    UnOp::Not => self.not(),
                }
            }
            LirInstr::Arith { op, a, b, .. } => {
                self.push(*a)?;
                self.push(*b)?;
                self.emit(match op {
                    ArithOp::Add => Instr::Add,
                    ArithOp::Sub => Instr::Sub,
                    ArithOp::Mul => Instr::Mul,
                    ArithOp::Div => Instr::Div,
                    ArithOp::Rem => Instr::Rem,
                });
            }
            LirInstr::Cmp { op, a, b, .. } => {
                self.push(*a)?;
                self.push(*b)?;
                match op {
                    CmpOp::Eq => self.emit(Instr::Ceq),
                    CmpOp::Ne => {
                        self.emit(Instr::Ceq);
                        self.not();
                    }
                    CmpOp::Lt => self.emit(Instr::Clt),
                    CmpOp::Gt => self.emit(Instr::Cgt),
                    // a <= b  <=>  !(a > b), with NaN comparing unordered
                    CmpOp::Le => {
                        self.emit(Instr::CgtUn);
                        self.not();
                    }
                    CmpOp::Ge => {
                        self.emit(Instr::CltUn);
                        self.not();
                    }
                }
            }
            LirInstr::CallRuntime { func, args, .. } => {
                for arg in args {
                    self.push(*arg)?;
                }
                self.emit(Instr::Call(MethodRef::Runtime(*func)));
            }
            LirInstr::NewArgsArray { len, .. } => {
                self.emit(Instr::LdcI4(*len as i32));
                self.emit(Instr::Newarr(ClrType::Object));
            }
            LirInstr::CallIntrinsic {
                cap, receiver, args, ..
            } => {
                let on_stack = matches!(args.as_slice(), [array] if self.plan.stack_arrays.contains_key(array));
                if !on_stack {
                    if let Some(receiver) = receiver {
                        self.push(*receiver)?;
                    }
                    for arg in args {
                        self.push(*arg)?;
                    }
                }
                self.emit(Instr::Call(MethodRef::Intrinsic(cap.method())));
            }
            other => return Err(LowerError::internal(format!("{:?} has no value", other))),
        }
        Ok(())
    }

    fn not(&mut self) {
        self.emit(Instr::LdcI4(0));
        self.emit(Instr::Ceq);
    }

    /// `++`/`--` of a float64 variable, leaving the expression's value on
    /// the stack if `keep`.
    fn update(&mut self, place: Place, op: UpdateOp, prefix: bool, keep: bool) -> LowerResult<()> {
        let Place::Var(var) = place else {
            return Err(LowerError::internal("update of an argument"));
        };
        let slot = self.allocation.var_slot(var);
        self.emit(Instr::Ldloc(slot));
        if keep && !prefix {
            self.emit(Instr::Dup);
        }
        self.emit(Instr::LdcR8(1.0));
        self.emit(match op {
            UpdateOp::Increment => Instr::Add,
            UpdateOp::Decrement => Instr::Sub,
        });
        if keep && prefix {
            self.emit(Instr::Dup);
        }
        self.emit(Instr::Stloc(slot));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::LocalIndex;
    use crate::ir::lower::tests::main_lir;
    use crate::ir::{alloc, peephole};

    fn body(code: &str, peephole: bool) -> MethodBody {
        let lir = main_lir(code).unwrap();
        let plan = if peephole {
            peephole::plan(&lir)
        } else {
            Plan::new(&lir)
        };
        let allocation = alloc::allocate(&lir, &plan).unwrap();
        emit(&lir, &allocation, &plan).unwrap()
    }

    #[test]
    fn test_postfix_update_keeps_old_value() {
        let body = body("let x = 5; let y = x++;", false);
        let x = LocalIndex(0);
        let y = LocalIndex(1);
        let start = body.instrs.iter().position(|instr| *instr == Instr::Ldloc(x)).unwrap();
        assert_eq!(
            &body.instrs[start..start + 5],
            &[
                Instr::Ldloc(x),
                Instr::Dup,
                Instr::LdcR8(1.0),
                Instr::Add,
                Instr::Stloc(x)
            ]
        );
        assert!(body.instrs.contains(&Instr::Stloc(y)));
    }

    #[test]
    fn test_discarded_update_has_no_dup() {
        let body = body("let x = 5; x--; --x;", true);
        assert!(!body.instrs.contains(&Instr::Dup));
        assert_eq!(body.instrs.iter().filter(|instr| **instr == Instr::Sub).count(), 2);
    }

    #[test]
    fn test_stack_array_shape() {
        let body = body("console.log('a');", true);
        assert_eq!(
            body.instrs,
            vec![
                Instr::Call(MethodRef::Runtime(RuntimeFn::GetIntrinsicGlobal(
                    crate::runtime::IntrinsicKind::Console
                ))),
                Instr::LdcI4(1),
                Instr::Newarr(ClrType::Object),
                Instr::Dup,
                Instr::LdcI4(0),
                Instr::Ldstr("a".to_string()),
                Instr::Stelem,
                Instr::Call(MethodRef::Intrinsic(
                    crate::runtime::capability(crate::runtime::IntrinsicKind::Console, "log")
                        .unwrap()
                        .method()
                )),
                Instr::Ret,
            ]
        );
        assert!(body.locals.is_empty());
    }

    #[test]
    fn test_unused_pure_values_are_dropped() {
        let body = body("let x = 1; x; 'unused'; x + 2;", true);
        assert!(!body.instrs.iter().any(|instr| matches!(instr, Instr::Ldstr(_))));
        assert!(!body.instrs.contains(&Instr::Pop));
    }
}
