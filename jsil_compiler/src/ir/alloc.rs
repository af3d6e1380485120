//! Local slot assignment.
//!
//! Variables get one slot each, in declaration order.  Temps share the
//! remaining slots: a backward scan over the body frees a temp's slot at its
//! definition and picks one at its last use, so two temps only share a slot
//! when their live ranges are disjoint.  Slots are reused only among temps
//! of the same storage class.

use std::collections::HashMap;

use super::lir::{Lir, StorageKind, Temp, VarId};
use super::peephole::Plan;
use super::{LowerError, LowerResult};
use crate::bytecode::{ClrType, LocalIndex};

#[derive(Debug)]
pub(super) struct Allocation {
    /// Type of every local of the method, variables first.
    pub locals: Vec<ClrType>,
    slots: Box<[Option<LocalIndex>]>,
}

impl Allocation {
    pub fn var_slot(&self, var: VarId) -> LocalIndex {
        LocalIndex(var.0)
    }

    /// `None` for temps that are never read, or that live on the stack.
    pub fn slot_of(&self, temp: Temp) -> Option<LocalIndex> {
        self.slots.get(temp.0 as usize).copied().flatten()
    }
}

type SlotClass = (StorageKind, ClrType);

struct State {
    locals: Vec<ClrType>,
    free: HashMap<SlotClass, Vec<LocalIndex>>,
}

impl State {
    fn set_free(&mut self, class: SlotClass, slot: LocalIndex) {
        self.free.entry(class).or_default().push(slot);
    }

    fn pick_free(&mut self, class: SlotClass) -> LowerResult<LocalIndex> {
        if let Some(slot) = self.free.get_mut(&class).and_then(|slots| slots.pop()) {
            return Ok(slot);
        }
        let index = u16::try_from(self.locals.len()).map_err(|_| LowerError::unsupported("more than 65536 locals"))?;
        self.locals.push(class.1);
        Ok(LocalIndex(index))
    }
}

pub(super) fn allocate(lir: &Lir, plan: &Plan) -> LowerResult<Allocation> {
    let mut state = State {
        locals: lir.vars.clone(),
        free: HashMap::new(),
    };
    let mut slots = vec![None; lir.temps.len()].into_boxed_slice();
    let class_of = |temp: Temp| {
        let storage = lir.temp(temp).storage;
        (storage.kind(), storage.clr_type())
    };

    for instr in lir.instrs.iter().rev() {
        if let Some(dst) = instr.dst() {
            if let Some(slot) = slots[dst.0 as usize] {
                state.set_free(class_of(dst), slot);
            }
        }
        for input in instr.inputs() {
            if plan.is_stack_only(input) || slots[input.0 as usize].is_some() {
                continue;
            }
            slots[input.0 as usize] = Some(state.pick_free(class_of(input))?);
        }
    }

    Ok(Allocation {
        locals: state.locals,
        slots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::lower::tests::main_lir;
    use crate::ir::peephole;
    use proptest::prelude::*;

    /// Check that temps sharing a slot have disjoint live ranges, and that
    /// every slot has the type of the temps stored in it.
    fn check_allocation(lir: &Lir, allocation: &Allocation) {
        let defs = lir.def_sites();
        let last_uses = lir.last_uses();
        let mut ranges: HashMap<LocalIndex, Vec<(usize, usize)>> = HashMap::new();

        for (ndx, info) in lir.temps.iter().enumerate() {
            let Some(slot) = allocation.slot_of(Temp(ndx as u32)) else {
                continue;
            };
            assert!(slot.0 as usize >= lir.vars.len(), "temp t{} in a variable slot", ndx);
            assert_eq!(allocation.locals[slot.0 as usize], info.storage.clr_type());
            // Program points: uses at 2i, definitions at 2i+1.
            let def = 2 * defs[ndx].unwrap() + 1;
            let last_use = 2 * last_uses[ndx].unwrap();
            ranges.entry(slot).or_default().push((def, last_use));
        }

        for (slot, mut ranges) in ranges {
            ranges.sort();
            for pair in ranges.windows(2) {
                assert!(
                    pair[0].1 < pair[1].0,
                    "overlapping ranges in {:?}: {:?}\n{}",
                    slot,
                    pair,
                    lir.dump()
                );
            }
        }
    }

    #[test]
    fn test_variables_come_first() {
        let lir = main_lir("let a = 1; let s = 'x'; console.log(a + 1, s);").unwrap();
        let allocation = allocate(&lir, &Plan::new(&lir)).unwrap();
        assert_eq!(&allocation.locals[..2], &lir.vars[..]);
        check_allocation(&lir, &allocation);
    }

    #[test]
    fn test_slots_are_reused() {
        let code = "let a = 1; let b = a * 2; let c = b * 3; let d = c * 4;";
        let lir = main_lir(code).unwrap();
        let allocation = allocate(&lir, &Plan::new(&lir)).unwrap();
        let temps_with_slots = (0..lir.temps.len())
            .filter(|ndx| allocation.slot_of(Temp(*ndx as u32)).is_some())
            .count();
        assert!(allocation.locals.len() - lir.vars.len() < temps_with_slots);
        check_allocation(&lir, &allocation);
    }

    #[test]
    fn test_stack_only_temps_get_no_slot() {
        let lir = main_lir("console.log(1, 'a');").unwrap();
        let plan = peephole::plan(&lir);
        let allocation = allocate(&lir, &plan).unwrap();
        assert!(allocation.locals.is_empty());
    }

    #[test]
    fn test_local_index_overflow_is_reported() {
        let mut state = State {
            locals: vec![ClrType::Object; u16::MAX as usize],
            free: HashMap::new(),
        };
        let class = (StorageKind::Reference, ClrType::Object);
        assert_eq!(state.pick_free(class), Ok(LocalIndex(u16::MAX)));
        assert!(state.pick_free(class).is_err());

        state.set_free(class, LocalIndex(3));
        assert_eq!(state.pick_free(class), Ok(LocalIndex(3)));
    }

    fn arb_expr() -> impl Strategy<Value = String> {
        let leaf = prop_oneof![
            (0u32..100).prop_map(|n| n.to_string()),
            prop::sample::select(vec!["a", "b", "c", "s"]).prop_map(str::to_string),
        ];
        leaf.prop_recursive(4, 24, 2, |inner| {
            prop_oneof![
                (
                    inner.clone(),
                    prop::sample::select(vec!["+", "-", "*", "%", "<", ">=", "===", "!="]),
                    inner.clone()
                )
                    .prop_map(|(l, op, r)| format!("({} {} {})", l, op, r)),
                inner.clone().prop_map(|e| format!("-({})", e)),
                inner.prop_map(|e| format!("!({})", e)),
            ]
        })
    }

    fn arb_stmt() -> impl Strategy<Value = String> {
        prop_oneof![
            arb_expr().prop_map(|e| format!("console.log({});", e)),
            (arb_expr(), arb_expr()).prop_map(|(x, y)| format!("console.log({}, {});", x, y)),
            arb_expr().prop_map(|e| format!("c = {};", e)),
            Just("a++;".to_string()),
            arb_expr().prop_map(|e| format!("if ({}) {{ b = b + 1; }}", e)),
        ]
    }

    proptest! {
        #[test]
        fn test_slot_reuse_is_safe(stmts in prop::collection::vec(arb_stmt(), 1..6), peephole in any::<bool>()) {
            let code = format!("let a = 1; let b = 2.5; let c = 0; let s = 'x';\n{}", stmts.join("\n"));
            let lir = main_lir(&code).unwrap();
            let plan = if peephole { peephole::plan(&lir) } else { Plan::new(&lir) };
            let allocation = allocate(&lir, &plan).unwrap();
            check_allocation(&lir, &allocation);
        }
    }
}
