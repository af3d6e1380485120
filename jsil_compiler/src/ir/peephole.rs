//! Stack-resident argument arrays.
//!
//! A variadic intrinsic call is lowered as `receiver; array = new object[n];
//! array[0] = v0; ...; call(receiver, array)`, each step through a temp.
//! When nothing between the array's allocation and the call can observe
//! those temps, the code generator keeps the receiver and the array on the
//! evaluation stack and computes each element in place, so none of them
//! gets a local slot.

use std::collections::{HashMap, HashSet};

use super::lir::{Instr, Lir, Temp, UnOp};
use crate::runtime::RuntimeFn;

#[derive(Debug)]
pub(super) struct Plan {
    /// Temps computed at their single use instead of in a slot.
    pub inlined: HashSet<Temp>,
    /// Arrays built on the stack, with the receiver pushed just before them.
    pub stack_arrays: HashMap<Temp, Option<Temp>>,
}

impl Plan {
    /// Constants are pushed where they are read.
    pub fn new(lir: &Lir) -> Self {
        let inlined = lir
            .instrs
            .iter()
            .filter_map(|instr| match instr {
                Instr::Const { dst, .. } => Some(*dst),
                _ => None,
            })
            .collect();
        Plan {
            inlined,
            stack_arrays: HashMap::new(),
        }
    }

    pub fn is_stack_only(&self, temp: Temp) -> bool {
        self.inlined.contains(&temp) || self.stack_arrays.contains_key(&temp)
    }
}

pub(super) fn plan(lir: &Lir) -> Plan {
    let uses = lir.use_counts();
    let defs = lir.def_sites();
    let mut plan = Plan::new(lir);

    for (ndx, instr) in lir.instrs.iter().enumerate() {
        if let Instr::NewArgsArray { dst, len } = instr {
            let matcher = Matcher {
                lir,
                uses: &uses,
                defs: &defs,
            };
            if let Some((receiver, inlined)) = matcher.match_call(ndx, *dst, *len) {
                plan.inlined.extend(inlined);
                if let Some(receiver) = receiver {
                    plan.inlined.insert(receiver);
                }
                plan.stack_arrays.insert(*dst, receiver);
            }
        }
    }
    plan
}

struct Matcher<'a> {
    lir: &'a Lir,
    uses: &'a [u32],
    defs: &'a [Option<usize>],
}

impl<'a> Matcher<'a> {
    fn single_use(&self, temp: Temp) -> bool {
        self.uses[temp.0 as usize] == 1
    }

    fn def(&self, temp: Temp) -> Option<&'a Instr> {
        self.defs[temp.0 as usize].map(|ndx| &self.lir.instrs[ndx])
    }

    /// Match `[receiver] array (element* store)* call` starting at the
    /// array's allocation.  Returns the receiver and the inlined temps.
    fn match_call(&self, alloc_ndx: usize, array: Temp, len: u32) -> Option<(Option<Temp>, Vec<Temp>)> {
        if self.uses[array.0 as usize] != len + 1 {
            return None;
        }

        let mut inlined = Vec::new();
        let mut pending = Vec::new();
        let mut next_index = 0;
        for instr in &self.lir.instrs[alloc_ndx + 1..] {
            match instr {
                Instr::StoreElem { array: a, index, value } if *a == array => {
                    if *index != next_index {
                        return None;
                    }
                    let mut tree = Vec::new();
                    if !self.inlinable(*value, len == 1, &mut tree) {
                        return None;
                    }
                    tree.sort();
                    pending.sort();
                    if tree != pending {
                        return None;
                    }
                    inlined.append(&mut pending);
                    next_index += 1;
                }
                Instr::CallIntrinsic { receiver, args, .. } if args.as_slice() == [array] => {
                    if next_index != len || !pending.is_empty() {
                        return None;
                    }
                    let receiver = match receiver {
                        Some(receiver) => Some(self.match_receiver(alloc_ndx, *receiver)?),
                        None => None,
                    };
                    return Some((receiver, inlined));
                }
                other => pending.push(other.dst()?),
            }
        }
        None
    }

    /// The receiver must be a host object fetched right before the array.
    fn match_receiver(&self, alloc_ndx: usize, receiver: Temp) -> Option<Temp> {
        let fetch_ndx = alloc_ndx.checked_sub(1)?;
        match &self.lir.instrs[fetch_ndx] {
            Instr::CallRuntime {
                dst,
                func: RuntimeFn::GetIntrinsicGlobal(_),
                ..
            } if *dst == receiver && self.single_use(receiver) => Some(receiver),
            _ => None,
        }
    }

    /// Whether `temp` can be computed at its use.  Collects the temps
    /// involved into `tree`.
    fn inlinable(&self, temp: Temp, sole_element: bool, tree: &mut Vec<Temp>) -> bool {
        if !self.single_use(temp) {
            return false;
        }
        let Some(def) = self.def(temp) else {
            return false;
        };
        let ok = match def {
            Instr::Const { .. } | Instr::Load { .. } => true,
            // Writes a variable: nothing else may be reordered around it.
            Instr::Update { .. } => sole_element,
            Instr::Box { src, .. } => self.inlinable(*src, sole_element, tree),
            Instr::Unary {
                op: UnOp::Neg | UnOp::Not,
                src,
                ..
            } => self.is_leaf(*src) && self.inlinable(*src, sole_element, tree),
            _ => false,
        };
        if ok {
            tree.push(temp);
        }
        ok
    }

    fn is_leaf(&self, temp: Temp) -> bool {
        matches!(self.def(temp), Some(Instr::Const { .. } | Instr::Load { .. }))
    }
}
