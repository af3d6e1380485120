//! Low-level IR: a flat instruction list over SSA temps.
//!
//! Every temp is defined by exactly one instruction and only read after it.
//! Temps never live across a label or a jump: values that flow between
//! statements go through variables, which have fixed slots.

use crate::bytecode::{ClrType, Label};
use crate::runtime::{Capability, RuntimeFn};
use crate::scope::JsType;

pub use super::hir::{Place, UpdateOp, VarId};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Temp(pub u32);

impl std::fmt::Debug for Temp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// How a temp's value is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueStorage {
    /// A `float64` or `bool` held unboxed.
    UnboxedValue(ClrType),
    /// A reference of a statically known JS type.
    Reference(ClrType),
    /// A boxed value of any JS type.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Unboxed,
    Reference,
    Unknown,
}

impl ValueStorage {
    pub fn of(repr: ClrType, js: JsType) -> Self {
        match repr {
            ClrType::Double | ClrType::Boolean => ValueStorage::UnboxedValue(repr),
            ClrType::Object if js == JsType::Unknown => ValueStorage::Unknown,
            _ => ValueStorage::Reference(repr),
        }
    }

    pub fn clr_type(&self) -> ClrType {
        match self {
            ValueStorage::UnboxedValue(ty) | ValueStorage::Reference(ty) => *ty,
            ValueStorage::Unknown => ClrType::Object,
        }
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            ValueStorage::UnboxedValue(_) => StorageKind::Unboxed,
            ValueStorage::Reference(_) => StorageKind::Reference,
            ValueStorage::Unknown => StorageKind::Unknown,
        }
    }

    pub fn is_unboxed(&self) -> bool {
        matches!(self, ValueStorage::UnboxedValue(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempInfo {
    pub storage: ValueStorage,
    pub js: JsType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Number(f64),
    Str(String),
    Bool(bool),
    Undefined,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    /// float64 negation.
    Neg,
    /// Boolean negation.
    Not,
}

/// Comparison of two unboxed operands of the same type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// float64 arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Const {
        dst: Temp,
        value: Constant,
    },
    Load {
        dst: Temp,
        place: Place,
    },
    Store {
        place: Place,
        src: Temp,
    },
    /// Box an unboxed value.
    Box {
        dst: Temp,
        src: Temp,
    },
    /// Convert to `to` (float64 or object) with JS semantics.
    Coerce {
        dst: Temp,
        src: Temp,
        to: ClrType,
    },
    /// JS truthiness.
    Truthy {
        dst: Temp,
        src: Temp,
    },
    Unary {
        dst: Temp,
        op: UnOp,
        src: Temp,
    },
    Arith {
        dst: Temp,
        op: ArithOp,
        a: Temp,
        b: Temp,
    },
    Cmp {
        dst: Temp,
        op: CmpOp,
        a: Temp,
        b: Temp,
    },
    /// `++`/`--` of a float64 variable.  `dst` is the expression's value:
    /// the old value for postfix, the new one for prefix.
    Update {
        dst: Temp,
        place: Place,
        op: UpdateOp,
        prefix: bool,
    },
    CallRuntime {
        dst: Temp,
        func: RuntimeFn,
        args: Vec<Temp>,
    },
    /// `object[len]`, for a variadic intrinsic call.
    NewArgsArray {
        dst: Temp,
        len: u32,
    },
    StoreElem {
        array: Temp,
        index: u32,
        value: Temp,
    },
    CallIntrinsic {
        /// `None` for void methods.
        dst: Option<Temp>,
        cap: &'static Capability,
        receiver: Option<Temp>,
        args: Vec<Temp>,
    },
    Label(Label),
    Jump(Label),
    Branch {
        cond: Temp,
        if_true: bool,
        target: Label,
    },
    Return(Option<Temp>),
}

impl Instr {
    pub fn dst(&self) -> Option<Temp> {
        match self {
            Instr::Const { dst, .. }
            | Instr::Load { dst, .. }
            | Instr::Box { dst, .. }
            | Instr::Coerce { dst, .. }
            | Instr::Truthy { dst, .. }
            | Instr::Unary { dst, .. }
            | Instr::Arith { dst, .. }
            | Instr::Cmp { dst, .. }
            | Instr::Update { dst, .. }
            | Instr::CallRuntime { dst, .. }
            | Instr::NewArgsArray { dst, .. } => Some(*dst),
            Instr::CallIntrinsic { dst, .. } => *dst,
            Instr::Store { .. }
            | Instr::StoreElem { .. }
            | Instr::Label(_)
            | Instr::Jump(_)
            | Instr::Branch { .. }
            | Instr::Return(_) => None,
        }
    }

    /// Temps read by this instruction, in evaluation order.
    pub fn inputs(&self) -> Vec<Temp> {
        match self {
            Instr::Const { .. }
            | Instr::Load { .. }
            | Instr::Update { .. }
            | Instr::NewArgsArray { .. }
            | Instr::Label(_)
            | Instr::Jump(_)
            | Instr::Return(None) => Vec::new(),
            Instr::Store { src, .. }
            | Instr::Box { src, .. }
            | Instr::Coerce { src, .. }
            | Instr::Truthy { src, .. }
            | Instr::Unary { src, .. } => vec![*src],
            Instr::Arith { a, b, .. } | Instr::Cmp { a, b, .. } => vec![*a, *b],
            Instr::CallRuntime { args, .. } => args.clone(),
            Instr::StoreElem { array, value, .. } => vec![*array, *value],
            Instr::CallIntrinsic { receiver, args, .. } => receiver.iter().chain(args.iter()).copied().collect(),
            Instr::Branch { cond, .. } => vec![*cond],
            Instr::Return(Some(value)) => vec![*value],
        }
    }

    /// Whether the instruction must run even when its result is unused.
    pub fn has_side_effects(&self) -> bool {
        match self {
            Instr::Const { .. }
            | Instr::Load { .. }
            | Instr::Box { .. }
            | Instr::Truthy { .. }
            | Instr::Unary { .. }
            | Instr::Arith { .. }
            | Instr::Cmp { .. }
            | Instr::NewArgsArray { .. } => false,
            // ToNumber may run user code (valueOf).
            Instr::Coerce { .. } => true,
            Instr::CallRuntime { func, .. } => !matches!(func, RuntimeFn::GetIntrinsicGlobal(_) | RuntimeFn::LoadJsNull),
            Instr::Store { .. }
            | Instr::Update { .. }
            | Instr::StoreElem { .. }
            | Instr::CallIntrinsic { .. }
            | Instr::Label(_)
            | Instr::Jump(_)
            | Instr::Branch { .. }
            | Instr::Return(_) => true,
        }
    }
}

/// A lowered body.
#[derive(Debug)]
pub struct Lir {
    pub instrs: Vec<Instr>,
    pub temps: Vec<TempInfo>,
    /// Storage of each declared variable, by `VarId`.
    pub vars: Vec<ClrType>,
    pub returns_value: bool,
}

impl Lir {
    pub fn temp(&self, temp: Temp) -> &TempInfo {
        &self.temps[temp.0 as usize]
    }

    /// Index of the instruction defining each temp.
    pub fn def_sites(&self) -> Vec<Option<usize>> {
        let mut sites = vec![None; self.temps.len()];
        for (ndx, instr) in self.instrs.iter().enumerate() {
            if let Some(dst) = instr.dst() {
                sites[dst.0 as usize] = Some(ndx);
            }
        }
        sites
    }

    /// Index of the last instruction reading each temp.
    pub fn last_uses(&self) -> Vec<Option<usize>> {
        let mut last = vec![None; self.temps.len()];
        for (ndx, instr) in self.instrs.iter().enumerate() {
            for input in instr.inputs() {
                last[input.0 as usize] = Some(ndx);
            }
        }
        last
    }

    pub fn use_counts(&self) -> Vec<u32> {
        let mut counts = vec![0; self.temps.len()];
        for instr in &self.instrs {
            for input in instr.inputs() {
                counts[input.0 as usize] += 1;
            }
        }
        counts
    }

    pub fn dump(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for (ndx, instr) in self.instrs.iter().enumerate() {
            let ty = match instr.dst() {
                Some(dst) => format!("{:?}", self.temp(dst).storage),
                None => "--".to_string(),
            };
            // Writing into a String never fails.
            let _ = writeln!(out, "{:4} {:24} {:?}", ndx, ty, instr);
        }
        out
    }
}

/// Appends instructions, handing out temps and labels.
pub struct LirBuilder {
    instrs: Vec<Instr>,
    temps: Vec<TempInfo>,
    next_label: u32,
}

impl LirBuilder {
    pub fn new() -> Self {
        LirBuilder {
            instrs: Vec::new(),
            temps: Vec::new(),
            next_label: 0,
        }
    }

    pub fn new_temp(&mut self, storage: ValueStorage, js: JsType) -> Temp {
        let temp = Temp(self.temps.len() as u32);
        self.temps.push(TempInfo { storage, js });
        temp
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn push(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    pub fn info(&self, temp: Temp) -> TempInfo {
        self.temps[temp.0 as usize]
    }

    pub fn finish(self, vars: Vec<ClrType>, returns_value: bool) -> Lir {
        Lir {
            instrs: self.instrs,
            temps: self.temps,
            vars,
            returns_value,
        }
    }
}
