//! High-level IR: the body's statement tree with every identifier resolved
//! to a variable slot or an argument, and every expression annotated with
//! its inferred JS type.

use swc_atoms::JsWord;

use crate::bytecode::ClrType;
use crate::runtime::Capability;
use crate::scope::JsType;

/// Index into [`Body::vars`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u16);

impl std::fmt::Debug for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "var{}", self.0)
    }
}

/// A declared variable.  Each one gets a stable local slot.
#[derive(Debug, Clone)]
pub struct VarInfo {
    pub name: JsWord,
    pub storage: ClrType,
    pub js: JsType,
}

/// Something that can be read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Var(VarId),
    /// Argument slot, by absolute argument index.
    Arg(u16),
}

#[derive(Debug)]
pub struct Body {
    pub vars: Vec<VarInfo>,
    pub stmts: Vec<Stmt>,
    pub returns_value: bool,
}

impl Body {
    pub fn storage(&self, place: Place) -> ClrType {
        match place {
            Place::Var(var) => self.vars[var.0 as usize].storage,
            Place::Arg(_) => ClrType::Object,
        }
    }

    pub fn js_type(&self, place: Place) -> JsType {
        match place {
            Place::Var(var) => self.vars[var.0 as usize].js,
            Place::Arg(_) => JsType::Unknown,
        }
    }
}

#[derive(Debug)]
pub enum Stmt {
    Expr(Expr),
    /// `let`/`const`/`var` declarator.  `init: None` resets the variable to
    /// undefined (`let x;`).
    Declare { var: VarId, init: Option<Expr> },
    If {
        test: Expr,
        cons: Vec<Stmt>,
        alt: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Gt,
    LtEq,
    GtEq,
    LooseEq,
    LooseNe,
    StrictEq,
    StrictNe,
}

impl BinaryOp {
    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem
        )
    }

    pub fn is_equality(&self) -> bool {
        matches!(
            self,
            BinaryOp::LooseEq | BinaryOp::LooseNe | BinaryOp::StrictEq | BinaryOp::StrictNe
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Increment,
    Decrement,
}

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub js: JsType,
}

#[derive(Debug)]
pub enum ExprKind {
    Number(f64),
    Str(String),
    Bool(bool),
    Undefined,
    Null,
    Load(Place),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Conditional {
        test: Box<Expr>,
        cons: Box<Expr>,
        alt: Box<Expr>,
    },
    /// `op: None` for plain `=`.
    Assign {
        place: Place,
        op: Option<BinaryOp>,
        value: Box<Expr>,
    },
    Update {
        place: Place,
        op: UpdateOp,
        prefix: bool,
    },
    IntrinsicCall {
        cap: &'static Capability,
        args: Vec<Expr>,
    },
    Seq(Vec<Expr>),
}

impl Expr {
    pub fn new(kind: ExprKind, js: JsType) -> Self {
        Expr { kind, js }
    }
}
