//! The IR pipeline: AST → HIR → LIR → slots → bytecode.
//!
//! It covers a strict subset of the language (straight-line arithmetic on
//! local variables, `if`/`while`, and calls to intrinsic host methods) for
//! callables that own no captured bindings and read nothing from enclosing
//! scopes.  Lowering is total-or-nothing: the first unsupported shape aborts
//! the whole body with a [`LowerError`], and the coordinator compiles that
//! body with the direct emitter instead.
//!
//! Nothing persists across bodies; each one is lowered, allocated and
//! emitted on its own.

mod alloc;
mod codegen;
mod hir;
mod lir;
mod lower;
mod metrics;
mod peephole;

pub use metrics::{Fallback, IrMetrics, KindCounts};

use crate::bytecode::MethodBody;
use crate::coordinator::{Callable, CallableNode, EmitEnv};
use crate::tracing;

/// Why a body could not be lowered.  Never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerError {
    pub reason: String,
}

impl LowerError {
    pub(crate) fn unsupported(what: impl std::fmt::Display) -> Self {
        LowerError {
            reason: format!("unsupported: {}", what),
        }
    }

    pub(crate) fn internal(what: impl std::fmt::Display) -> Self {
        LowerError {
            reason: format!("internal: {}", what),
        }
    }
}

impl std::fmt::Display for LowerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

pub(crate) type LowerResult<T> = std::result::Result<T, LowerError>;

/// Compile one callable body through the IR pipeline.
pub fn compile_ir(env: &EmitEnv<'_>, callable: &Callable, node: &CallableNode<'_>) -> LowerResult<MethodBody> {
    let section = tracing::section("ir");
    let hir = lower::build_hir(env, callable, node)?;
    let lir = lower::lower_hir(&hir)?;
    section.log("lir", &lir.dump());
    let plan = if env.flags.peephole {
        peephole::plan(&lir)
    } else {
        peephole::Plan::new(&lir)
    };
    let allocation = alloc::allocate(&lir, &plan)?;
    codegen::emit(&lir, &allocation, &plan)
}
