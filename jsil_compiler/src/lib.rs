//! A compiler from JavaScript scripts to the bytecode of a typed, stack-based
//! managed VM.
//!
//! [`coordinator::compile_file`] is the entry point: it parses the script,
//! builds the scope tree, declares every callable (phase 1), then emits each
//! body (phase 2), first through the IR pipeline ([`ir`]) and, when that
//! cannot handle the body, through the direct AST emitter.

pub mod bytecode;
pub mod bytecode_compiler;
pub mod classes;
pub mod closures;
pub mod common;
pub mod coordinator;
pub mod ir;
pub mod runtime;
pub mod scope;
pub mod tracing;
pub mod variables;

#[cfg(test)]
mod testvm;

pub use bytecode::{Assembly, ClrType, Instr, MethodBody};
pub use common::{Error, Result};
pub use coordinator::{compile_file, compile_str, CompileFlags, CompiledAssembly};
pub use ir::IrMetrics;
