//! kokoki = Korvatunturin Konkatenatiivinen Kieli
//!
//! A Forth like programming language: source text is compiled in a single
//! pass to a flat bytecode stream and executed by a stack-based virtual
//! machine. Compilation and execution alternate on one shared context, so
//! each evaluation extends the same buffer and continues where the
//! previous one stopped.

pub mod compiler;
pub mod context;
pub mod names;
pub mod natives;
pub mod opcode;
pub mod reader;
pub mod value;
pub mod vm;

pub use context::{init, CompileError, Context};
pub use value::Value;
