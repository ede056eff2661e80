//! Bytecode module format for the picojs VM core.
//!
//! This crate is pure data: opcodes, operands, per-function code blocks,
//! and the module that groups them. It knows nothing about execution —
//! that is `picojs-core`'s job — which keeps the format independently
//! testable and usable by a future (out-of-scope) codegen crate.

pub mod constant;
pub mod error;
pub mod function;
pub mod instruction;
pub mod module;
pub mod operand;

pub use constant::Constant;
pub use error::BytecodeError;
pub use function::{CacheSlot, CatchEntry, Function, FunctionBuilder, FunctionFlags, UpvalueCapture};
pub use instruction::{Instruction, Opcode};
pub use module::{Module, ModuleBuilder};
pub use operand::{CacheIndex, ConstantIndex, FunctionIndex, JumpOffset, LocalIndex, Register};
