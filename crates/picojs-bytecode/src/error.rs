//! Errors surfaced while loading or indexing a bytecode module.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BytecodeError {
    #[error("invalid function index {0}")]
    InvalidFunctionIndex(u32),

    #[error("invalid constant index {0} in function {1}")]
    InvalidConstantIndex(u32, u32),

    #[error("malformed module: {0}")]
    Malformed(String),
}
