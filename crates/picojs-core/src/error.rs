//! VM execution errors.

use thiserror::Error;

use crate::value::Value;

/// VM execution errors.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("TypeError: {0}")]
    TypeError(String),

    #[error("ReferenceError: {0}")]
    ReferenceError(String),

    #[error("RangeError: {0}")]
    RangeError(String),

    #[error("SyntaxError: {0}")]
    SyntaxError(String),

    #[error("InternalError: {0}")]
    InternalError(String),

    #[error("RangeError: Maximum call stack size exceeded")]
    StackOverflow,

    #[error("OutOfMemory")]
    OutOfMemory,

    /// A thrown JS exception, unwound up to the nearest catch handler or
    /// out of the top-level call.
    #[error("Uncaught exception: {0}")]
    Exception(Box<ThrownValue>),

    #[error("Bytecode error: {0}")]
    Bytecode(#[from] picojs_bytecode::BytecodeError),

    /// Execution stopped because the debugger's single-step hook asked
    /// for a pause.
    #[error("Execution suspended at debugger breakpoint")]
    DebuggerPause,
}

/// A thrown JavaScript value, carrying the call stack at the point it
/// escaped the innermost matching catch handler.
#[derive(Debug)]
pub struct ThrownValue {
    pub value: Value,
    pub message: String,
    pub stack: Vec<StackFrame>,
}

impl std::fmt::Display for ThrownValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// One frame of a captured stack trace.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub function_name: String,
    pub instruction_offset: u32,
}

impl VmError {
    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::TypeError(msg.into())
    }

    pub fn reference_error(msg: impl Into<String>) -> Self {
        Self::ReferenceError(msg.into())
    }

    pub fn range_error(msg: impl Into<String>) -> Self {
        Self::RangeError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    pub fn exception(value: Value, stack: Vec<StackFrame>) -> Self {
        let message = if let Some(s) = value.as_string() {
            s.get().as_str().to_string()
        } else {
            format!("{value:?}")
        };
        Self::Exception(Box::new(ThrownValue { message, value, stack }))
    }
}

pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_display_uses_captured_message() {
        let err = VmError::exception(Value::number(1.0), Vec::new());
        assert_eq!(err.to_string(), "Uncaught exception: 1");
    }

    #[test]
    fn bytecode_error_converts_via_from() {
        let err: VmError = picojs_bytecode::BytecodeError::InvalidFunctionIndex(3).into();
        assert!(matches!(err, VmError::Bytecode(_)));
    }
}
