//! Parse diagnostics.
//!
//! A parse error is recoverable only at top-level statement boundaries:
//! once the source-error-manager has recorded one, the parser stops and
//! callers propagate `None` without raising a second diagnostic for the
//! same cause.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("unexpected token at {offset}: {message}")]
    UnexpectedToken { offset: u32, message: String },
    #[error("unterminated string literal starting at {offset}")]
    UnterminatedString { offset: u32 },
    #[error("unterminated template literal starting at {offset}")]
    UnterminatedTemplate { offset: u32 },
    #[error("invalid number literal at {offset}")]
    InvalidNumber { offset: u32 },
    #[error("';' expected at {offset}")]
    MissingSemicolon { offset: u32 },
    #[error("maximum parser recursion depth exceeded at {offset}")]
    RecursionLimit { offset: u32 },
    #[error("'use strict' violation at {offset}: {message}")]
    StrictModeViolation { offset: u32, message: String },
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Accumulates diagnostics across a parse. Mirrors a source-error-manager:
/// parsing stops for good once `has_errors()` is true, rather than
/// reporting a cascade of errors caused by the first one.
#[derive(Debug, Default)]
pub struct ErrorManager {
    errors: Vec<ParseError>,
}

impl ErrorManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, error: ParseError) {
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }

    pub fn first(&self) -> Option<&ParseError> {
        self.errors.first()
    }
}
