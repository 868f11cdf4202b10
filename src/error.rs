//! Error types for the avm2 virtual machine
//!
//! Engine errors (malformed bytecode, unsupported operations, broken
//! invariants) and scripted exceptions share one enum so that both execution
//! tiers can propagate them with `?`. Only scripted exceptions are visible to
//! the exception-table dispatch in [`crate::vm`].

use crate::runtime::Value;
use std::fmt;
use thiserror::Error;

/// Result type for avm2 operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed bytecode: truncated stream, branch outside the method, target
    /// inside another instruction's operands
    #[error("FormatError: {message} at offset {offset}")]
    FormatError { message: String, offset: usize },

    /// Opcode or operand-type combination without a defined semantic
    #[error("UnsupportedError: {0}")]
    Unsupported(String),

    /// Scripted error raised by a semantic helper (TypeError, ReferenceError, ...)
    #[error("{kind}: {message}")]
    RuntimeError { kind: ErrorKind, message: String },

    /// Value thrown by the `throw` opcode
    #[error("Uncaught exception: {}", .0.to_ecma_string())]
    Thrown(Value),

    /// Broken engine invariant
    #[error("InternalError: {0}")]
    InternalError(String),

    /// Invalid configuration
    #[error("ConfigError: {0}")]
    ConfigError(String),

    /// Invalid module description
    #[error("ModuleError: {0}")]
    ModuleError(String),

    /// IO error
    #[error("IOError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

/// Scripted error classes raised by the helpers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum ErrorKind {
    /// TypeError - wrong type for operation
    TypeError,
    /// ReferenceError - unresolvable property
    ReferenceError,
    /// RangeError - value out of range (including call depth)
    RangeError,
    /// ArgumentError - wrong number of arguments
    ArgumentError,
    /// VerifyError - bytecode rejected at run time
    VerifyError,
    /// Generic Error
    GenericError,
}

impl ErrorKind {
    /// Name of the error class the model instantiates for this kind
    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ArgumentError => "ArgumentError",
            ErrorKind::VerifyError => "VerifyError",
            ErrorKind::GenericError => "Error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

impl Error {
    /// Create a new format error
    pub fn format_error(message: impl Into<String>, offset: usize) -> Self {
        Error::FormatError {
            message: message.into(),
            offset,
        }
    }

    /// Create a new unsupported-operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::Unsupported(message.into())
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::InternalError(message.into())
    }

    /// Create a new runtime error of the given kind
    pub fn runtime(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::RuntimeError {
            kind,
            message: message.into(),
        }
    }

    /// Create a new TypeError
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::runtime(ErrorKind::TypeError, message)
    }

    /// Create a new ReferenceError
    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::runtime(ErrorKind::ReferenceError, message)
    }

    /// Create a new RangeError
    pub fn range_error(message: impl Into<String>) -> Self {
        Self::runtime(ErrorKind::RangeError, message)
    }

    /// Whether the exception table may intercept this error
    pub fn is_catchable(&self) -> bool {
        matches!(self, Error::Thrown(_) | Error::RuntimeError { .. })
    }

    /// Whether this is a format error
    pub fn is_format_error(&self) -> bool {
        matches!(self, Error::FormatError { .. })
    }

    /// Error kind for runtime errors
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::RuntimeError { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_display() {
        let err = Error::format_error("jump outside of code", 12);
        assert_eq!(err.to_string(), "FormatError: jump outside of code at offset 12");
        assert!(err.is_format_error());
        assert!(!err.is_catchable());
    }

    #[test]
    fn test_runtime_errors_are_catchable() {
        let err = Error::type_error("not a function");
        assert!(err.is_catchable());
        assert_eq!(err.kind(), Some(ErrorKind::TypeError));
        assert_eq!(err.to_string(), "TypeError: not a function");
    }

    #[test]
    fn test_thrown_value_display() {
        let err = Error::Thrown(Value::from("boom"));
        assert!(err.is_catchable());
        assert_eq!(err.to_string(), "Uncaught exception: boom");
    }

    #[test]
    fn test_internal_errors_are_not_catchable() {
        assert!(!Error::internal("stack underflow").is_catchable());
        assert!(!Error::unsupported("opcode 0xff").is_catchable());
    }
}
