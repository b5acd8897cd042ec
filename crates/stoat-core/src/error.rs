//! VM error types

use crate::value::Value;
use thiserror::Error;

/// VM execution errors
#[derive(Debug, Error)]
pub enum VmError {
    /// Type error (e.g., calling a non-callable, property access on nullish)
    #[error("TypeError: {0}")]
    TypeError(String),

    /// Reference error (identifier resolution failed)
    #[error("ReferenceError: {0}")]
    ReferenceError(String),

    /// Range error (value outside an operation's legal domain)
    #[error("RangeError: {0}")]
    RangeError(String),

    /// Error signaled by a host-provided native callable
    #[error("Error: {0}")]
    Host(String),

    /// Internal invariant violation; not catchable by language code
    #[error("InternalError: {0}")]
    Internal(String),

    /// Call stack exceeded its depth limit
    #[error("RangeError: Maximum call stack size exceeded")]
    StackOverflow,

    /// Heap exhausted; fatal, never catchable
    #[error(transparent)]
    OutOfMemory(#[from] stoat_gc::OomError),

    /// Thrown language-level value
    #[error("Uncaught {0}")]
    Thrown(Box<ThrownValue>),
}

/// A thrown value with its trace
#[derive(Debug)]
pub struct ThrownValue {
    /// The thrown value
    pub value: Value,
    /// Rendered message
    pub message: String,
    /// Frame-by-frame trace, innermost first
    pub stack: Vec<StackFrame>,
}

impl std::fmt::Display for ThrownValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.stack {
            write!(f, "\n    at {}", frame)?;
        }
        Ok(())
    }
}

/// One frame of an error trace
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// Function name
    pub function_name: String,
    /// Source name
    pub source: String,
    /// Line number, when line info was compiled in
    pub line: Option<u32>,
}

impl std::fmt::Display for StackFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} ({}:{})", self.function_name, self.source, line),
            None => write!(f, "{} ({})", self.function_name, self.source),
        }
    }
}

impl VmError {
    /// Create a type error
    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::TypeError(msg.into())
    }

    /// Create a reference error
    pub fn reference_error(msg: impl Into<String>) -> Self {
        Self::ReferenceError(msg.into())
    }

    /// Create a range error
    pub fn range_error(msg: impl Into<String>) -> Self {
        Self::RangeError(msg.into())
    }

    /// Create a host error
    pub fn host(msg: impl Into<String>) -> Self {
        Self::Host(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The error-kind name exposed as the `name` property of caught values
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::TypeError(_) => "TypeError",
            Self::ReferenceError(_) => "ReferenceError",
            Self::RangeError(_) | Self::StackOverflow => "RangeError",
            Self::Host(_) => "Error",
            Self::Internal(_) => "InternalError",
            Self::OutOfMemory(_) => "OutOfMemory",
            Self::Thrown(_) => "Error",
        }
    }

    /// The message without the kind prefix, for error-value construction
    pub fn message(&self) -> String {
        match self {
            Self::TypeError(m)
            | Self::ReferenceError(m)
            | Self::RangeError(m)
            | Self::Host(m)
            | Self::Internal(m) => m.clone(),
            Self::StackOverflow => "Maximum call stack size exceeded".to_string(),
            Self::OutOfMemory(oom) => oom.to_string(),
            Self::Thrown(t) => t.message.clone(),
        }
    }

    /// Whether language-level handlers may catch this error.
    ///
    /// Heap exhaustion and internal invariant failures unwind the whole
    /// run; everything else is a first-class value to `try`/`catch`.
    pub fn is_catchable(&self) -> bool {
        !matches!(self, Self::OutOfMemory(_) | Self::Internal(_))
    }
}

/// Result type for VM operations
pub type VmResult<T> = std::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names() {
        assert_eq!(VmError::type_error("x").kind_name(), "TypeError");
        assert_eq!(VmError::StackOverflow.kind_name(), "RangeError");
        assert_eq!(VmError::reference_error("y").kind_name(), "ReferenceError");
    }

    #[test]
    fn oom_is_not_catchable() {
        let oom = VmError::OutOfMemory(stoat_gc::OomError {
            requested_bytes: 64,
            heap_used: 0,
            max_heap_bytes: 0,
            major_collections: 0,
        });
        assert!(!oom.is_catchable());
        assert!(VmError::type_error("x").is_catchable());
        assert!(VmError::StackOverflow.is_catchable());
    }

    #[test]
    fn display_includes_kind() {
        let err = VmError::range_error("Invalid array length");
        assert_eq!(err.to_string(), "RangeError: Invalid array length");
    }
}
