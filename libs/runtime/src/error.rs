//! Runtime Error Types
//!
//! Error taxonomy shared by the in-process runtime and the distributed
//! gateway/worker tier. Correlation mismatches and per-recipient broadcast
//! failures are log-only conditions and deliberately have no variant here.

use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Main runtime error type
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Malformed address strings, or a send to a type with no factory/placement
    #[error("Addressing error: {message}")]
    Addressing { message: String },

    /// Re-registering an agent factory or subscription id
    #[error("Duplicate registration: {message}")]
    DuplicateRegistration { message: String },

    /// Removing an absent subscription, or reading state for an unknown agent
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// A unicast handler faulted; surfaced to the caller, never swallowed
    #[error("Delivery to {recipient} failed: {message}")]
    Delivery { recipient: String, message: String },

    /// A pending RPC exceeded its fixed timeout
    #[error("Timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Connection fault; the worker reconnects transparently on next use
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Caller-supplied cancellation fired while awaiting a result
    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    /// Payload or envelope (de)serialization failures
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors from tokio operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Create an addressing error
    pub fn addressing(message: impl Into<String>) -> Self {
        Self::Addressing {
            message: message.into(),
        }
    }

    /// Create a duplicate-registration error
    pub fn duplicate_registration(message: impl Into<String>) -> Self {
        Self::DuplicateRegistration {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a delivery error for a specific recipient
    pub fn delivery(recipient: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Delivery {
            recipient: recipient.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Error category for structured logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Addressing { .. } => "addressing",
            Self::DuplicateRegistration { .. } => "duplicate_registration",
            Self::NotFound { .. } => "not_found",
            Self::Delivery { .. } => "delivery",
            Self::Timeout { .. } => "timeout",
            Self::Transport { .. } => "transport",
            Self::Cancelled { .. } => "cancelled",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }

    /// True for timeout errors (distinct from handler-reported faults)
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::addressing("agent not found: echo/default");
        assert_eq!(
            err.to_string(),
            "Addressing error: agent not found: echo/default"
        );
        assert_eq!(err.category(), "addressing");
    }

    #[test]
    fn test_timeout_classification() {
        let err = RuntimeError::timeout("rpc", 30_000);
        assert!(err.is_timeout());
        assert!(!RuntimeError::transport("gone").is_timeout());
    }

    #[test]
    fn test_transport_with_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = RuntimeError::transport_with_source("write failed", io);
        assert_eq!(err.category(), "transport");
        assert!(err.to_string().contains("write failed"));
    }
}
