//! Error types for netvirt state operations.
//!
//! Every failure is surfaced to the caller unchanged. Nothing here is
//! process-fatal and no operation retries on its own; callers decide whether
//! to re-enumerate, back off, or abandon.

use thiserror::Error;

/// Result type alias for state operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors raised by the directory, topology, cache and NAT layers.
#[derive(Debug, Error)]
pub enum StateError {
    /// Path or entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Path or name index entry already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Node cannot be removed while it still has children.
    #[error("Node has children: {0}")]
    NotEmpty(String),

    /// A read that preceded the write is stale (version mismatch, or a
    /// child appeared/disappeared between enumeration and commit).
    #[error("Version conflict on {path}: {reason}")]
    VersionConflict { path: String, reason: String },

    /// Backing coordination or cache service unreachable or timed out.
    #[error("State access error during {operation}: {message}")]
    StateAccess { operation: String, message: String },

    /// No free (address, port) slot left in the translation pool.
    #[error("NAT pool exhausted: {0}")]
    PoolExhausted(String),

    /// Binding could not be established for a reason other than exhaustion.
    #[error("NAT allocation failed: {0}")]
    AllocationFailure(String),

    /// Stored value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig { field: String, message: String },

    #[error("Parse error: {0}")]
    Parse(#[from] netvirt_types::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StateError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    pub fn version_conflict(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::VersionConflict {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn state_access(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StateAccess {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns true if re-issuing the operation (after re-reading state
    /// where relevant) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StateError::VersionConflict { .. }
                | StateError::StateAccess { .. }
                | StateError::AllocationFailure(_)
        )
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StateError {
    fn from(e: redis::RedisError) -> Self {
        let operation = if e.is_timeout() {
            "redis timeout"
        } else if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
            "redis connection"
        } else {
            "redis command"
        };
        StateError::state_access(operation, e.to_string())
    }
}
