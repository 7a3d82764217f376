//! Error types for castle
//!
//! Every orchestration failure is classified into one of a small set of
//! kinds. Reconcile loops use the kind to decide whether to continue,
//! retry after backoff, or surface the failure.

use thiserror::Error;

/// Common result type for castle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for castle
#[derive(Debug, Error)]
pub enum Error {
    /// A key, daemon or cluster entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A compare-and-swap or create-only write lost a race, or an entity
    /// already exists in an incompatible shape
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient failure of the coordination store or cluster; retry
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Malformed input: CRUSH location, store config, missing required field
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation would destroy data that does not belong to us
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A deadline expired (quorum wait, agent notification)
    #[error("timed out: {0}")]
    Timeout(String),

    /// A subprocess or external system failed
    #[error("external failure: {message}")]
    External {
        message: String,
        /// Exit code of the failed helper, when there is one
        exit_code: Option<i32>,
        /// Captured stderr of the failed helper
        stderr: Option<String>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an external error without process details
    pub fn external(msg: impl Into<String>) -> Self {
        Self::External {
            message: msg.into(),
            exit_code: None,
            stderr: None,
        }
    }

    /// Create an external error carrying a helper's exit code and stderr
    pub fn process_failed(msg: impl Into<String>, exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::External {
            message: msg.into(),
            exit_code,
            stderr: Some(stderr.into()),
        }
    }

    /// Wrap this error with extra context, keeping its kind
    #[must_use]
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            Self::NotFound(m) => Self::NotFound(format!("{ctx}: {m}")),
            Self::Conflict(m) => Self::Conflict(format!("{ctx}: {m}")),
            Self::Unavailable(m) => Self::Unavailable(format!("{ctx}: {m}")),
            Self::InvalidInput(m) => Self::InvalidInput(format!("{ctx}: {m}")),
            Self::Precondition(m) => Self::Precondition(format!("{ctx}: {m}")),
            Self::Timeout(m) => Self::Timeout(format!("{ctx}: {m}")),
            Self::External {
                message,
                exit_code,
                stderr,
            } => Self::External {
                message: format!("{ctx}: {message}"),
                exit_code,
                stderr,
            },
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), format!("{ctx}: {e}"))),
            other @ Self::Serialization(_) => Self::external(format!("{ctx}: {other}")),
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if the coordination store (or cluster) is unreachable
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Check if this is a conflict error
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Exit code of the failed helper, if this error came from one
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::External { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

/// Extension for treating `NotFound` as an absent value
pub trait OptionalExt<T> {
    /// Map `Err(NotFound)` to `Ok(None)`
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for Result<T> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
