//! Error types for futures, contexts and shared sessions.
//!
//! Every terminal failure observed through a [`Future`](crate::Future) is a
//! [`FutureError`]. The type is cheap to clone so that all observers of the
//! same future see an identical error.

use std::sync::Arc;
use thiserror::Error;

/// The result carried by a terminal future.
pub type FutureResult<T> = Result<T, FutureError>;

/// The error taxonomy of the execution core.
#[derive(Debug, Clone, Error)]
pub enum FutureError {
    /// The future was cancelled before it produced a value.
    #[error("Future was cancelled")]
    Cancelled,

    /// The future did not resolve within its deadline.
    #[error("Timed out waiting for {what}")]
    TimedOut {
        /// Description of what was being waited for.
        what: String,
    },

    /// A failure raised by the underlying unit of work.
    #[error("{0:#}")]
    Underlying(Arc<anyhow::Error>),

    /// No session is active for the given key.
    #[error("No active session for key '{key}'")]
    SessionNotFound {
        /// The session key, rendered for display.
        key: String,
    },

    /// The session has already been stopped.
    #[error("Session '{key}' is already stopped")]
    AlreadyStopped {
        /// The session key, rendered for display.
        key: String,
    },

    /// The manager already holds its maximum number of sessions.
    #[error("Manager '{name}' is at capacity ({capacity} sessions)")]
    CapacityExceeded {
        /// The manager name.
        name: String,
        /// The configured capacity.
        capacity: usize,
    },

    /// A pooled context cannot be handed out or returned synchronously.
    #[error("Context '{name}' is unavailable: {reason}")]
    ContextUnavailable {
        /// The context name.
        name: String,
        /// Why the request was refused.
        reason: String,
    },

    /// A timer or async body was scheduled without a tokio runtime.
    #[error("No tokio runtime available to schedule work")]
    NoRuntime,
}

impl FutureError {
    /// Wraps an arbitrary error as an underlying failure.
    pub fn underlying(error: impl Into<anyhow::Error>) -> Self {
        Self::Underlying(Arc::new(error.into()))
    }

    /// Creates an underlying failure from a message.
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Underlying(Arc::new(anyhow::Error::msg(message)))
    }

    /// Creates a timeout error.
    pub fn timed_out(what: impl Into<String>) -> Self {
        Self::TimedOut { what: what.into() }
    }

    /// Returns true for [`FutureError::Cancelled`].
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true for [`FutureError::TimedOut`].
    #[must_use]
    pub const fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Adds context to an underlying failure.
    ///
    /// Cancellation and the structured kinds are returned unchanged.
    #[must_use]
    pub fn rephrase(self, context: impl std::fmt::Display + Send + Sync + 'static) -> Self {
        match self {
            Self::Underlying(inner) => {
                let inner = Arc::try_unwrap(inner)
                    .unwrap_or_else(|shared| anyhow::Error::msg(format!("{shared:#}")));
                Self::Underlying(Arc::new(inner.context(context)))
            }
            other => other,
        }
    }

    /// Returns the wrapped error for underlying failures.
    #[must_use]
    pub fn as_underlying(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Underlying(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for FutureError {
    fn from(error: anyhow::Error) -> Self {
        Self::Underlying(Arc::new(error))
    }
}

impl From<std::io::Error> for FutureError {
    fn from(error: std::io::Error) -> Self {
        Self::underlying(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(FutureError::Cancelled.to_string(), "Future was cancelled");
        assert_eq!(
            FutureError::timed_out("video encoder").to_string(),
            "Timed out waiting for video encoder"
        );
        assert_eq!(
            FutureError::SessionNotFound { key: "logs".into() }.to_string(),
            "No active session for key 'logs'"
        );
        assert_eq!(
            FutureError::ContextUnavailable {
                name: "simulator".into(),
                reason: "it has not been prepared".into(),
            }
            .to_string(),
            "Context 'simulator' is unavailable: it has not been prepared"
        );
    }

    #[test]
    fn test_rephrase_underlying() {
        let err = FutureError::msg("socket closed").rephrase("Failed to tail log");
        let rendered = err.to_string();
        assert!(rendered.starts_with("Failed to tail log"));
        assert!(rendered.contains("socket closed"));
    }

    #[test]
    fn test_rephrase_leaves_cancellation() {
        let err = FutureError::Cancelled.rephrase("ignored");
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_clone_shares_underlying() {
        let err = FutureError::msg("boom");
        let cloned = err.clone();
        match (&err, &cloned) {
            (FutureError::Underlying(a), FutureError::Underlying(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected underlying errors"),
        }
    }

    #[test]
    fn test_io_conversion() {
        let err: FutureError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(err.as_underlying().is_some());
    }
}
