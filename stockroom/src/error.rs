//! Errors shared by the pool and the backing-store contract.

use std::time::Duration;

use crate::pool::HandleId;

/// Failure reported by a backing-store connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Connection to backing store lost")]
    ConnectionLost,
    #[error("Backing store unavailable: {0}")]
    Unavailable(String),
    #[error("Credentials rejected by {0}")]
    InvalidCredentials(String),
    #[error("Write conflict: {0}")]
    Conflict(String),
    #[error("No atomic unit in progress")]
    NoUnit,
    #[error("An atomic unit is already in progress")]
    UnitInProgress,
}

impl StoreError {
    /// Whether the connection that produced this error should be considered dead.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, StoreError::ConnectionLost | StoreError::Unavailable(_))
    }
}

/// Failure reported by [`ConnectionPool`](crate::pool::ConnectionPool).
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    /// Acquire attempted after or during shutdown. Not retryable.
    #[error("Pool is closed")]
    Closed,
    /// No handle became free before the acquire timeout elapsed.
    #[error("No handle became free within {waited:?}")]
    Exhausted { waited: Duration },
    /// The lease's connection failed earlier and can no longer be used.
    #[error("Handle {0} is broken")]
    HandleBroken(HandleId),
    /// A handle was released to a pool that did not lease it.
    #[error("Bug: handle {0} is not leased from this pool")]
    NotLeased(HandleId),
    #[error("Failed to open connection: {0}")]
    Connect(#[source] StoreError),
}

impl PoolError {
    /// Transient conditions a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::Exhausted { .. } => true,
            PoolError::Connect(e) => e.is_connection_failure(),
            PoolError::Closed | PoolError::HandleBroken(_) | PoolError::NotLeased(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_classified() {
        assert!(StoreError::ConnectionLost.is_connection_failure());
        assert!(StoreError::Unavailable("down".to_string()).is_connection_failure());
        assert!(!StoreError::Conflict("dup".to_string()).is_connection_failure());
        assert!(!StoreError::NoUnit.is_connection_failure());
    }

    #[test]
    fn only_transient_pool_errors_are_retryable() {
        assert!(
            PoolError::Exhausted {
                waited: Duration::from_millis(5)
            }
            .is_retryable()
        );
        assert!(PoolError::Connect(StoreError::ConnectionLost).is_retryable());
        assert!(
            !PoolError::Connect(StoreError::InvalidCredentials("db".to_string())).is_retryable()
        );
        assert!(!PoolError::Closed.is_retryable());
        assert!(!PoolError::NotLeased(HandleId::new()).is_retryable());
    }
}
