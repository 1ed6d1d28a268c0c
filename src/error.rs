/// Routing errors surfaced at the API boundary
///
/// Per-backend health failures and redirect failures are not errors here;
/// they are absorbed into backend status and the per-connection state
/// machine.
use thiserror::Error;

/// Errors a selection attempt can return
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// No eligible backend for this attempt; callers typically retry or fail
    /// the client connection.
    #[error("no available backend")]
    NoBackend,

    /// The observer reported a global failure; selection fails fast until a
    /// clean snapshot arrives.
    #[error("backend observation unavailable: {0}")]
    Observe(String),
}

/// Result type alias for routing operations
pub type RouterResult<T> = Result<T, RouterError>;
