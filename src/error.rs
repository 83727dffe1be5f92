//! Error taxonomy for the monitoring and recovery engine.
//!
//! Adapter failures are split into transient/permanent the way `spec.md` §7
//! requires, so callers can decide whether a retry is worth attempting.
//! Everything else funnels into [`CoreError`].

use thiserror::Error;

/// An error returned by a [`crate::tmux::TmuxAdapter`] operation.
#[derive(Debug, Error, Clone)]
pub enum AdapterError {
    /// Worth retrying: a timeout, a retryable exit code, an empty capture.
    #[error("transient tmux adapter error: {0}")]
    Transient(String),
    /// Not worth retrying: the target is gone, or tmux itself is unreachable.
    #[error("permanent tmux adapter error: {0}")]
    Permanent(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, AdapterError::Permanent(_))
    }
}

/// Errors surfaced by the engine above the adapter layer.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("connection pool exhausted after waiting {0:?}")]
    PoolExhausted(std::time::Duration),

    #[error("target {0} did not parse as session:window")]
    InvalidTarget(String),

    #[error("classifier signature failed to compile: {0}")]
    ClassifierMisconfig(String),

    #[error("failed to persist tracker state: {0}")]
    PersistenceFailure(String),

    #[error("recovery exhausted for session {session} after {attempts} attempts")]
    RecoveryExhausted { session: String, attempts: u8 },

    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
