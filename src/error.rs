use std::time::Duration;
use thiserror::Error;

/// Failure of a single provider call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("rate limited by provider (HTTP 429)")]
    RateLimited,

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("terminal rpc error: {0}")]
    Terminal(String),
}

/// Failure of a call submitted through the rate limiter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    /// Breaker is open; nothing was dispatched
    #[error("rate limiter cooling down for another {remaining:?}")]
    Cooldown { remaining: Duration },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl LimiterError {
    /// Errors that must abort the run with a cooldown result
    pub fn is_cooldown_signal(&self) -> bool {
        matches!(
            self,
            LimiterError::Cooldown { .. } | LimiterError::Rpc(RpcError::RateLimited)
        )
    }
}

/// Failure of the persistence collaborator
#[derive(Debug, Error)]
pub enum StoreError {
    /// Stored state could not be parsed back into a ledger
    #[error("corrupt ledger state: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("storage task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, StoreError::Corrupt(_))
    }
}
