//! Error types for the ledger.
//!
//! Only storage, contention, configuration and I/O failures become `Err`.
//! Validation problems (bad hash, non-positive grant, self-referral, duplicate
//! invitee) are reported as `false` / `None` by the operation itself.

use thiserror::Error;

/// Errors surfaced by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The database rejected or failed a statement (connection loss, busy
    /// timeout, constraint violation, closed pool).
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A compare-and-swap update kept losing to concurrent writers.
    #[error("contention: {0}")]
    Contention(String),

    /// The configuration file or a configuration value is unusable.
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// Whether the caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Contention(_) => true,
            LedgerError::Storage(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Database(_)
            ),
            LedgerError::Config(_) | LedgerError::Io(_) => false,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LedgerError>;
