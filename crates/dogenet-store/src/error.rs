//! Error taxonomy for the store layer.
//!
//! Callers match on the kind, not the message: `NotFound` is a normal
//! outcome, `AlreadyExists` invites an update, `Conflict` is retried
//! inside the store itself, and `Problem` is logged and survived.

use thiserror::Error;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,

    /// A unique-key constraint rejected an insert.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Transient busy/locked condition; retried automatically.
    #[error("database conflict: {0}")]
    Conflict(String),

    /// Any other storage failure.
    #[error("database problem: {0}")]
    Problem(String),
}

impl StoreError {
    /// True for the transient kind the transaction wrapper retries.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
