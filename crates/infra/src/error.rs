//! Error taxonomy seen by callers of the inventory services.
//!
//! - [`InventoryError::Validation`] / [`InventoryError::NotFound`]: client
//!   caused, message safe to return verbatim.
//! - [`InventoryError::Infrastructure`]: storage failure, logged with
//!   context and surfaced to clients only as an opaque message.

use std::time::Duration;

use thiserror::Error;

use brewstock_core::DomainError;

/// Storage operation error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    /// Unique-constraint or serialization conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("connection pool closed")]
    PoolClosed,

    #[error("operation exceeded its {0:?} deadline")]
    Timeout(Duration),

    /// A stored row violates a ledger invariant and cannot be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("infrastructure failure: {0}")]
    Infrastructure(#[from] StoreError),
}

impl InventoryError {
    pub const OPAQUE_MESSAGE: &'static str = "internal error";

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn is_client_error(&self) -> bool {
        !matches!(self, InventoryError::Infrastructure(_))
    }

    /// Message to hand to API clients. Never carries storage internals.
    pub fn client_message(&self) -> String {
        match self {
            InventoryError::Validation(msg) | InventoryError::NotFound(msg) => msg.clone(),
            InventoryError::Infrastructure(_) => Self::OPAQUE_MESSAGE.to_string(),
        }
    }
}

impl From<DomainError> for InventoryError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvariantViolation(msg) => {
                InventoryError::Validation(msg)
            }
            DomainError::NotFound(msg) => InventoryError::NotFound(msg),
        }
    }
}
