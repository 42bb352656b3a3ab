//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, missing references). Storage concerns belong to the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input, insufficient stock).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A ledger invariant was violated (e.g. reason without its back-reference).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A well-formed reference did not match a live record.
    #[error("not found: {0}")]
    NotFound(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// The message without the variant prefix, suitable for API clients.
    pub fn message(&self) -> &str {
        match self {
            DomainError::Validation(msg)
            | DomainError::InvariantViolation(msg)
            | DomainError::NotFound(msg) => msg,
        }
    }
}
