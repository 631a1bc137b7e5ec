//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, stock decisions). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated (e.g. illegal status transition).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// The item exists but is no longer on sale.
    #[error("item withdrawn: {0}")]
    Withdrawn(String),

    /// Not enough stock to satisfy the requested quantity.
    #[error("out of stock: {0}")]
    OutOfStock(String),

    /// A conflict occurred (e.g. order already paid).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller does not own the resource it is acting on.
    #[error("forbidden")]
    Forbidden,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn withdrawn(msg: impl Into<String>) -> Self {
        Self::Withdrawn(msg.into())
    }

    pub fn out_of_stock(msg: impl Into<String>) -> Self {
        Self::OutOfStock(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}

/// Startup configuration failure. The process must not start when one of these occurs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The id-generator epoch is not a `YYYY-MM-DD` date, or lies in the future.
    #[error("invalid snowflake epoch '{value}': {reason}")]
    InvalidEpoch { value: String, reason: String },

    /// The id-generator node discriminator is outside `0..=max`.
    #[error("snowflake node {node} out of range 0..={max}")]
    NodeOutOfRange { node: i64, max: i64 },

    /// A required setting is absent.
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// A setting is present but cannot be used.
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}
