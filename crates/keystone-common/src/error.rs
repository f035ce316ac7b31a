//! Common error types for Keystone components.

use thiserror::Error;

/// Result alias used throughout the coordination library
pub type Result<T> = std::result::Result<T, KeystoneError>;

/// Errors surfaced by the coordination library.
///
/// Losing a lock or lease race is not an error; those outcomes are
/// reported through dedicated result enums.
#[derive(Debug, Error)]
pub enum KeystoneError {
    /// Template string could not be compiled
    #[error("Invalid template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    /// A placeholder had no value while formatting a path
    #[error("Missing field '{0}'")]
    MissingField(String),

    /// A field value cannot be embedded in a path segment
    #[error("Invalid value for field '{field}': {reason}")]
    InvalidFieldValue { field: String, reason: String },

    /// Schema rejected the input
    #[error("Validation error on '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// A subscription for this path is already open
    #[error("Already watching {0}")]
    AlreadyWatching(String),

    /// Unwatch of a path with no subscription
    #[error("No such watcher {0}")]
    NoSuchWatcher(String),

    /// Write referenced a lease the store no longer knows
    #[error("Lease {0} not found")]
    LeaseNotFound(i64),

    /// Store connection/operation error
    #[error("Store error: {0}")]
    Store(String),

    /// Value (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl KeystoneError {
    /// Shorthand for a schema failure on `field`
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Timeout(_))
    }

    /// Returns true for caller mistakes that fail before touching the store
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTemplate { .. }
                | Self::MissingField(_)
                | Self::InvalidFieldValue { .. }
                | Self::Validation { .. }
                | Self::AlreadyWatching(_)
                | Self::NoSuchWatcher(_)
        )
    }
}

impl From<serde_json::Error> for KeystoneError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
