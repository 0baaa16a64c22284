//! The closed error taxonomy shared by every subsystem in this crate.
//!
//! Each variant corresponds to one of the error *kinds* named in the
//! design: validation, state, transient-resource, internal, and protocol
//! errors are never mixed into a single catch-all string.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced while decoding, encoding, or setting an attribute value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttrError {
    #[error("bad attribute value for {attr}: {reason}")]
    BadAttrValue { attr: String, reason: String },
    #[error("value out of range for {attr}: {reason}")]
    BadRange { attr: String, reason: String },
    #[error("unknown resource {resource} on {attr}")]
    UnknownResource { attr: String, resource: String },
    #[error("permission denied writing {attr}")]
    Permission { attr: String },
    #[error("operator {op:?} is not valid on a non-additive attribute {attr}")]
    NotAdditive { attr: String, op: String },
    #[error("indirect resource hop rejected: {reason}")]
    IndirectHop { reason: String },
}

/// Top level error type returned by `pbs-core` operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(#[from] AttrError),

    #[error("bad state: {reason}")]
    BadState { reason: String },

    #[error("transient resource error: {reason}")]
    Transient { reason: String },

    #[error("internal invariant violation: {reason}")]
    Internal { reason: String },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("not found: {what}")]
    NotFound { what: String },
}

impl CoreError {
    pub fn bad_state(reason: impl Into<String>) -> Self {
        CoreError::BadState {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        CoreError::Internal {
            reason: reason.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        CoreError::Transient {
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        CoreError::Protocol {
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound { what: what.into() }
    }

    /// True for errors that an internal retry loop may legitimately retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient { .. })
    }
}
