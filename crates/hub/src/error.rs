//! Error taxonomy for the hub. Callers match on the variant; the web layer
//! maps each one to a status code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    /// Input the caller can fix: non-finite numbers, unknown kinds,
    /// out-of-range knobs.
    #[error("{0}")]
    Validation(String),

    #[error("{what} '{id}' not found")]
    NotFound { what: &'static str, id: String },

    /// An irrigation event may be confirmed exactly once.
    #[error("irrigation event {0} is already confirmed")]
    AlreadyConfirmed(i64),

    /// Push-path failure. Never fatal to the operation that produced the
    /// notification.
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HubError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
