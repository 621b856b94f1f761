//! Error types for the swap settlement core.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the settlement core.
///
/// Variants are grouped the way §7 of the spec categorizes failures, so
/// call sites can match on category rather than sniffing message text.
#[derive(Error, Debug)]
pub enum Error {
    /// Envelope schema invalid, binding check failed, or a numeric ceiling
    /// was exceeded. Never published; surfaced to the publishing caller.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Bus/LN/chain RPC timed out, reset, or returned a transient failure
    /// such as `no_route` or `insufficient_funds`. Safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A counterparty published `cancel`, or terms were inconsistent with
    /// the referenced quote/rfq. The trade is dead; do not retry.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Durable receipts store failure. Treated as process-fatal by callers
    /// that require durability (see spec §7).
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Hex/base58 decode or wrong-length field.
    #[error("parse error: {0}")]
    Parse(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Generic error with context, for paths with no more specific variant.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(format!("{err:#}"))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Other(format!("blocking store task panicked: {err}"))
    }
}
