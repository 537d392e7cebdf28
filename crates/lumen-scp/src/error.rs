//! Error types for the agreement-engine contract.

use thiserror::Error;

/// Errors raised at the engine boundary.
#[derive(Debug, Error)]
pub enum ScpError {
    /// Invalid quorum set.
    #[error("invalid quorum set: {0}")]
    InvalidQuorumSet(String),

    /// A value could not be decoded.
    #[error("malformed value: {0}")]
    MalformedValue(String),

    /// XDR encoding error.
    #[error("XDR error: {0}")]
    Xdr(#[from] stellar_xdr::curr::Error),
}
