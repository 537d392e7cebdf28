//! Error types for herder operations.
//!
//! Protocol-invalid input (bad envelopes, rejected transactions, invalid
//! values) is not an error here: it is reported through status values and
//! metrics. [`HerderError`] covers setup and plumbing failures.

use thiserror::Error;

/// Errors that can occur while configuring or talking to the herder.
#[derive(Debug, Error)]
pub enum HerderError {
    /// The node configuration cannot be turned into a herder configuration.
    #[error("invalid herder configuration: {0}")]
    Config(String),

    /// A consensus value could not be encoded or decoded.
    #[error("malformed consensus value: {0}")]
    MalformedValue(String),

    /// A transaction envelope is structurally unusable.
    #[error("malformed transaction: {0}")]
    MalformedTransaction(String),

    /// The herder task is gone.
    #[error("herder event loop has shut down")]
    ChannelClosed,

    #[error("SCP error: {0}")]
    Scp(#[from] lumen_scp::ScpError),

    #[error("crypto error: {0}")]
    Crypto(#[from] lumen_crypto::CryptoError),

    #[error(transparent)]
    Common(#[from] lumen_common::Error),

    #[error("XDR error: {0}")]
    Xdr(#[from] stellar_xdr::curr::Error),
}
