//! Cryptography for the lumen consensus driver.
//!
//! The driver only needs three things from cryptography: a node identity
//! ([`SecretKey`] / [`PublicKey`]), Stellar's StrKey text form for those keys,
//! and signing/verification of consensus statements bound to a network id
//! ([`sign_statement`] / [`verify_envelope`]).
//!
//! ```
//! use lumen_crypto::SecretKey;
//!
//! let secret = SecretKey::generate();
//! let public = secret.public_key();
//! let signature = secret.sign(b"hello");
//! assert!(public.verify(b"hello", &signature).is_ok());
//! ```

mod envelope;
mod error;
mod keys;
mod strkey;

pub use envelope::{sign_statement, statement_signing_payload, verify_envelope, ENVELOPE_TYPE_SCP};
pub use error::CryptoError;
pub use keys::{PublicKey, SecretKey, Signature};
pub use strkey::{decode_account_id, decode_secret_seed, encode_account_id, encode_secret_seed};

/// Result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
