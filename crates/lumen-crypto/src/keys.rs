//! Ed25519 node keys.
//!
//! A node is identified on the network by its [`PublicKey`], which doubles as
//! the XDR `NodeId`. The matching [`SecretKey`] signs every statement the node
//! emits.

use crate::error::CryptoError;
use crate::strkey;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;
use stellar_xdr::curr::{NodeId, PublicKey as XdrPublicKey, Uint256};

/// An Ed25519 public key, displayed as a `G...` StrKey.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Create from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a curve point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let key = VerifyingKey::from_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Verify `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        use ed25519_dalek::Verifier;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.0
            .verify(message, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    pub fn to_strkey(&self) -> String {
        strkey::encode_account_id(self.as_bytes())
    }

    /// Parse a `G...` StrKey.
    pub fn from_strkey(s: &str) -> Result<Self, CryptoError> {
        let bytes = strkey::decode_account_id(s)?;
        Self::from_bytes(&bytes)
    }

    /// This key as an XDR node id.
    pub fn to_node_id(&self) -> NodeId {
        NodeId(XdrPublicKey::PublicKeyTypeEd25519(Uint256(*self.as_bytes())))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_strkey())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_strkey())
    }
}

impl TryFrom<&XdrPublicKey> for PublicKey {
    type Error = CryptoError;

    fn try_from(xdr: &XdrPublicKey) -> Result<Self, Self::Error> {
        match xdr {
            XdrPublicKey::PublicKeyTypeEd25519(Uint256(bytes)) => Self::from_bytes(bytes),
        }
    }
}

impl TryFrom<&NodeId> for PublicKey {
    type Error = CryptoError;

    fn try_from(node_id: &NodeId) -> Result<Self, Self::Error> {
        Self::try_from(&node_id.0)
    }
}

/// An Ed25519 secret key.
///
/// `Debug` never prints key material.
pub struct SecretKey {
    inner: SigningKey,
}

impl SecretKey {
    /// Generate a fresh key from the OS random source.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            inner: SigningKey::generate(&mut csprng),
        }
    }

    /// Deterministic key from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            inner: SigningKey::from_bytes(seed),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer;
        Signature(self.inner.sign(message).to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.inner.verifying_key())
    }

    /// Parse an `S...` seed.
    pub fn from_strkey(s: &str) -> Result<Self, CryptoError> {
        let bytes = strkey::decode_secret_seed(s)?;
        Ok(Self::from_seed(&bytes))
    }

    /// Encode as an `S...` seed. Treat the result as secret.
    pub fn to_strkey(&self) -> String {
        strkey::encode_secret_seed(self.inner.as_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({})", self.public_key().to_strkey())
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> Self {
        Self::from_seed(self.inner.as_bytes())
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

impl TryFrom<Signature> for stellar_xdr::curr::Signature {
    type Error = CryptoError;

    fn try_from(sig: Signature) -> Result<Self, Self::Error> {
        let bytes = sig.0.to_vec().try_into()?;
        Ok(stellar_xdr::curr::Signature(bytes))
    }
}

impl TryFrom<&stellar_xdr::curr::Signature> for Signature {
    type Error = CryptoError;

    fn try_from(xdr: &stellar_xdr::curr::Signature) -> Result<Self, Self::Error> {
        let bytes: [u8; 64] =
            xdr.0
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    expected: 64,
                    got: xdr.0.len(),
                })?;
        Ok(Self(bytes))
    }
}
