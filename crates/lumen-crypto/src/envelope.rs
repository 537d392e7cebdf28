//! Signing and verification of consensus statements.
//!
//! A statement signature covers
//! `network_id || ENVELOPE_TYPE_SCP (i32, big endian) || XDR(statement)`,
//! which binds it to one network and to the SCP envelope type.

use lumen_common::NetworkId;
use stellar_xdr::curr::{Limits, ScpEnvelope, ScpStatement, WriteXdr};

use crate::error::CryptoError;
use crate::keys::{PublicKey, SecretKey, Signature};

/// XDR `EnvelopeType::Scp` discriminant.
pub const ENVELOPE_TYPE_SCP: i32 = 1;

/// Bytes a statement signature is computed over.
pub fn statement_signing_payload(
    network_id: &NetworkId,
    statement: &ScpStatement,
) -> Result<Vec<u8>, CryptoError> {
    let statement_bytes = statement.to_xdr(Limits::none())?;
    let mut data = Vec::with_capacity(32 + 4 + statement_bytes.len());
    data.extend_from_slice(network_id.as_bytes());
    data.extend_from_slice(&ENVELOPE_TYPE_SCP.to_be_bytes());
    data.extend_from_slice(&statement_bytes);
    Ok(data)
}

/// Sign `statement` for `network_id`, returning the XDR signature.
pub fn sign_statement(
    secret: &SecretKey,
    network_id: &NetworkId,
    statement: &ScpStatement,
) -> Result<stellar_xdr::curr::Signature, CryptoError> {
    let payload = statement_signing_payload(network_id, statement)?;
    secret.sign(&payload).try_into()
}

/// Check that `envelope` is signed by the node its statement names.
pub fn verify_envelope(network_id: &NetworkId, envelope: &ScpEnvelope) -> Result<(), CryptoError> {
    let public_key = PublicKey::try_from(&envelope.statement.node_id)?;
    let signature = Signature::try_from(&envelope.signature)?;
    let payload = statement_signing_payload(network_id, &envelope.statement)?;
    public_key.verify(&payload, &signature)
}
