//! StrKey encoding for node keys.
//!
//! StrKey is base32 (RFC 4648, no padding) over
//! `version byte || 32-byte payload || crc16-xmodem (little endian)`.
//! The version byte fixes the first character: `G` for public keys, `S` for
//! secret seeds.

use crate::error::CryptoError;

const VERSION_ACCOUNT_ID: u8 = 6 << 3;
const VERSION_SEED: u8 = 18 << 3;

const PAYLOAD_LEN: usize = 32;

/// Encode a public key as `G...`.
pub fn encode_account_id(key: &[u8; 32]) -> String {
    encode_check(VERSION_ACCOUNT_ID, key)
}

/// Decode a `G...` string to raw key bytes.
pub fn decode_account_id(s: &str) -> Result<[u8; 32], CryptoError> {
    decode_check(VERSION_ACCOUNT_ID, s)
}

/// Encode a secret seed as `S...`.
pub fn encode_secret_seed(seed: &[u8; 32]) -> String {
    encode_check(VERSION_SEED, seed)
}

/// Decode an `S...` string to raw seed bytes.
pub fn decode_secret_seed(s: &str) -> Result<[u8; 32], CryptoError> {
    decode_check(VERSION_SEED, s)
}

fn encode_check(version: u8, data: &[u8; PAYLOAD_LEN]) -> String {
    let mut payload = Vec::with_capacity(1 + PAYLOAD_LEN + 2);
    payload.push(version);
    payload.extend_from_slice(data);
    let checksum = crc16_xmodem(&payload);
    payload.extend_from_slice(&checksum.to_le_bytes());
    base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &payload)
}

fn decode_check(expected_version: u8, s: &str) -> Result<[u8; PAYLOAD_LEN], CryptoError> {
    let decoded = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, s)
        .ok_or_else(|| CryptoError::InvalidStrKey("invalid base32".to_string()))?;

    if decoded.len() != 1 + PAYLOAD_LEN + 2 {
        return Err(CryptoError::InvalidLength {
            expected: 1 + PAYLOAD_LEN + 2,
            got: decoded.len(),
        });
    }
    if decoded[0] != expected_version {
        return Err(CryptoError::InvalidStrKey(format!(
            "version byte {:02x} != {:02x}",
            decoded[0], expected_version
        )));
    }

    let body_len = decoded.len() - 2;
    let checksum = u16::from_le_bytes([decoded[body_len], decoded[body_len + 1]]);
    if checksum != crc16_xmodem(&decoded[..body_len]) {
        return Err(CryptoError::InvalidStrKey("checksum mismatch".to_string()));
    }

    let mut key = [0u8; PAYLOAD_LEN];
    key.copy_from_slice(&decoded[1..body_len]);
    Ok(key)
}

/// CRC16-XModem: polynomial 0x1021, initial value 0.
fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
