//! Sealed-blob format for license material, at rest and on the wire.
//!
//! A blob is a JSON object of Base64 fields: a 32-byte scrypt salt, a
//! 12-byte AES-GCM nonce, the ciphertext, the detached 16-byte
//! authentication tag, and a SHA-256 integrity hash over the raw bytes of
//! `version || salt || nonce || ciphertext || auth_tag`. The key is
//! derived with scrypt (N=32768, r=8, p=1) from the shared secret and the
//! per-blob salt. Network payloads bind the request id as associated
//! data; the at-rest blob uses empty associated data.

use crate::errors::LicenseError;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const BLOB_VERSION: u8 = 1;
pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const SCRYPT_LOG_N: u8 = 15; // N = 32768
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const KEY_LEN: usize = 32;

/// The serialized sealed blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub version: u8,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
    pub auth_tag: String,
    pub integrity: String,
}

fn derive_key(secret: &[u8], salt: &[u8]) -> Result<[u8; KEY_LEN], LicenseError> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
        .map_err(|e| anyhow::anyhow!("invalid scrypt parameters: {e}"))?;
    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(secret, salt, &params, &mut key)
        .map_err(|e| anyhow::anyhow!("scrypt derivation failed: {e}"))?;
    Ok(key)
}

fn integrity_hash(version: u8, salt: &[u8], nonce: &[u8], ciphertext: &[u8], tag: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update([version]);
    hasher.update(salt);
    hasher.update(nonce);
    hasher.update(ciphertext);
    hasher.update(tag);
    hasher.finalize().to_vec()
}

/// Seal a plaintext under the shared secret. `aad` is the request id for
/// network payloads, empty for the at-rest blob.
pub fn seal(plaintext: &[u8], secret: &[u8], aad: &[u8]) -> Result<EncryptedBlob, LicenseError> {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);

    let key = derive_key(secret, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| anyhow::anyhow!("cipher init failed: {e}"))?;

    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| LicenseError::IntegrityFailure)?;
    // AES-GCM appends the tag; the wire format carries it detached.
    let tag = sealed.split_off(sealed.len() - TAG_LEN);
    let ciphertext = sealed;

    let integrity = integrity_hash(BLOB_VERSION, &salt, &nonce, &ciphertext, &tag);

    Ok(EncryptedBlob {
        version: BLOB_VERSION,
        salt: BASE64.encode(salt),
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(&ciphertext),
        auth_tag: BASE64.encode(&tag),
        integrity: BASE64.encode(integrity),
    })
}

/// Open a sealed blob. Tampering with any field, including the integrity
/// hash itself, fails with `IntegrityFailure`.
pub fn open(blob: &EncryptedBlob, secret: &[u8], aad: &[u8]) -> Result<Vec<u8>, LicenseError> {
    if blob.version != BLOB_VERSION {
        return Err(LicenseError::InvalidFormat);
    }
    let salt = decode_field(&blob.salt, Some(SALT_LEN))?;
    let nonce = decode_field(&blob.nonce, Some(NONCE_LEN))?;
    let ciphertext = decode_field(&blob.ciphertext, None)?;
    let tag = decode_field(&blob.auth_tag, Some(TAG_LEN))?;
    let integrity = decode_field(&blob.integrity, None)?;

    let expected = integrity_hash(blob.version, &salt, &nonce, &ciphertext, &tag);
    if expected != integrity {
        return Err(LicenseError::IntegrityFailure);
    }

    let key = derive_key(secret, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| anyhow::anyhow!("cipher init failed: {e}"))?;

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &sealed,
                aad,
            },
        )
        .map_err(|_| LicenseError::IntegrityFailure)
}

fn decode_field(value: &str, expected_len: Option<usize>) -> Result<Vec<u8>, LicenseError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|_| LicenseError::IntegrityFailure)?;
    if let Some(len) = expected_len
        && bytes.len() != len
    {
        return Err(LicenseError::IntegrityFailure);
    }
    Ok(bytes)
}
