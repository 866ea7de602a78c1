//! Hashing, nonce generation and salted secret hashing.

use crate::error::CryptoError;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

/// PBKDF2 rounds for salted secrets
pub const PBKDF2_ROUNDS: u32 = 10_000;

/// Output length of a salted hash in bytes
pub const SALTED_HASH_LEN: usize = 64;

/// Length of a generated salt in bytes (before hex encoding)
pub const SALT_LEN: usize = 16;

/// Length of a hex-encoded SHA-256 digest
pub const DIGEST_HEX_LEN: usize = 64;

/// A salted secret hash, both halves hex-encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaltedHash {
    pub hash: String,
    pub salt: String,
}

/// SHA-256 of `data`, lowercase hex
pub fn digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whether `value` looks like a digest produced by [`digest`]
pub fn is_digest_hex(value: &str) -> bool {
    value.len() == DIGEST_HEX_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// `byte_len` bytes from the OS entropy source, hex-encoded.
///
/// There is no fallback generator: an entropy failure is returned to the caller.
pub fn random_nonce(byte_len: usize) -> Result<String, CryptoError> {
    let mut bytes = vec![0u8; byte_len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::Entropy(e.to_string()))?;
    Ok(hex::encode(bytes))
}

/// Hash a credential-like secret with PBKDF2-HMAC-SHA512.
///
/// A fresh random salt is generated when none is given.
pub fn salted_hash(secret: &str, salt: Option<&str>) -> Result<SaltedHash, CryptoError> {
    let salt = match salt {
        Some(salt) => salt.to_string(),
        None => random_nonce(SALT_LEN)?,
    };

    Ok(SaltedHash {
        hash: hex::encode(derive(secret, &salt)),
        salt,
    })
}

/// Check `secret` against a stored salted hash in constant time
pub fn verify_salted_hash(secret: &str, hash: &str, salt: &str) -> bool {
    let Ok(expected) = hex::decode(hash) else {
        return false;
    };
    let computed = derive(secret, salt);
    bool::from(computed.as_slice().ct_eq(expected.as_slice()))
}

fn derive(secret: &str, salt: &str) -> [u8; SALTED_HASH_LEN] {
    let mut out = [0u8; SALTED_HASH_LEN];
    pbkdf2_hmac::<Sha512>(secret.as_bytes(), salt.as_bytes(), PBKDF2_ROUNDS, &mut out);
    out
}
