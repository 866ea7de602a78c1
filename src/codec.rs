//! Token wire format.
//!
//! A token payload is a compact JSON object with exactly three members:
//!
//! ```text
//! {"tokenHash":"<64 lowercase hex>","productId":"<string>","issuedAt":<epoch millis>}
//! ```
//!
//! The token hash commits to the product id, the nonce and the issue time.
//! The expiry is stored next to the hash but is not part of it, so the
//! expiry policy can be audited separately from the binding.

use crate::clock::duration_millis;
use crate::crypto::{digest, is_digest_hex};
use crate::error::CodecError;
use crate::records::EpochMillis;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Issuer-chosen fields of a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub product_id: String,
    pub nonce: String,
    pub issued_at: EpochMillis,
    pub expires_at: EpochMillis,
}

impl TokenClaims {
    pub fn token_hash(&self) -> String {
        encode(self)
    }
}

/// The fields recovered from a scanned payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TokenPayload {
    pub token_hash: String,
    pub product_id: String,
    pub issued_at: EpochMillis,
}

/// Expiry policy applied at verification time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    pub ttl: Duration,
}

impl TokenPolicy {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    /// The absolute expiry of a token issued at `issued_at`
    pub fn expires_at(&self, issued_at: EpochMillis) -> EpochMillis {
        issued_at.saturating_add(duration_millis(self.ttl))
    }
}

/// Token hash for the given claims: `sha256(productId:nonce:issuedAt)`.
///
/// `expires_at` is not part of the digest.
pub fn encode(claims: &TokenClaims) -> String {
    digest(format!("{}:{}:{}", claims.product_id, claims.nonce, claims.issued_at).as_bytes())
}

/// Serialize the payload embedded in the scannable image
pub fn build_payload(
    token_hash: &str,
    product_id: &str,
    issued_at: EpochMillis,
) -> Result<String, CodecError> {
    let payload = TokenPayload {
        token_hash: token_hash.to_string(),
        product_id: product_id.to_string(),
        issued_at,
    };
    serde_json::to_string(&payload).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Parse a scanned payload without consulting any store or ledger
pub fn parse(serialized: &str) -> Result<TokenPayload, CodecError> {
    let serialized = serialized.trim();
    // The derived impl would also take a three element array.
    if !serialized.starts_with('{') {
        return Err(CodecError::MalformedPayload(
            "payload is not a JSON object".to_string(),
        ));
    }
    // Straight into the struct, so repeated members are rejected.
    let payload: TokenPayload = serde_json::from_str(serialized)
        .map_err(|e| CodecError::MalformedPayload(e.to_string()))?;

    if !is_digest_hex(&payload.token_hash) {
        return Err(CodecError::MalformedPayload(
            "tokenHash is not a 64 character lowercase hex digest".to_string(),
        ));
    }
    if payload.product_id.trim().is_empty() {
        return Err(CodecError::MalformedPayload("productId is empty".to_string()));
    }
    if payload.issued_at < 0 {
        return Err(CodecError::MalformedPayload(format!(
            "issuedAt {} is before the epoch",
            payload.issued_at
        )));
    }

    Ok(payload)
}

/// Whether a token issued at `issued_at` is past its window at `now`.
///
/// A token is still valid at exactly its expiry instant.
pub fn is_expired(issued_at: EpochMillis, policy: &TokenPolicy, now: EpochMillis) -> bool {
    now > policy.expires_at(issued_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(nonce: &str) -> TokenClaims {
        TokenClaims {
            product_id: "P1".to_string(),
            nonce: nonce.to_string(),
            issued_at: 1_700_000_000_000,
            expires_at: 1_700_000_900_000,
        }
    }

    #[test]
    fn test_encode_is_deterministic() {
        assert_eq!(encode(&claims("aa")), encode(&claims("aa")));
        assert_ne!(encode(&claims("aa")), encode(&claims("ab")));
    }

    #[test]
    fn test_expiry_does_not_affect_hash() {
        let a = claims("aa");
        let mut b = a.clone();
        b.expires_at += 60_000;
        assert_eq!(a.token_hash(), b.token_hash());
    }

    #[test]
    fn test_payload_round_trip() {
        let c = claims("0f0f");
        let hash = encode(&c);
        let payload = build_payload(&hash, &c.product_id, c.issued_at).unwrap();

        let parsed = parse(&payload).unwrap();
        assert_eq!(parsed.token_hash, hash);
        assert_eq!(parsed.product_id, "P1");
        assert_eq!(parsed.issued_at, c.issued_at);
    }

    #[test]
    fn test_parse_rejects_structural_damage() {
        let hash = "ab".repeat(32);
        let cases = [
            String::new(),
            "not json".to_string(),
            format!(r#"{{"tokenHash":"{hash}","productId":"P1"}}"#),
            format!(r#"{{"tokenHash":"{hash}","productId":"P1","issuedAt":1,"nonce":"x"}}"#),
            format!(r#"{{"tokenHash":"{hash}","productId":"P1","issuedAt":"soon"}}"#),
            format!(r#"{{"tokenHash":"{hash}","productId":"P1","issuedAt":1.5}}"#),
            format!(r#"{{"tokenHash":"{hash}","productId":"","issuedAt":1}}"#),
            format!(r#"{{"tokenHash":"{hash}","productId":"P1","issuedAt":-5}}"#),
            r#"{"tokenHash":"xyz","productId":"P1","issuedAt":1}"#.to_string(),
            format!(r#"[{hash:?},"P1",1]"#),
            format!(r#"{{"tokenHash":"{hash}","productId":"P9","productId":"P1","issuedAt":1}}"#),
            format!(r#"{{"tokenHash":"{hash}","productId":"P1","issuedAt":1,"issuedAt":1}}"#),
        ];

        for case in cases {
            assert!(
                matches!(parse(&case), Err(CodecError::MalformedPayload(_))),
                "accepted {case:?}"
            );
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let policy = TokenPolicy::new(Duration::from_secs(15 * 60));
        let issued_at = 1_000_000;
        let expires_at = policy.expires_at(issued_at);

        assert!(!is_expired(issued_at, &policy, expires_at - 1));
        assert!(!is_expired(issued_at, &policy, expires_at));
        assert!(is_expired(issued_at, &policy, expires_at + 1));
    }
}
