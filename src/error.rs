use std::io;
use thiserror::Error;

use crate::records::Verdict;

/// Failures of the crypto primitives
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The operating system entropy source could not deliver random bytes
    #[error("Entropy source failure: {0}")]
    Entropy(String),
}

/// Failures of the token codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The scanned payload does not have the token wire shape
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A payload could not be serialized for embedding
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Represents all possible errors that can occur when interacting with the record store
#[derive(Error, Debug)]
pub enum StoreError {
    /// A record with the same primary key already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Errors related to missing data
    #[error("Not found: {0}")]
    NotFound(String),

    /// The token has already been consumed
    #[error("Token already used: {0}")]
    AlreadyUsed(String),

    /// Database errors that occur with the underlying storage backend
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors that don't fit in other categories
    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

impl From<String> for StoreError {
    fn from(err: String) -> Self {
        StoreError::Other(err)
    }
}

impl From<&str> for StoreError {
    fn from(err: &str) -> Self {
        StoreError::Other(err.to_string())
    }
}

/// Failures reported by a ledger adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The anchoring transaction was rejected or could not be submitted
    #[error("Anchor failed: {0}")]
    AnchorFailed(String),

    /// The ledger could not be reached; retrying may help
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// The ledger did not answer within the configured bound
    #[error("Ledger query timed out after {0} ms")]
    Timeout(u64),
}

impl LedgerError {
    /// Whether the failure is transient and worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_) | LedgerError::Timeout(_))
    }
}

/// Errors surfaced by token issuance
#[derive(Error, Debug)]
pub enum IssueError {
    /// The requester's role may not mint tokens
    #[error("Requester {0} is not allowed to issue tokens")]
    Unauthorized(String),

    #[error("Product not found: {0}")]
    ProductNotFound(String),

    /// Issuance did not complete and every partial effect was rolled back
    #[error("Issuance failed: {0}")]
    IssuanceFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Infrastructure failures during verification.
///
/// Counterfeit, expired, used and suspicious tokens are verdicts, not errors.
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The verdict was reached but its audit entry could not be written
    #[error("Failed to record verification ({verdict:?}): {source}")]
    AuditWrite {
        verdict: Box<Verdict>,
        #[source]
        source: StoreError,
    },
}

/// Failure of an image renderer
#[derive(Error, Debug)]
#[error("Render failed: {0}")]
pub struct RenderError(pub String);

/// Configuration loading failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O: {0}")]
    Io(#[from] io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_ledger_errors() {
        assert!(LedgerError::Timeout(100).is_transient());
        assert!(LedgerError::Unavailable("rpc down".into()).is_transient());
        assert!(!LedgerError::AnchorFailed("reverted".into()).is_transient());
    }

    #[test]
    fn test_string_conversions() {
        let err: StoreError = "boom".into();
        assert!(matches!(err, StoreError::Other(ref m) if m == "boom"));

        let err: StoreError = String::from("bang").into();
        assert_eq!(err.to_string(), "Other error: bang");
    }
}
