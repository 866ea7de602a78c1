use crate::error::StoreError;
use crate::records::{EpochMillis, Product, TokenRecord, VerificationLogEntry};

/// The record-store operations issuance and verification depend on
pub trait TokenStore: Send + Sync {
    /// Persist a new token record
    ///
    /// # Returns
    /// `StoreError::Conflict` if a record with the same hash already exists
    fn create_token(&self, record: &TokenRecord) -> Result<(), StoreError>;

    /// Get a token record by its hash
    ///
    /// # Returns
    /// The record, or `StoreError::NotFound`
    fn get_token(&self, token_hash: &str) -> Result<TokenRecord, StoreError>;

    /// Consume a token.
    ///
    /// Implementations must flip `used` from false to true with a single
    /// conditional write, never a read followed by a write. Of any number of
    /// concurrent calls for one hash exactly one returns `Ok`.
    ///
    /// # Returns
    /// `StoreError::AlreadyUsed` if the token was already consumed,
    /// `StoreError::NotFound` if it was never issued
    fn mark_used(&self, token_hash: &str, at: EpochMillis) -> Result<(), StoreError>;

    /// Remove a record that was never shown to anyone.
    ///
    /// Only issuance calls this, to roll back a token whose anchoring failed.
    fn delete_token(&self, token_hash: &str) -> Result<(), StoreError>;

    /// Get product metadata by id
    fn get_product_by_id(&self, product_id: &str) -> Result<Option<Product>, StoreError>;
}

/// Append-only storage for verification attempts
pub trait AuditLog: Send + Sync {
    /// Append an entry and return the id the store assigned to it
    fn append_verification(&self, entry: &VerificationLogEntry) -> Result<i64, StoreError>;

    /// All entries recorded for a product, oldest first
    fn entries_for_product(&self, product_id: &str)
        -> Result<Vec<VerificationLogEntry>, StoreError>;

    /// All entries recorded for a token hash, oldest first
    fn entries_for_token(&self, token_hash: &str) -> Result<Vec<VerificationLogEntry>, StoreError>;
}
