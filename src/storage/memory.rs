use crate::error::StoreError;
use crate::records::{EpochMillis, Product, TokenRecord, VerificationLogEntry};
use crate::storage_traits::{AuditLog, TokenStore};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

/// In-process record store. Useful for tests and single-node tooling.
#[derive(Debug, Default)]
pub struct MemoryStore {
    products: RwLock<HashMap<String, Product>>,
    tokens: RwLock<HashMap<String, TokenRecord>>,
    logs: Mutex<Vec<VerificationLogEntry>>,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Other("memory store lock poisoned".to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace product metadata
    pub fn register_product(&self, product: Product) -> Result<(), StoreError> {
        let mut products = self.products.write().map_err(poisoned)?;
        products.insert(product.product_id.clone(), product);
        Ok(())
    }

    /// Number of token records currently held
    pub fn token_count(&self) -> Result<usize, StoreError> {
        Ok(self.tokens.read().map_err(poisoned)?.len())
    }

    fn filtered_logs<F>(&self, keep: F) -> Result<Vec<VerificationLogEntry>, StoreError>
    where
        F: Fn(&VerificationLogEntry) -> bool,
    {
        let logs = self.logs.lock().map_err(poisoned)?;
        Ok(logs.iter().filter(|e| keep(e)).cloned().collect())
    }
}

impl TokenStore for MemoryStore {
    fn create_token(&self, record: &TokenRecord) -> Result<(), StoreError> {
        let mut tokens = self.tokens.write().map_err(poisoned)?;
        if tokens.contains_key(&record.token_hash) {
            return Err(StoreError::Conflict(record.token_hash.clone()));
        }
        tokens.insert(record.token_hash.clone(), record.clone());
        Ok(())
    }

    fn get_token(&self, token_hash: &str) -> Result<TokenRecord, StoreError> {
        let tokens = self.tokens.read().map_err(poisoned)?;
        tokens
            .get(token_hash)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(token_hash.to_string()))
    }

    fn mark_used(&self, token_hash: &str, at: EpochMillis) -> Result<(), StoreError> {
        // Check and flip under one write guard.
        let mut tokens = self.tokens.write().map_err(poisoned)?;
        let record = tokens
            .get_mut(token_hash)
            .ok_or_else(|| StoreError::NotFound(token_hash.to_string()))?;
        if record.used {
            return Err(StoreError::AlreadyUsed(token_hash.to_string()));
        }
        record.used = true;
        record.used_at = Some(at);
        Ok(())
    }

    fn delete_token(&self, token_hash: &str) -> Result<(), StoreError> {
        let mut tokens = self.tokens.write().map_err(poisoned)?;
        tokens
            .remove(token_hash)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(token_hash.to_string()))
    }

    fn get_product_by_id(&self, product_id: &str) -> Result<Option<Product>, StoreError> {
        let products = self.products.read().map_err(poisoned)?;
        Ok(products.get(product_id).cloned())
    }
}

impl AuditLog for MemoryStore {
    fn append_verification(&self, entry: &VerificationLogEntry) -> Result<i64, StoreError> {
        let mut logs = self.logs.lock().map_err(poisoned)?;
        let id = logs.len() as i64 + 1;
        let mut stored = entry.clone();
        stored.id = Some(id);
        logs.push(stored);
        Ok(id)
    }

    fn entries_for_product(
        &self,
        product_id: &str,
    ) -> Result<Vec<VerificationLogEntry>, StoreError> {
        self.filtered_logs(|e| e.product_id.as_deref() == Some(product_id))
    }

    fn entries_for_token(&self, token_hash: &str) -> Result<Vec<VerificationLogEntry>, StoreError> {
        self.filtered_logs(|e| e.token_hash.as_deref() == Some(token_hash))
    }
}
