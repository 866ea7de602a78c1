//! Token issuance: generate, persist, anchor, hand back the payload.
//!
//! A token only becomes visible to a caller once both the store record and
//! the ledger anchor exist. If anchoring fails the store record is removed
//! before the error is returned.

use crate::clock::{to_rfc3339, Clock};
use crate::codec::{build_payload, TokenClaims};
use crate::config::TokenConfig;
use crate::crypto::random_nonce;
use crate::error::{IssueError, RenderError, StoreError};
use crate::ledger::GuardedLedger;
use crate::records::{EpochMillis, Requester, TokenRecord, TransactionRef};
use crate::storage_traits::TokenStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Turns a payload into scannable image bytes
pub trait Renderer {
    fn render(&self, payload: &str) -> Result<Vec<u8>, RenderError>;
}

/// A token that exists in both the store and the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    /// Serialized payload to embed in the image
    pub payload: String,
    pub token_hash: String,
    pub product_id: String,
    pub issued_at: EpochMillis,
    pub expires_at: EpochMillis,
    pub anchor: TransactionRef,
}

impl IssuedToken {
    pub fn render_with(&self, renderer: &dyn Renderer) -> Result<Vec<u8>, RenderError> {
        renderer.render(&self.payload)
    }
}

pub struct IssuanceService {
    store: Arc<dyn TokenStore>,
    ledger: Arc<GuardedLedger>,
    clock: Arc<dyn Clock>,
    config: TokenConfig,
}

impl IssuanceService {
    pub fn new(
        store: Arc<dyn TokenStore>,
        ledger: Arc<GuardedLedger>,
        clock: Arc<dyn Clock>,
        config: TokenConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            config,
        }
    }

    /// Mint a single-use token for `product_id` on behalf of `requester`
    pub fn issue(
        &self,
        product_id: &str,
        requester: &Requester,
    ) -> Result<IssuedToken, IssueError> {
        if !requester.role.may_issue() {
            return Err(IssueError::Unauthorized(requester.user_id.clone()));
        }

        if self.store.get_product_by_id(product_id)?.is_none() {
            return Err(IssueError::ProductNotFound(product_id.to_string()));
        }

        let record = self.persist_fresh_record(product_id)?;

        let anchor = match self.ledger.anchor(&record.token_hash, product_id) {
            Ok(anchor) => anchor,
            Err(e) => {
                log::warn!(
                    "Anchoring {} failed, rolling back store record: {}",
                    record.token_hash,
                    e
                );
                if let Err(rollback) = self.store.delete_token(&record.token_hash) {
                    log::error!(
                        "Rollback of un-anchored token {} failed: {}",
                        record.token_hash,
                        rollback
                    );
                    return Err(IssueError::IssuanceFailed(format!(
                        "{}; rollback also failed: {}",
                        e, rollback
                    )));
                }
                return Err(IssueError::IssuanceFailed(e.to_string()));
            }
        };

        log::info!(
            "Issued token {} for product {} to {} (tx {}, expires {})",
            record.token_hash,
            product_id,
            requester.user_id,
            anchor.transaction_hash,
            to_rfc3339(record.expires_at)
        );

        let payload = build_payload(&record.token_hash, product_id, record.issued_at)?;
        Ok(IssuedToken {
            payload,
            token_hash: record.token_hash,
            product_id: product_id.to_string(),
            issued_at: record.issued_at,
            expires_at: record.expires_at,
            anchor,
        })
    }

    /// Create a record under a fresh nonce, retrying a bounded number of
    /// times on hash collisions
    fn persist_fresh_record(&self, product_id: &str) -> Result<TokenRecord, IssueError> {
        let policy = self.config.policy();

        for attempt in 1..=self.config.issue_max_attempts {
            let issued_at = self.clock.now_millis();
            let claims = TokenClaims {
                product_id: product_id.to_string(),
                nonce: random_nonce(self.config.nonce_bytes)?,
                issued_at,
                expires_at: policy.expires_at(issued_at),
            };
            let record = TokenRecord::new(
                claims.token_hash(),
                claims.product_id,
                claims.nonce,
                claims.issued_at,
                claims.expires_at,
            );

            match self.store.create_token(&record) {
                Ok(()) => return Ok(record),
                Err(StoreError::Conflict(hash)) => {
                    log::warn!(
                        "Token hash collision on {} (attempt {}/{})",
                        hash,
                        attempt,
                        self.config.issue_max_attempts
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(IssueError::IssuanceFailed(format!(
            "no unique token hash after {} attempts",
            self.config.issue_max_attempts
        )))
    }
}
