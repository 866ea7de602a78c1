//! Wiring of the issuance and verification services over one shared store,
//! ledger and clock.

use crate::clock::Clock;
use crate::config::QrSealConfig;
use crate::error::{IssueError, VerifyError};
use crate::issuance::{IssuanceService, IssuedToken};
use crate::ledger::{GuardedLedger, LedgerClient};
use crate::records::{RequestContext, Requester, Verdict};
use crate::storage_traits::{AuditLog, TokenStore};
use crate::verification::VerificationEngine;
use anyhow::Context;
use std::sync::Arc;

pub struct QrSeal {
    issuance: IssuanceService,
    verification: VerificationEngine,
}

impl QrSeal {
    /// Build both services over `store`, which serves as record store and audit log
    pub fn new<S>(
        store: Arc<S>,
        ledger: Arc<dyn LedgerClient>,
        clock: Arc<dyn Clock>,
        config: &QrSealConfig,
    ) -> anyhow::Result<Self>
    where
        S: TokenStore + AuditLog + 'static,
    {
        config.validate().context("invalid qrseal configuration")?;
        let guarded = Arc::new(
            GuardedLedger::new(ledger, config.ledger.clone())
                .context("failed to start ledger guard")?,
        );

        let tokens: Arc<dyn TokenStore> = store.clone();
        let audit: Arc<dyn AuditLog> = store;

        let issuance = IssuanceService::new(
            tokens.clone(),
            guarded.clone(),
            clock.clone(),
            config.token.clone(),
        );
        let verification =
            VerificationEngine::new(tokens, audit, guarded, clock, config.token.policy());

        Ok(Self {
            issuance,
            verification,
        })
    }

    /// Open the SQLite store named by `config.store` and use the system clock
    #[cfg(feature = "sqlite")]
    pub fn open_sqlite(
        config: &QrSealConfig,
        ledger: Arc<dyn LedgerClient>,
    ) -> anyhow::Result<Self> {
        let store = crate::storage::SqliteStore::with_config(&config.store)
            .with_context(|| format!("failed to open store at {}", config.store.path.display()))?;
        log::info!("Opened token store at {}", config.store.path.display());
        Self::new(
            Arc::new(store),
            ledger,
            Arc::new(crate::clock::SystemClock),
            config,
        )
    }

    pub fn issue(
        &self,
        product_id: &str,
        requester: &Requester,
    ) -> Result<IssuedToken, IssueError> {
        self.issuance.issue(product_id, requester)
    }

    pub fn verify(
        &self,
        payload: &str,
        context: &RequestContext,
    ) -> Result<Verdict, VerifyError> {
        self.verification.verify(payload, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::MemoryLedger;
    use crate::records::{Outcome, Product, Role};
    use crate::storage::MemoryStore;
    use chrono::NaiveDate;

    #[test]
    fn test_issue_and_verify_through_facade() {
        let store = Arc::new(MemoryStore::new());
        store
            .register_product(Product {
                product_id: "AMX-500".to_string(),
                name: "Amoxicillin 500mg".to_string(),
                manufacturer: "Acme Pharma".to_string(),
                batch_number: "B-17".to_string(),
                manufacture_date: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
                expiry_date: NaiveDate::from_ymd_opt(2027, 1, 5).unwrap(),
                description: Some("capsules".to_string()),
            })
            .unwrap();

        let seal = QrSeal::new(
            store.clone(),
            Arc::new(MemoryLedger::new()),
            Arc::new(ManualClock::new(1_760_000_000_000)),
            &QrSealConfig::default(),
        )
        .unwrap();

        let token = seal
            .issue("AMX-500", &Requester::new("u-1", Role::Manufacturer))
            .unwrap();
        let verdict = seal.verify(&token.payload, &RequestContext::default()).unwrap();
        assert_eq!(verdict.outcome(), Outcome::Authentic);
        assert_eq!(store.entries_for_product("AMX-500").unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = QrSealConfig::default();
        config.token.ttl_minutes = 0;
        let built = QrSeal::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLedger::new()),
            Arc::new(ManualClock::new(0)),
            &config,
        );
        assert!(built.is_err());
    }
}
