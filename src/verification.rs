//! Verification of scanned token payloads.
//!
//! A presented payload moves through
//! `Received -> Parsed -> ExpiryChecked -> StoreChecked -> LedgerChecked`
//! and stops at the first stage that rejects it. Every attempt writes exactly
//! one audit entry, including attempts cut short by a store failure. The
//! store is always consulted
//! before the ledger and the ledger is never skipped: a store that says
//! "valid" is not enough on its own.

use crate::clock::Clock;
use crate::codec::{self, TokenPayload, TokenPolicy};
use crate::error::{StoreError, VerifyError};
use crate::ledger::GuardedLedger;
use crate::records::{
    EpochMillis, Outcome, RequestContext, TokenRecord, Verdict, VerdictReason,
    VerificationLogEntry,
};
use crate::storage_traits::{AuditLog, TokenStore};
use std::fmt;
use std::sync::Arc;

/// Stages of a single verification attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Parsed,
    ExpiryChecked,
    StoreChecked,
    LedgerChecked,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Parsed => "parsed",
            Stage::ExpiryChecked => "expiry-checked",
            Stage::StoreChecked => "store-checked",
            Stage::LedgerChecked => "ledger-checked",
        };
        f.write_str(name)
    }
}

pub struct VerificationEngine {
    store: Arc<dyn TokenStore>,
    audit: Arc<dyn AuditLog>,
    ledger: Arc<GuardedLedger>,
    clock: Arc<dyn Clock>,
    policy: TokenPolicy,
}

impl VerificationEngine {
    pub fn new(
        store: Arc<dyn TokenStore>,
        audit: Arc<dyn AuditLog>,
        ledger: Arc<GuardedLedger>,
        clock: Arc<dyn Clock>,
        policy: TokenPolicy,
    ) -> Self {
        Self {
            store,
            audit,
            ledger,
            clock,
            policy,
        }
    }

    /// Classify a scanned payload and record the attempt.
    ///
    /// Counterfeit, expired, used and suspicious tokens come back as `Ok`
    /// verdicts. `Err` means the store itself failed, or the verdict could not
    /// be written to the audit log. A store failure is still audited, as
    /// `StoreUnavailable`, on a best-effort basis.
    pub fn verify(
        &self,
        payload: &str,
        context: &RequestContext,
    ) -> Result<Verdict, VerifyError> {
        let verdict = match self.decide(payload) {
            Ok(verdict) => verdict,
            Err(e) => {
                self.record_store_failure(payload, context, &e);
                return Err(VerifyError::Store(e));
            }
        };

        let entry = VerificationLogEntry::from_verdict(&verdict, context, self.clock.now_millis());
        if let Err(source) = self.audit.append_verification(&entry) {
            log::error!("Audit write failed for {:?}: {}", verdict.token_hash, source);
            return Err(VerifyError::AuditWrite {
                verdict: Box::new(verdict),
                source,
            });
        }

        match verdict.outcome() {
            Outcome::Suspicious => log::warn!(
                "Token {:?} for product {:?} is suspicious: {}",
                verdict.token_hash,
                verdict.product_id,
                verdict.reason.as_str()
            ),
            outcome => log::info!(
                "Token {:?} verified as {} ({})",
                verdict.token_hash,
                outcome,
                verdict.reason.as_str()
            ),
        }

        Ok(verdict)
    }

    fn record_store_failure(&self, payload: &str, context: &RequestContext, err: &StoreError) {
        let parsed = codec::parse(payload).ok();
        let verdict = Verdict {
            reason: VerdictReason::StoreUnavailable,
            token_hash: parsed.as_ref().map(|p| p.token_hash.clone()),
            product_id: parsed.map(|p| p.product_id),
            product: None,
        };
        log::error!("Store failed while verifying {:?}: {}", verdict.token_hash, err);

        let entry = VerificationLogEntry::from_verdict(&verdict, context, self.clock.now_millis());
        if let Err(audit) = self.audit.append_verification(&entry) {
            log::error!("Audit write failed for {:?}: {}", verdict.token_hash, audit);
        }
    }

    fn decide(&self, payload: &str) -> Result<Verdict, StoreError> {
        self.trace(Stage::Received, None);

        let parsed = match codec::parse(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!("Rejecting payload: {}", e);
                return Ok(Verdict {
                    reason: VerdictReason::MalformedPayload,
                    token_hash: None,
                    product_id: None,
                    product: None,
                });
            }
        };
        self.trace(Stage::Parsed, Some(&parsed));

        let now = self.clock.now_millis();
        if codec::is_expired(parsed.issued_at, &self.policy, now) {
            return Ok(rejection(&parsed, VerdictReason::PayloadWindow));
        }
        self.trace(Stage::ExpiryChecked, Some(&parsed));

        let record = match self.store.get_token(&parsed.token_hash) {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                return Ok(rejection(&parsed, VerdictReason::UnknownToken))
            }
            Err(e) => return Err(e),
        };
        if let Some(reason) = check_record(&record, &parsed, now) {
            return Ok(rejection(&parsed, reason));
        }
        self.trace(Stage::StoreChecked, Some(&parsed));

        let binding = match self.ledger.query_binding(&parsed.token_hash) {
            Ok(binding) => binding,
            Err(e) => {
                log::warn!("Ledger unavailable for {}: {}", parsed.token_hash, e);
                return Ok(rejection(&parsed, VerdictReason::LedgerUnavailable));
            }
        };
        if !binding.exists {
            return Ok(rejection(&parsed, VerdictReason::LedgerBindingMissing));
        }
        if binding.product_id.as_deref() != Some(parsed.product_id.as_str()) {
            return Ok(rejection(&parsed, VerdictReason::LedgerProductMismatch));
        }
        if !binding.is_verified {
            return Ok(rejection(&parsed, VerdictReason::LedgerUnverified));
        }
        self.trace(Stage::LedgerChecked, Some(&parsed));

        // Products are immutable, so reading before consuming is safe.
        let product = self.store.get_product_by_id(&parsed.product_id)?;

        match self.store.mark_used(&parsed.token_hash, now) {
            Ok(()) => Ok(Verdict {
                reason: VerdictReason::Verified,
                token_hash: Some(parsed.token_hash),
                product_id: Some(parsed.product_id),
                product,
            }),
            Err(StoreError::AlreadyUsed(_)) => Ok(rejection(&parsed, VerdictReason::LostRace)),
            Err(StoreError::NotFound(_)) => Ok(rejection(&parsed, VerdictReason::UnknownToken)),
            Err(e) => Err(e),
        }
    }

    fn trace(&self, stage: Stage, parsed: Option<&TokenPayload>) {
        match parsed {
            Some(p) => log::debug!("Token {} for {}: {}", p.token_hash, p.product_id, stage),
            None => log::debug!("Payload {}", stage),
        }
    }
}

/// Store-side checks, in order: consumed, product binding, issue time, stored expiry
fn check_record(
    record: &TokenRecord,
    parsed: &TokenPayload,
    now: EpochMillis,
) -> Option<VerdictReason> {
    if record.used {
        return Some(VerdictReason::PreviouslyUsed);
    }
    if record.product_id != parsed.product_id {
        return Some(VerdictReason::ProductMismatch);
    }
    if record.issued_at != parsed.issued_at {
        return Some(VerdictReason::TimestampMismatch);
    }
    if now > record.expires_at {
        return Some(VerdictReason::RecordWindow);
    }
    None
}

fn rejection(parsed: &TokenPayload, reason: VerdictReason) -> Verdict {
    Verdict {
        reason,
        token_hash: Some(parsed.token_hash.clone()),
        product_id: Some(parsed.product_id.clone()),
        product: None,
    }
}
