use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since the Unix epoch, UTC
pub type EpochMillis = i64;

/// A registered medicine batch. Read-only to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: String,
    pub name: String,
    pub manufacturer: String,
    pub batch_number: String,
    pub manufacture_date: NaiveDate,
    pub expiry_date: NaiveDate,
    pub description: Option<String>,
}

/// One issued QR token as persisted in the record store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Hex digest identifying the token; primary key
    pub token_hash: String,
    pub product_id: String,
    pub nonce: String,
    pub issued_at: EpochMillis,
    pub expires_at: EpochMillis,
    pub used: bool,
    pub used_at: Option<EpochMillis>,
}

impl TokenRecord {
    /// A fresh, unused record
    pub fn new(
        token_hash: String,
        product_id: String,
        nonce: String,
        issued_at: EpochMillis,
        expires_at: EpochMillis,
    ) -> Self {
        Self {
            token_hash,
            product_id,
            nonce,
            issued_at,
            expires_at,
            used: false,
            used_at: None,
        }
    }
}

/// Reference to the ledger transaction that anchored a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRef {
    pub transaction_hash: String,
    pub block_height: u64,
}

/// What the ledger reports about a token hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBinding {
    pub exists: bool,
    pub product_id: Option<String>,
    pub is_verified: bool,
}

impl LedgerBinding {
    /// The answer for a hash the ledger has never seen (or not seen yet)
    pub fn absent() -> Self {
        Self {
            exists: false,
            product_id: None,
            is_verified: false,
        }
    }
}

/// Roles known to the identity layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manufacturer,
    Pharmacy,
    Consumer,
    /// Drug regulatory authority
    Regulator,
}

impl Role {
    pub fn may_issue(&self) -> bool {
        matches!(self, Role::Admin | Role::Manufacturer)
    }
}

/// The authenticated caller asking for a token to be minted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub user_id: String,
    pub role: Role,
}

impl Requester {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

/// Caller-supplied context recorded with every verification attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Opaque to this crate; stored as given
    pub metadata: serde_json::Value,
}

/// Classification of a presented token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Authentic,
    Counterfeit,
    Expired,
    AlreadyUsed,
    Suspicious,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Authentic => "authentic",
            Outcome::Counterfeit => "counterfeit",
            Outcome::Expired => "expired",
            Outcome::AlreadyUsed => "already_used",
            Outcome::Suspicious => "suspicious",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "authentic" => Some(Outcome::Authentic),
            "counterfeit" => Some(Outcome::Counterfeit),
            "expired" => Some(Outcome::Expired),
            "already_used" => Some(Outcome::AlreadyUsed),
            "suspicious" => Some(Outcome::Suspicious),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a verdict was reached. Every reason belongs to exactly one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerdictReason {
    /// Store and ledger agree and the token was consumed by this attempt
    Verified,
    MalformedPayload,
    /// The hash does not correspond to any issued token
    UnknownToken,
    /// The payload's product id differs from the one recorded for the hash
    ProductMismatch,
    /// The payload's issue time differs from the one recorded for the hash
    TimestampMismatch,
    /// Issued-at plus the TTL policy lies in the past
    PayloadWindow,
    /// The record's stored expiry lies in the past
    RecordWindow,
    PreviouslyUsed,
    /// A concurrent attempt consumed the token first
    LostRace,
    LedgerBindingMissing,
    LedgerProductMismatch,
    LedgerUnverified,
    LedgerUnavailable,
    /// The record store failed mid-attempt; recorded in the audit log only
    StoreUnavailable,
}

impl VerdictReason {
    pub fn outcome(&self) -> Outcome {
        use VerdictReason::*;
        match self {
            Verified => Outcome::Authentic,
            MalformedPayload | UnknownToken | ProductMismatch | TimestampMismatch => {
                Outcome::Counterfeit
            }
            PayloadWindow | RecordWindow => Outcome::Expired,
            PreviouslyUsed | LostRace => Outcome::AlreadyUsed,
            LedgerBindingMissing | LedgerProductMismatch | LedgerUnverified
            | LedgerUnavailable | StoreUnavailable => Outcome::Suspicious,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use VerdictReason::*;
        match self {
            Verified => "verified",
            MalformedPayload => "malformed_payload",
            UnknownToken => "unknown_token",
            ProductMismatch => "product_mismatch",
            TimestampMismatch => "timestamp_mismatch",
            PayloadWindow => "payload_window",
            RecordWindow => "record_window",
            PreviouslyUsed => "previously_used",
            LostRace => "lost_race",
            LedgerBindingMissing => "ledger_binding_missing",
            LedgerProductMismatch => "ledger_product_mismatch",
            LedgerUnverified => "ledger_unverified",
            LedgerUnavailable => "ledger_unavailable",
            StoreUnavailable => "store_unavailable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        use VerdictReason::*;
        let reason = match value {
            "verified" => Verified,
            "malformed_payload" => MalformedPayload,
            "unknown_token" => UnknownToken,
            "product_mismatch" => ProductMismatch,
            "timestamp_mismatch" => TimestampMismatch,
            "payload_window" => PayloadWindow,
            "record_window" => RecordWindow,
            "previously_used" => PreviouslyUsed,
            "lost_race" => LostRace,
            "ledger_binding_missing" => LedgerBindingMissing,
            "ledger_product_mismatch" => LedgerProductMismatch,
            "ledger_unverified" => LedgerUnverified,
            "ledger_unavailable" => LedgerUnavailable,
            "store_unavailable" => StoreUnavailable,
            _ => return None,
        };
        Some(reason)
    }
}

/// Terminal result of one verification attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub reason: VerdictReason,
    /// Present once the payload parsed
    pub token_hash: Option<String>,
    pub product_id: Option<String>,
    /// Product details, returned only for authentic tokens
    pub product: Option<Product>,
}

impl Verdict {
    pub fn outcome(&self) -> Outcome {
        self.reason.outcome()
    }

    pub fn is_authentic(&self) -> bool {
        self.outcome() == Outcome::Authentic
    }
}

/// Append-only audit record written for every verification attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationLogEntry {
    /// Assigned by the store; `None` before the entry is appended
    pub id: Option<i64>,
    pub product_id: Option<String>,
    pub token_hash: Option<String>,
    pub outcome: Outcome,
    pub reason: VerdictReason,
    pub is_valid: bool,
    pub verified_at: EpochMillis,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: serde_json::Value,
}

impl VerificationLogEntry {
    pub fn from_verdict(verdict: &Verdict, context: &RequestContext, at: EpochMillis) -> Self {
        Self {
            id: None,
            product_id: verdict.product_id.clone(),
            token_hash: verdict.token_hash.clone(),
            outcome: verdict.outcome(),
            reason: verdict.reason,
            is_valid: verdict.is_authentic(),
            verified_at: at,
            ip_address: context.ip_address.clone(),
            user_agent: context.user_agent.clone(),
            metadata: context.metadata.clone(),
        }
    }
}
