//! Single-use QR tokens for medicine batches.
//!
//! Tokens are minted by [`IssuanceService`], persisted in a [`TokenStore`] and
//! anchored on a ledger. [`VerificationEngine`] classifies a scanned payload by
//! checking both sources and consumes the token on the first authentic scan.

pub mod authority;
pub mod clock;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod issuance;
pub mod ledger;
pub mod records;
pub mod storage;
pub mod storage_traits;
pub mod verification;

// Re-export the main types for convenience
pub use authority::QrSeal;
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{TokenClaims, TokenPayload, TokenPolicy};
pub use config::{LedgerConfig, QrSealConfig, StoreConfig, TokenConfig};
pub use error::{
    CodecError, ConfigError, CryptoError, IssueError, LedgerError, RenderError, StoreError,
    VerifyError,
};
pub use issuance::{IssuanceService, IssuedToken, Renderer};
pub use ledger::{GuardedLedger, LedgerClient, MemoryLedger};
pub use records::{
    EpochMillis, LedgerBinding, Outcome, Product, RequestContext, Requester, Role, TokenRecord,
    TransactionRef, Verdict, VerdictReason, VerificationLogEntry,
};
pub use storage_traits::{AuditLog, TokenStore};
pub use verification::VerificationEngine;

pub use storage::MemoryStore;
#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
