//! TOML configuration.
//!
//! Values come from (in order of increasing precedence):
//! 1. built-in defaults
//! 2. a TOML file, when one is given and exists
//! 3. environment overrides (`QRSEAL_TTL_MINUTES`, `QRSEAL_DB`,
//!    `QRSEAL_LEDGER_TIMEOUT_MS`)

use crate::codec::TokenPolicy;
use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QrSealConfig {
    pub token: TokenConfig,
    pub ledger: LedgerConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Validity window of a freshly issued token
    pub ttl_minutes: u64,
    /// Random bytes mixed into every token hash
    pub nonce_bytes: usize,
    /// Attempts at persisting a token before issuance gives up
    pub issue_max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Upper bound on a single ledger query
    pub query_timeout_ms: u64,
    /// Extra attempts after a timeout or unavailable ledger
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Re-reads of a binding that is not visible yet
    pub propagation_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 15,
            nonce_bytes: 32,
            issue_max_attempts: 3,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 5_000,
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
            propagation_retries: 2,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("qrseal.db"),
            max_connections: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

impl TokenConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes.saturating_mul(60))
    }

    pub fn policy(&self) -> TokenPolicy {
        TokenPolicy::new(self.ttl())
    }
}

impl LedgerConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Backoff before retry number `attempt` (zero-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

impl QrSealConfig {
    /// Load from `path`. A missing file yields the defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: QrSealConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(ttl) = std::env::var("QRSEAL_TTL_MINUTES") {
            self.token.ttl_minutes = ttl
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("QRSEAL_TTL_MINUTES={ttl}")))?;
        }
        if let Ok(db) = std::env::var("QRSEAL_DB") {
            self.store.path = PathBuf::from(db);
        }
        if let Ok(timeout) = std::env::var("QRSEAL_LEDGER_TIMEOUT_MS") {
            self.ledger.query_timeout_ms = timeout.parse().map_err(|_| {
                ConfigError::Invalid(format!("QRSEAL_LEDGER_TIMEOUT_MS={timeout}"))
            })?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.ttl_minutes == 0 {
            return Err(ConfigError::Invalid("token.ttl_minutes must be positive".into()));
        }
        if self.token.nonce_bytes == 0 {
            return Err(ConfigError::Invalid("token.nonce_bytes must be positive".into()));
        }
        if self.token.issue_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "token.issue_max_attempts must be positive".into(),
            ));
        }
        if self.ledger.query_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "ledger.query_timeout_ms must be positive".into(),
            ));
        }
        if self.store.max_connections == 0 {
            return Err(ConfigError::Invalid("store.max_connections must be positive".into()));
        }
        Ok(())
    }
}
