//! Ledger adapter contract, an in-process ledger, and the bounded-retry guard
//! the verification engine talks through.

use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::records::{LedgerBinding, TransactionRef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::runtime::Runtime;

/// Narrow view of the ledger: anchor a binding, read it back
pub trait LedgerClient: Send + Sync {
    /// Record `token_hash -> product_id` immutably
    fn anchor(&self, token_hash: &str, product_id: &str) -> Result<TransactionRef, LedgerError>;

    /// Read the binding for `token_hash`.
    ///
    /// A freshly anchored hash may not be visible yet; callers cannot tell that
    /// apart from a hash that was never anchored.
    fn query_binding(&self, token_hash: &str) -> Result<LedgerBinding, LedgerError>;
}

/// An anchored binding as held by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAnchor {
    pub token_hash: String,
    pub product_id: String,
    pub transaction: TransactionRef,
}

#[derive(Debug)]
struct PendingAnchor {
    anchor: LedgerAnchor,
    /// Reads that will still miss this anchor
    hidden_reads: u32,
}

#[derive(Debug)]
struct ChainState {
    tip: [u8; 32],
    height: u64,
    anchors: HashMap<String, PendingAnchor>,
}

/// Hash-chained in-process ledger.
///
/// Every anchor is its own block; the transaction hash commits to the previous
/// tip, so anchors cannot be rewritten without changing every later hash.
#[derive(Debug)]
pub struct MemoryLedger {
    state: Mutex<ChainState>,
    propagation_lag: u32,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_propagation_lag(0)
    }

    /// A ledger where each new anchor stays invisible to the first `reads` queries
    pub fn with_propagation_lag(reads: u32) -> Self {
        Self {
            state: Mutex::new(ChainState {
                tip: *blake3::hash(b"QRSEAL_GENESIS").as_bytes(),
                height: 0,
                anchors: HashMap::new(),
            }),
            propagation_lag: reads,
        }
    }

    /// Current block height
    pub fn height(&self) -> u64 {
        self.state.lock().map(|s| s.height).unwrap_or(0)
    }

    /// The anchor for `token_hash`, regardless of propagation
    pub fn anchor_of(&self, token_hash: &str) -> Option<LedgerAnchor> {
        let state = self.state.lock().ok()?;
        state.anchors.get(token_hash).map(|p| p.anchor.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ChainState>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Unavailable("ledger state poisoned".to_string()))
    }
}

impl LedgerClient for MemoryLedger {
    fn anchor(&self, token_hash: &str, product_id: &str) -> Result<TransactionRef, LedgerError> {
        let mut state = self.lock()?;
        if state.anchors.contains_key(token_hash) {
            return Err(LedgerError::AnchorFailed(format!(
                "{} is already anchored",
                token_hash
            )));
        }

        let height = state.height + 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&state.tip);
        hasher.update(&height.to_le_bytes());
        hasher.update(token_hash.as_bytes());
        hasher.update(b":");
        hasher.update(product_id.as_bytes());
        let tx = *hasher.finalize().as_bytes();

        let transaction = TransactionRef {
            transaction_hash: hex::encode(tx),
            block_height: height,
        };
        state.tip = tx;
        state.height = height;
        state.anchors.insert(
            token_hash.to_string(),
            PendingAnchor {
                anchor: LedgerAnchor {
                    token_hash: token_hash.to_string(),
                    product_id: product_id.to_string(),
                    transaction: transaction.clone(),
                },
                hidden_reads: self.propagation_lag,
            },
        );

        log::debug!("Anchored {} at height {}", token_hash, height);
        Ok(transaction)
    }

    fn query_binding(&self, token_hash: &str) -> Result<LedgerBinding, LedgerError> {
        let mut state = self.lock()?;
        let Some(pending) = state.anchors.get_mut(token_hash) else {
            return Ok(LedgerBinding::absent());
        };

        if pending.hidden_reads > 0 {
            pending.hidden_reads -= 1;
            return Ok(LedgerBinding::absent());
        }

        Ok(LedgerBinding {
            exists: true,
            product_id: Some(pending.anchor.product_id.clone()),
            is_verified: true,
        })
    }
}

/// Wraps a [`LedgerClient`] with a per-call timeout, bounded retries with
/// exponential backoff for transient failures, and bounded re-reads of
/// bindings that have not propagated yet.
pub struct GuardedLedger {
    client: Arc<dyn LedgerClient>,
    config: LedgerConfig,
    /// Taken on drop so timed-out calls do not hold up shutdown
    rt: Option<Runtime>,
}

impl GuardedLedger {
    pub fn new(
        client: Arc<dyn LedgerClient>,
        config: LedgerConfig,
    ) -> Result<Self, LedgerError> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("qrseal-ledger")
            .enable_time()
            .build()
            .map_err(|e| LedgerError::Unavailable(format!("Failed to create runtime: {}", e)))?;

        Ok(Self {
            client,
            config,
            rt: Some(rt),
        })
    }

    pub fn client(&self) -> &Arc<dyn LedgerClient> {
        &self.client
    }

    /// Anchor once under the query timeout, without retries
    pub fn anchor(
        &self,
        token_hash: &str,
        product_id: &str,
    ) -> Result<TransactionRef, LedgerError> {
        let token_hash = token_hash.to_string();
        let product_id = product_id.to_string();
        self.bounded(move |client| client.anchor(&token_hash, &product_id))
            .map_err(|e| match e {
                LedgerError::AnchorFailed(_) => e,
                other => LedgerError::AnchorFailed(other.to_string()),
            })
    }

    /// Query a binding, absorbing timeouts, outages and propagation delay.
    ///
    /// Returns the last binding seen (possibly absent) or the last transient
    /// error once the retry budget is spent.
    pub fn query_binding(&self, token_hash: &str) -> Result<LedgerBinding, LedgerError> {
        let mut transient_retries = 0;
        let mut propagation_reads = 0;
        let mut attempt = 0;

        loop {
            let hash = token_hash.to_string();
            let result = self.bounded(move |client| client.query_binding(&hash));

            match result {
                Ok(binding) if binding.exists => return Ok(binding),
                Ok(binding) => {
                    if propagation_reads >= self.config.propagation_retries {
                        return Ok(binding);
                    }
                    propagation_reads += 1;
                    log::debug!(
                        "Binding for {} not visible yet, re-reading ({}/{})",
                        token_hash,
                        propagation_reads,
                        self.config.propagation_retries
                    );
                }
                Err(e) if e.is_transient() => {
                    if transient_retries >= self.config.max_retries {
                        log::warn!("Ledger query for {} gave up: {}", token_hash, e);
                        return Err(e);
                    }
                    transient_retries += 1;
                    log::warn!(
                        "Ledger query for {} failed ({}), retry {}/{}",
                        token_hash,
                        e,
                        transient_retries,
                        self.config.max_retries
                    );
                }
                Err(e) => return Err(e),
            }

            thread::sleep(self.config.backoff(attempt));
            attempt += 1;
        }
    }

    fn bounded<T, F>(&self, call: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn LedgerClient) -> Result<T, LedgerError> + Send + 'static,
    {
        let Some(rt) = self.rt.as_ref() else {
            return Err(LedgerError::Unavailable("ledger guard is shut down".to_string()));
        };
        let client = Arc::clone(&self.client);
        let timeout = self.config.query_timeout();
        let timeout_ms = self.config.query_timeout_ms;

        rt.block_on(async move {
            let task = tokio::task::spawn_blocking(move || call(client.as_ref()));
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(LedgerError::Unavailable(format!(
                    "ledger call aborted: {}",
                    join_error
                ))),
                Err(_) => Err(LedgerError::Timeout(timeout_ms)),
            }
        })
    }
}

impl Drop for GuardedLedger {
    fn drop(&mut self) {
        // A client stuck past its timeout still occupies a blocking thread.
        if let Some(rt) = self.rt.take() {
            rt.shutdown_background();
        }
    }
}

impl std::fmt::Debug for GuardedLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedLedger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    fn fast_config() -> LedgerConfig {
        LedgerConfig {
            query_timeout_ms: 100,
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            propagation_retries: 2,
        }
    }

    /// Fails with `Unavailable` a fixed number of times, then answers
    struct FlakyLedger {
        inner: MemoryLedger,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl LedgerClient for FlakyLedger {
        fn anchor(
            &self,
            token_hash: &str,
            product_id: &str,
        ) -> Result<TransactionRef, LedgerError> {
            self.inner.anchor(token_hash, product_id)
        }

        fn query_binding(&self, token_hash: &str) -> Result<LedgerBinding, LedgerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(LedgerError::Unavailable("connection refused".into()));
            }
            self.inner.query_binding(token_hash)
        }
    }

    struct SlowLedger;

    impl LedgerClient for SlowLedger {
        fn anchor(&self, _: &str, _: &str) -> Result<TransactionRef, LedgerError> {
            thread::sleep(Duration::from_millis(250));
            Err(LedgerError::AnchorFailed("late".into()))
        }

        fn query_binding(&self, _: &str) -> Result<LedgerBinding, LedgerError> {
            thread::sleep(Duration::from_millis(250));
            Ok(LedgerBinding::absent())
        }
    }

    #[test]
    fn test_memory_ledger_anchor_and_query() {
        let ledger = MemoryLedger::new();
        let tx1 = ledger.anchor("h1", "P1").unwrap();
        let tx2 = ledger.anchor("h2", "P1").unwrap();

        assert_eq!(tx1.block_height, 1);
        assert_eq!(tx2.block_height, 2);
        assert_ne!(tx1.transaction_hash, tx2.transaction_hash);
        assert_eq!(ledger.height(), 2);

        let binding = ledger.query_binding("h1").unwrap();
        assert!(binding.exists && binding.is_verified);
        assert_eq!(binding.product_id.as_deref(), Some("P1"));
        assert_eq!(ledger.query_binding("h3").unwrap(), LedgerBinding::absent());
    }

    #[test]
    fn test_anchors_are_immutable() {
        let ledger = MemoryLedger::new();
        ledger.anchor("h1", "P1").unwrap();
        assert!(matches!(ledger.anchor("h1", "P2"), Err(LedgerError::AnchorFailed(_))));
        assert_eq!(ledger.anchor_of("h1").unwrap().product_id, "P1");
    }

    #[test]
    fn test_guard_absorbs_propagation_lag() {
        let memory = Arc::new(MemoryLedger::with_propagation_lag(2));
        memory.anchor("h1", "P1").unwrap();

        let guard = GuardedLedger::new(memory, fast_config()).unwrap();
        assert!(guard.query_binding("h1").unwrap().exists);
    }

    #[test]
    fn test_guard_reports_absent_after_propagation_budget() {
        let memory = Arc::new(MemoryLedger::with_propagation_lag(5));
        memory.anchor("h1", "P1").unwrap();

        let guard = GuardedLedger::new(memory, fast_config()).unwrap();
        assert!(!guard.query_binding("h1").unwrap().exists);
    }

    #[test]
    fn test_guard_retries_transient_failures() {
        let flaky = Arc::new(FlakyLedger {
            inner: MemoryLedger::new(),
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        flaky.anchor("h1", "P1").unwrap();

        let guard = GuardedLedger::new(flaky.clone(), fast_config()).unwrap();
        assert!(guard.query_binding("h1").unwrap().exists);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_guard_gives_up_after_retry_budget() {
        let flaky = Arc::new(FlakyLedger {
            inner: MemoryLedger::new(),
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        });

        let guard = GuardedLedger::new(flaky.clone(), fast_config()).unwrap();
        let err = guard.query_binding("h1").unwrap_err();
        assert!(matches!(err, LedgerError::Unavailable(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_guard_times_out_slow_ledger() {
        let guard = GuardedLedger::new(Arc::new(SlowLedger), fast_config()).unwrap();

        let started = Instant::now();
        let err = guard.query_binding("h1").unwrap_err();
        assert_eq!(err, LedgerError::Timeout(100));
        // Three bounded attempts, not three full sleeps.
        assert!(started.elapsed() < Duration::from_millis(700));

        let err = guard.anchor("h1", "P1").unwrap_err();
        assert!(matches!(err, LedgerError::AnchorFailed(_)));
    }

    struct HungLedger;

    impl LedgerClient for HungLedger {
        fn anchor(&self, _: &str, _: &str) -> Result<TransactionRef, LedgerError> {
            thread::sleep(Duration::from_secs(3));
            Err(LedgerError::AnchorFailed("late".into()))
        }

        fn query_binding(&self, _: &str) -> Result<LedgerBinding, LedgerError> {
            thread::sleep(Duration::from_secs(3));
            Ok(LedgerBinding::absent())
        }
    }

    #[test]
    fn test_drop_does_not_wait_for_hung_call() {
        let config = LedgerConfig {
            query_timeout_ms: 50,
            max_retries: 0,
            ..fast_config()
        };
        let guard = GuardedLedger::new(Arc::new(HungLedger), config).unwrap();
        assert_eq!(guard.query_binding("h1").unwrap_err(), LedgerError::Timeout(50));

        let started = Instant::now();
        drop(guard);
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
