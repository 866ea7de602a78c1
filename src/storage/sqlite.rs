use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::records::{
    EpochMillis, Outcome, Product, TokenRecord, VerdictReason, VerificationLogEntry,
};
use crate::storage_traits::{AuditLog, TokenStore};
use chrono::NaiveDate;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::runtime::Runtime;

/// SQL query constants to avoid repetition
mod sql {
    pub const CREATE_PRODUCTS_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS products (
            product_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            manufacturer TEXT NOT NULL,
            batch_number TEXT NOT NULL,
            manufacture_date TEXT NOT NULL,
            expiry_date TEXT NOT NULL,
            description TEXT
        )
    "#;

    pub const CREATE_QR_RECORDS_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS qr_records (
            qr_hash TEXT PRIMARY KEY,
            product_id TEXT NOT NULL REFERENCES products(product_id),
            nonce TEXT NOT NULL,
            issued_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            used INTEGER NOT NULL DEFAULT 0,
            used_at INTEGER
        )
    "#;

    pub const CREATE_VERIFICATION_LOGS_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS verification_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            product_id TEXT,
            token_hash TEXT,
            outcome TEXT NOT NULL,
            reason TEXT NOT NULL,
            is_valid INTEGER NOT NULL,
            verified_at INTEGER NOT NULL,
            ip_address TEXT,
            user_agent TEXT,
            metadata TEXT NOT NULL
        )
    "#;

    pub const CREATE_LOG_INDEXES: [&str; 2] = [
        "CREATE INDEX IF NOT EXISTS idx_logs_product_id ON verification_logs(product_id)",
        "CREATE INDEX IF NOT EXISTS idx_logs_token_hash ON verification_logs(token_hash)",
    ];

    pub const UPSERT_PRODUCT: &str = r#"
        INSERT OR REPLACE INTO products
            (product_id, name, manufacturer, batch_number,
             manufacture_date, expiry_date, description)
        VALUES (?, ?, ?, ?, ?, ?, ?)
    "#;

    pub const GET_PRODUCT: &str = r#"
        SELECT product_id, name, manufacturer, batch_number,
               manufacture_date, expiry_date, description
        FROM products
        WHERE product_id = ?
    "#;

    pub const INSERT_TOKEN: &str = r#"
        INSERT INTO qr_records (qr_hash, product_id, nonce, issued_at, expires_at, used, used_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
    "#;

    pub const GET_TOKEN: &str = r#"
        SELECT qr_hash, product_id, nonce, issued_at, expires_at, used, used_at
        FROM qr_records
        WHERE qr_hash = ?
    "#;

    pub const MARK_USED: &str = r#"
        UPDATE qr_records
        SET used = 1, used_at = ?
        WHERE qr_hash = ? AND used = 0
    "#;

    pub const TOKEN_USED_FLAG: &str = "SELECT used FROM qr_records WHERE qr_hash = ?";

    pub const DELETE_TOKEN: &str = "DELETE FROM qr_records WHERE qr_hash = ?";

    pub const INSERT_LOG: &str = r#"
        INSERT INTO verification_logs
            (product_id, token_hash, outcome, reason, is_valid,
             verified_at, ip_address, user_agent, metadata)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#;

    pub const LOGS_BY_PRODUCT: &str = r#"
        SELECT id, product_id, token_hash, outcome, reason, is_valid,
               verified_at, ip_address, user_agent, metadata
        FROM verification_logs
        WHERE product_id = ?
        ORDER BY id
    "#;

    pub const LOGS_BY_TOKEN: &str = r#"
        SELECT id, product_id, token_hash, outcome, reason, is_valid,
               verified_at, ip_address, user_agent, metadata
        FROM verification_logs
        WHERE token_hash = ?
        ORDER BY id
    "#;
}

const DATE_FORMAT: &str = "%Y-%m-%d";

/// A SQLite-based implementation of the record store using sqlx.
pub struct SqliteStore {
    pool: SqlitePool,
    rt: Arc<Runtime>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Opens (creating if needed) a store at `path` with default pool settings
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let config = StoreConfig {
            path: path.as_ref().to_path_buf(),
            ..StoreConfig::default()
        };
        Self::with_config(&config)
    }

    /// Opens a store using the given configuration
    pub fn with_config(config: &StoreConfig) -> Result<Self, StoreError> {
        let db_path = config.path.clone();
        let db_url = format!("sqlite:{}", db_path.to_string_lossy());

        // Callers block on this runtime from many threads at once.
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map(Arc::new)
            .map_err(|e| StoreError::Other(format!("Failed to create runtime: {}", e)))?;

        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(|e| StoreError::Database(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .foreign_keys(true);

        let pool = rt
            .block_on(async {
                SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect_with(options)
                    .await
            })
            .map_err(|e| StoreError::Database(format!("Failed to connect to database: {}", e)))?;

        rt.block_on(Self::initialize_schema(&pool))?;
        log::debug!("Opened token store at {}", db_path.display());

        Ok(Self { pool, rt, db_path })
    }

    /// Creates the necessary tables in the database
    async fn initialize_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(sql::CREATE_PRODUCTS_TABLE).execute(pool).await?;
        sqlx::query(sql::CREATE_QR_RECORDS_TABLE).execute(pool).await?;
        sqlx::query(sql::CREATE_VERIFICATION_LOGS_TABLE)
            .execute(pool)
            .await?;
        for index in sql::CREATE_LOG_INDEXES {
            sqlx::query(index).execute(pool).await?;
        }
        Ok(())
    }

    /// Insert or replace product metadata
    pub fn register_product(&self, product: &Product) -> Result<(), StoreError> {
        self.rt.block_on(async {
            sqlx::query(sql::UPSERT_PRODUCT)
                .bind(&product.product_id)
                .bind(&product.name)
                .bind(&product.manufacturer)
                .bind(&product.batch_number)
                .bind(product.manufacture_date.format(DATE_FORMAT).to_string())
                .bind(product.expiry_date.format(DATE_FORMAT).to_string())
                .bind(&product.description)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    /// Path of the backing database file
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn row_to_product(row: &SqliteRow) -> Result<Product, StoreError> {
        let manufacture_date: String = row.try_get("manufacture_date")?;
        let expiry_date: String = row.try_get("expiry_date")?;

        Ok(Product {
            product_id: row.try_get("product_id")?,
            name: row.try_get("name")?,
            manufacturer: row.try_get("manufacturer")?,
            batch_number: row.try_get("batch_number")?,
            manufacture_date: parse_date(&manufacture_date)?,
            expiry_date: parse_date(&expiry_date)?,
            description: row.try_get("description")?,
        })
    }

    fn row_to_token(row: &SqliteRow) -> Result<TokenRecord, StoreError> {
        Ok(TokenRecord {
            token_hash: row.try_get("qr_hash")?,
            product_id: row.try_get("product_id")?,
            nonce: row.try_get("nonce")?,
            issued_at: row.try_get("issued_at")?,
            expires_at: row.try_get("expires_at")?,
            used: row.try_get("used")?,
            used_at: row.try_get("used_at")?,
        })
    }

    fn row_to_log(row: &SqliteRow) -> Result<VerificationLogEntry, StoreError> {
        let outcome: String = row.try_get("outcome")?;
        let reason: String = row.try_get("reason")?;
        let metadata: String = row.try_get("metadata")?;

        Ok(VerificationLogEntry {
            id: Some(row.try_get("id")?),
            product_id: row.try_get("product_id")?,
            token_hash: row.try_get("token_hash")?,
            outcome: Outcome::parse(&outcome)
                .ok_or_else(|| StoreError::Serialization(format!("Unknown outcome: {}", outcome)))?,
            reason: VerdictReason::parse(&reason)
                .ok_or_else(|| StoreError::Serialization(format!("Unknown reason: {}", reason)))?,
            is_valid: row.try_get("is_valid")?,
            verified_at: row.try_get("verified_at")?,
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
            metadata: serde_json::from_str(&metadata)?,
        })
    }

    fn logs_matching(
        &self,
        query: &str,
        key: &str,
    ) -> Result<Vec<VerificationLogEntry>, StoreError> {
        self.rt.block_on(async {
            let rows = sqlx::query(query).bind(key).fetch_all(&self.pool).await?;
            rows.iter().map(Self::row_to_log).collect()
        })
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|e| StoreError::Serialization(format!("Invalid date {:?}: {}", value, e)))
}

impl TokenStore for SqliteStore {
    fn create_token(&self, record: &TokenRecord) -> Result<(), StoreError> {
        self.rt.block_on(async {
            sqlx::query(sql::INSERT_TOKEN)
                .bind(&record.token_hash)
                .bind(&record.product_id)
                .bind(&record.nonce)
                .bind(record.issued_at)
                .bind(record.expires_at)
                .bind(record.used)
                .bind(record.used_at)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn get_token(&self, token_hash: &str) -> Result<TokenRecord, StoreError> {
        self.rt.block_on(async {
            let row = sqlx::query(sql::GET_TOKEN)
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some(row) => Self::row_to_token(&row),
                None => Err(StoreError::NotFound(token_hash.to_string())),
            }
        })
    }

    fn mark_used(&self, token_hash: &str, at: EpochMillis) -> Result<(), StoreError> {
        self.rt.block_on(async {
            let result = sqlx::query(sql::MARK_USED)
                .bind(at)
                .bind(token_hash)
                .execute(&self.pool)
                .await?;

            if result.rows_affected() == 1 {
                return Ok(());
            }

            // Nothing flipped: either it never existed or someone got there first.
            let used: Option<bool> = sqlx::query_scalar(sql::TOKEN_USED_FLAG)
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;

            match used {
                Some(_) => Err(StoreError::AlreadyUsed(token_hash.to_string())),
                None => Err(StoreError::NotFound(token_hash.to_string())),
            }
        })
    }

    fn delete_token(&self, token_hash: &str) -> Result<(), StoreError> {
        self.rt.block_on(async {
            let result = sqlx::query(sql::DELETE_TOKEN)
                .bind(token_hash)
                .execute(&self.pool)
                .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(token_hash.to_string()));
            }
            Ok(())
        })
    }

    fn get_product_by_id(&self, product_id: &str) -> Result<Option<Product>, StoreError> {
        self.rt.block_on(async {
            let row = sqlx::query(sql::GET_PRODUCT)
                .bind(product_id)
                .fetch_optional(&self.pool)
                .await?;

            row.as_ref().map(Self::row_to_product).transpose()
        })
    }
}

impl AuditLog for SqliteStore {
    fn append_verification(&self, entry: &VerificationLogEntry) -> Result<i64, StoreError> {
        let metadata = serde_json::to_string(&entry.metadata)?;

        self.rt.block_on(async {
            let result = sqlx::query(sql::INSERT_LOG)
                .bind(&entry.product_id)
                .bind(&entry.token_hash)
                .bind(entry.outcome.as_str())
                .bind(entry.reason.as_str())
                .bind(entry.is_valid)
                .bind(entry.verified_at)
                .bind(&entry.ip_address)
                .bind(&entry.user_agent)
                .bind(metadata)
                .execute(&self.pool)
                .await?;
            Ok(result.last_insert_rowid())
        })
    }

    fn entries_for_product(
        &self,
        product_id: &str,
    ) -> Result<Vec<VerificationLogEntry>, StoreError> {
        self.logs_matching(sql::LOGS_BY_PRODUCT, product_id)
    }

    fn entries_for_token(&self, token_hash: &str) -> Result<Vec<VerificationLogEntry>, StoreError> {
        self.logs_matching(sql::LOGS_BY_TOKEN, token_hash)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{RequestContext, Verdict};
    use std::thread;
    use tempfile::tempdir;

    fn product(id: &str) -> Product {
        Product {
            product_id: id.to_string(),
            name: "Amoxicillin 500mg".to_string(),
            manufacturer: "Acme Pharma".to_string(),
            batch_number: "B-2291".to_string(),
            manufacture_date: NaiveDate::from_ymd_opt(2026, 1, 10).unwrap(),
            expiry_date: NaiveDate::from_ymd_opt(2028, 1, 10).unwrap(),
            description: None,
        }
    }

    fn record(hash: &str) -> TokenRecord {
        TokenRecord::new(hash.to_string(), "P1".to_string(), "beef".to_string(), 100, 200)
    }

    #[test]
    fn test_basic_token_operations() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteStore::new(temp_dir.path().join("test.db")).unwrap();
        store.register_product(&product("P1")).unwrap();

        store.create_token(&record("h1")).unwrap();
        let retrieved = store.get_token("h1").unwrap();
        assert_eq!(retrieved, record("h1"));

        assert!(matches!(store.create_token(&record("h1")), Err(StoreError::Conflict(_))));
        assert!(matches!(store.get_token("h2"), Err(StoreError::NotFound(_))));

        store.delete_token("h1").unwrap();
        assert!(matches!(store.get_token("h1"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_product_round_trip() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteStore::new(temp_dir.path().join("products.db")).unwrap();

        let mut p = product("P7");
        p.description = Some("Blister pack of 12".to_string());
        store.register_product(&p).unwrap();

        assert_eq!(store.get_product_by_id("P7").unwrap(), Some(p));
        assert_eq!(store.get_product_by_id("P8").unwrap(), None);
    }

    #[test]
    fn test_mark_used_is_conditional() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteStore::new(temp_dir.path().join("used.db")).unwrap();
        store.register_product(&product("P1")).unwrap();
        store.create_token(&record("h1")).unwrap();

        store.mark_used("h1", 150).unwrap();
        assert!(matches!(store.mark_used("h1", 151), Err(StoreError::AlreadyUsed(_))));
        assert!(matches!(store.mark_used("missing", 151), Err(StoreError::NotFound(_))));

        let stored = store.get_token("h1").unwrap();
        assert!(stored.used);
        assert_eq!(stored.used_at, Some(150));
    }

    #[test]
    fn test_concurrent_mark_used_single_winner() {
        let temp_dir = tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(temp_dir.path().join("race.db")).unwrap());
        store.register_product(&product("P1")).unwrap();
        store.create_token(&record("h1")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || store.mark_used("h1", 1_000 + i))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(StoreError::AlreadyUsed(_)))));
    }

    #[test]
    fn test_token_requires_registered_product() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteStore::new(temp_dir.path().join("fk.db")).unwrap();
        assert!(store.create_token(&record("h1")).is_err());
    }

    #[test]
    fn test_verification_log_round_trip() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteStore::new(temp_dir.path().join("logs.db")).unwrap();

        let context = RequestContext {
            ip_address: Some("192.0.2.1".to_string()),
            user_agent: Some("scanner/1.0".to_string()),
            metadata: serde_json::json!({"site": "pharmacy-12", "attempt": 1}),
        };
        let verdict = Verdict {
            reason: VerdictReason::LedgerBindingMissing,
            token_hash: Some("h1".to_string()),
            product_id: Some("P1".to_string()),
            product: None,
        };
        let entry = VerificationLogEntry::from_verdict(&verdict, &context, 777);

        let id = store.append_verification(&entry).unwrap();
        let entries = store.entries_for_product("P1").unwrap();
        assert_eq!(entries.len(), 1);

        let mut expected = entry.clone();
        expected.id = Some(id);
        assert_eq!(entries[0], expected);
        assert_eq!(store.entries_for_token("h1").unwrap().len(), 1);
        assert!(store.entries_for_token("h2").unwrap().is_empty());
    }
}
