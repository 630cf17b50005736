use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    LedgerError, LedgerStorage, PaymentRecord, Result, SwapOutcome, UpgradeCommit, UsageRecord,
};

const SCHEMA_VERSION: i64 = 1;

fn storage_err(e: rusqlite::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

/// SQLite-backed ledger. Rows are stored as JSON bodies next to an explicit
/// `version` column that the conditional updates match on.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LedgerError::Storage(format!("create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .map_err(storage_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(storage_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        let version: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(storage_err)?;
        if version > SCHEMA_VERSION {
            return Err(LedgerError::Storage(format!(
                "database schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS usage_records (
                 account_id TEXT PRIMARY KEY,
                 version    INTEGER NOT NULL,
                 body       TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS payments (
                 payment_reference TEXT PRIMARY KEY,
                 account_id        TEXT NOT NULL,
                 body              TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_payments_account_id
                 ON payments(account_id);

             PRAGMA user_version = {SCHEMA_VERSION};"
        ))
        .map_err(storage_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| LedgerError::Storage("sqlite connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| LedgerError::Storage(format!("sqlite task failed: {e}")))?
    }
}

fn decode_record(body: String, version: i64) -> Result<UsageRecord> {
    let mut record: UsageRecord = serde_json::from_str(&body)?;
    record.version = version as u64;
    Ok(record)
}

fn swap(conn: &Connection, record: &UsageRecord) -> Result<SwapOutcome> {
    let mut next = record.clone();
    next.version += 1;
    let changed = conn
        .execute(
            "UPDATE usage_records SET version = ?1, body = ?2
              WHERE account_id = ?3 AND version = ?4",
            params![
                next.version as i64,
                serde_json::to_string(&next)?,
                record.account_id,
                record.version as i64
            ],
        )
        .map_err(storage_err)?;
    Ok(if changed == 1 {
        SwapOutcome::Committed
    } else {
        SwapOutcome::Stale
    })
}

#[async_trait]
impl LedgerStorage for SqliteStorage {
    async fn load(&self, account_id: &str) -> Result<Option<UsageRecord>> {
        let account_id = account_id.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT body, version FROM usage_records WHERE account_id = ?1",
                    params![account_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(storage_err)?;
            row.map(|(body, version)| decode_record(body, version))
                .transpose()
        })
        .await
    }

    async fn insert(&self, record: &UsageRecord) -> Result<bool> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO usage_records (account_id, version, body)
                     VALUES (?1, ?2, ?3)",
                    params![
                        record.account_id,
                        record.version as i64,
                        serde_json::to_string(&record)?
                    ],
                )
                .map_err(storage_err)?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn compare_and_swap(&self, record: &UsageRecord) -> Result<SwapOutcome> {
        let record = record.clone();
        self.with_conn(move |conn| swap(conn, &record)).await
    }

    async fn commit_upgrade(
        &self,
        record: &UsageRecord,
        payment: &PaymentRecord,
    ) -> Result<UpgradeCommit> {
        let record = record.clone();
        let payment = payment.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(storage_err)?;

            let exists = tx
                .query_row(
                    "SELECT 1 FROM payments WHERE payment_reference = ?1",
                    params![payment.payment_reference],
                    |_| Ok(()),
                )
                .optional()
                .map_err(storage_err)?
                .is_some();
            if exists {
                return Ok(UpgradeCommit::DuplicatePayment);
            }

            if swap(&tx, &record)? == SwapOutcome::Stale {
                return Ok(UpgradeCommit::Stale);
            }

            tx.execute(
                "INSERT INTO payments (payment_reference, account_id, body) VALUES (?1, ?2, ?3)",
                params![
                    payment.payment_reference,
                    payment.account_id,
                    serde_json::to_string(&payment)?
                ],
            )
            .map_err(storage_err)?;

            tx.commit().map_err(storage_err)?;
            Ok(UpgradeCommit::Committed)
        })
        .await
    }

    async fn find_payment(&self, payment_reference: &str) -> Result<Option<PaymentRecord>> {
        let payment_reference = payment_reference.to_string();
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM payments WHERE payment_reference = ?1",
                    params![payment_reference],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
        })
        .await
    }

    async fn payments_for(&self, account_id: &str) -> Result<Vec<PaymentRecord>> {
        let account_id = account_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT body FROM payments WHERE account_id = ?1 ORDER BY rowid")
                .map_err(storage_err)?;
            let bodies = stmt
                .query_map(params![account_id], |row| row.get::<_, String>(0))
                .map_err(storage_err)?
                .collect::<rusqlite::Result<Vec<String>>>()
                .map_err(storage_err)?;
            bodies
                .iter()
                .map(|b| serde_json::from_str(b).map_err(LedgerError::from))
                .collect()
        })
        .await
    }

    async fn account_ids(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT account_id FROM usage_records ORDER BY account_id")
                .map_err(storage_err)?;
            let ids = stmt
                .query_map([], |row| row.get(0))
                .map_err(storage_err)?
                .collect::<rusqlite::Result<Vec<String>>>()
                .map_err(storage_err)?;
            Ok(ids)
        })
        .await
    }
}
