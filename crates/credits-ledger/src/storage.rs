use crate::{PaymentRecord, Result, UsageRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    Committed,
    /// The stored version moved on since the record was loaded.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeCommit {
    Committed,
    Stale,
    DuplicatePayment,
}

/// Persistence for ledger rows and the payment log.
///
/// Writes are conditional on `UsageRecord::version`: a write only lands when
/// the stored version still equals the version the caller loaded, and the
/// stored copy then carries `version + 1`.
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    async fn load(&self, account_id: &str) -> Result<Option<UsageRecord>>;
    /// Inserts a new row. Returns false if the account already exists.
    async fn insert(&self, record: &UsageRecord) -> Result<bool>;
    async fn compare_and_swap(&self, record: &UsageRecord) -> Result<SwapOutcome>;
    /// Swaps the record and appends the payment in one atomic step.
    async fn commit_upgrade(
        &self,
        record: &UsageRecord,
        payment: &PaymentRecord,
    ) -> Result<UpgradeCommit>;
    async fn find_payment(&self, payment_reference: &str) -> Result<Option<PaymentRecord>>;
    async fn payments_for(&self, account_id: &str) -> Result<Vec<PaymentRecord>>;
    async fn account_ids(&self) -> Result<Vec<String>>;
}

#[derive(Default)]
struct Tables {
    records: HashMap<String, UsageRecord>,
    payments: Vec<PaymentRecord>,
    payment_index: HashMap<String, usize>,
}

impl Tables {
    fn swap(&mut self, record: &UsageRecord) -> SwapOutcome {
        match self.records.get_mut(&record.account_id) {
            Some(stored) if stored.version == record.version => {
                let mut next = record.clone();
                next.version += 1;
                *stored = next;
                SwapOutcome::Committed
            }
            _ => SwapOutcome::Stale,
        }
    }
}

// In-memory storage for development and tests. One lock guards both tables so
// upgrades commit atomically.
pub struct InMemoryStorage {
    tables: Arc<RwLock<Tables>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
        }
    }

    /// Seeds or overwrites a row verbatim, bypassing version checks.
    pub async fn put_record(&self, record: UsageRecord) {
        self.tables
            .write()
            .await
            .records
            .insert(record.account_id.clone(), record);
    }
}

#[async_trait]
impl LedgerStorage for InMemoryStorage {
    async fn load(&self, account_id: &str) -> Result<Option<UsageRecord>> {
        Ok(self.tables.read().await.records.get(account_id).cloned())
    }

    async fn insert(&self, record: &UsageRecord) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.records.contains_key(&record.account_id) {
            return Ok(false);
        }
        tables
            .records
            .insert(record.account_id.clone(), record.clone());
        Ok(true)
    }

    async fn compare_and_swap(&self, record: &UsageRecord) -> Result<SwapOutcome> {
        Ok(self.tables.write().await.swap(record))
    }

    async fn commit_upgrade(
        &self,
        record: &UsageRecord,
        payment: &PaymentRecord,
    ) -> Result<UpgradeCommit> {
        let mut tables = self.tables.write().await;
        if tables.payment_index.contains_key(&payment.payment_reference) {
            return Ok(UpgradeCommit::DuplicatePayment);
        }
        if tables.swap(record) == SwapOutcome::Stale {
            return Ok(UpgradeCommit::Stale);
        }
        let position = tables.payments.len();
        tables.payments.push(payment.clone());
        tables
            .payment_index
            .insert(payment.payment_reference.clone(), position);
        Ok(UpgradeCommit::Committed)
    }

    async fn find_payment(&self, payment_reference: &str) -> Result<Option<PaymentRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payment_index
            .get(payment_reference)
            .map(|&i| tables.payments[i].clone()))
    }

    async fn payments_for(&self, account_id: &str) -> Result<Vec<PaymentRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .payments
            .iter()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn account_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.tables.read().await.records.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
