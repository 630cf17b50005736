use crate::{
    prorated_credits, Clock, ConsumeResult, LedgerError, LedgerPolicy, LedgerStorage, PaymentRecord,
    RejectReason, Result, SwapOutcome, SystemClock, ToolUsage, UpgradeCommit, UpgradeOutcome,
    UpgradeRejection, UsageRecord,
};
use chrono::Datelike;
use credits_common::{Plan, ResetJob, ResetSummary};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// The credits ledger. Writers of one account queue on a per-account lock and
/// then commit through `LedgerStorage::compare_and_swap`, so concurrent calls
/// never overdraw. The version check still guards against writers outside this
/// process sharing the same storage.
pub struct CreditsLedger {
    storage: Arc<dyn LedgerStorage>,
    clock: Arc<dyn Clock>,
    policy: LedgerPolicy,
    account_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CreditsLedger {
    pub fn new(storage: Arc<dyn LedgerStorage>) -> Self {
        Self {
            storage,
            clock: Arc::new(SystemClock),
            policy: LedgerPolicy::default(),
            account_locks: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: LedgerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub async fn get_usage(&self, account_id: &str) -> Result<UsageRecord> {
        self.get_usage_for(account_id, None).await
    }

    /// Current snapshot after the lazy daily/monthly reset. Unknown accounts
    /// get a fresh free-tier row.
    pub async fn get_usage_for(&self, account_id: &str, email: Option<&str>) -> Result<UsageRecord> {
        require_non_empty("accountId", account_id)?;
        let _guard = self.lock_account(account_id).await;

        for _ in 0..self.attempts() {
            let mut record = self.load_or_create(account_id).await?;
            let mut changed = record.refresh(self.clock.today());
            if let Some(email) = email.filter(|e| !e.trim().is_empty()) {
                if record.email.as_deref() != Some(email) {
                    record.email = Some(email.to_string());
                    changed = true;
                }
            }
            if !changed {
                return Ok(record);
            }
            if let Some(committed) = self.try_commit(record).await? {
                return Ok(committed);
            }
        }
        Err(self.exhausted(account_id))
    }

    pub async fn consume_credits(
        &self,
        account_id: &str,
        tool_name: &str,
        amount: i64,
    ) -> Result<ConsumeResult> {
        require_non_empty("accountId", account_id)?;
        require_non_empty("toolName", tool_name)?;
        if amount <= 0 {
            return Err(LedgerError::Validation(format!(
                "amount must be a positive integer, got {amount}"
            )));
        }
        let amount = u32::try_from(amount)
            .map_err(|_| LedgerError::Validation(format!("amount {amount} is too large")))?;
        let limits = self.policy.limits_for(tool_name);
        let _guard = self.lock_account(account_id).await;

        for _ in 0..self.attempts() {
            let mut record = self.load_or_create(account_id).await?;
            let reset = record.refresh(self.clock.today());
            let remaining = record.remaining_credits();

            let mut tool = record
                .tool(tool_name)
                .cloned()
                .unwrap_or_else(|| ToolUsage::new(tool_name, limits));
            tool.daily_limit = limits.daily_limit;
            tool.monthly_limit = limits.monthly_limit;

            let rejection = if remaining < amount {
                Some(RejectReason::InsufficientCredits)
            } else if !tool.admits(amount) {
                Some(RejectReason::ToolLimitReached)
            } else {
                None
            };

            if let Some(reason) = rejection {
                // Only the lazy reset is persisted on rejection
                if reset && self.try_commit(record).await?.is_none() {
                    continue;
                }
                debug!(account_id, tool_name, amount, remaining, reason = reason.message(), "consume rejected");
                return Ok(ConsumeResult::Rejected {
                    reason,
                    remaining_credits: remaining,
                });
            }

            record.used_today = record.used_today.saturating_add(amount);
            record.used_this_month = record.used_this_month.saturating_add(amount);
            let entry = record.tool_mut_or_insert(tool_name, limits);
            entry.used_today = entry.used_today.saturating_add(amount);
            entry.used_this_month = entry.used_this_month.saturating_add(amount);

            let remaining_after = record.remaining_credits();
            let slow = record.subscription_plan.is_paid()
                && (record.slow_mode_enabled
                    || self.policy.below_low_water(remaining_after, record.granted_credits()));
            let entering_slow_mode = slow && !record.slow_mode_enabled;
            record.slow_mode_enabled |= slow;

            if self.try_commit(record).await?.is_none() {
                continue;
            }

            if entering_slow_mode {
                info!(account_id, remaining = remaining_after, "account entered slow mode");
            }
            debug!(account_id, tool_name, amount, remaining = remaining_after, "credits consumed");
            return Ok(if slow {
                ConsumeResult::SlowMode {
                    remaining_credits: remaining_after,
                }
            } else {
                ConsumeResult::Success {
                    remaining_credits: remaining_after,
                }
            });
        }
        Err(self.exhausted(account_id))
    }

    /// Applies a paid upgrade with a prorated grant for the rest of the month.
    /// The plan change and the payment log entry commit together, keyed by
    /// `payment_reference`, so replays never grant twice.
    pub async fn upgrade_plan(
        &self,
        account_id: &str,
        plan: Plan,
        payment_reference: &str,
    ) -> Result<UpgradeOutcome> {
        require_non_empty("accountId", account_id)?;
        require_non_empty("paymentReference", payment_reference)?;

        if !plan.is_paid() {
            warn!(account_id, %plan, "upgrade rejected: not a paid plan");
            return Ok(UpgradeOutcome::Rejected(UpgradeRejection::NotAPaidPlan));
        }
        let _guard = self.lock_account(account_id).await;
        if let Some(outcome) = self.replayed_payment(account_id, payment_reference).await? {
            return Ok(outcome);
        }

        for _ in 0..self.attempts() {
            let mut record = self.load_or_create(account_id).await?;
            let now = self.clock.now();
            let today = now.date_naive();
            record.refresh(today);

            let current = record.subscription_plan;
            if plan < current {
                warn!(account_id, %current, requested = %plan, "upgrade rejected: downgrade");
                return Ok(UpgradeOutcome::Rejected(UpgradeRejection::Downgrade { current }));
            }

            let granted = prorated_credits(plan.allowance().monthly, today);
            record.apply_upgrade(plan, granted, now);
            record.updated_at = now;

            let payment = PaymentRecord {
                payment_reference: payment_reference.to_string(),
                account_id: account_id.to_string(),
                plan,
                prorated_credits: granted,
                recorded_at: now,
            };

            match self.storage.commit_upgrade(&record, &payment).await? {
                UpgradeCommit::Committed => {
                    info!(account_id, %plan, granted, payment_reference, "plan upgraded");
                    return Ok(UpgradeOutcome::Applied {
                        prorated_credits: granted,
                    });
                }
                UpgradeCommit::Stale => continue,
                UpgradeCommit::DuplicatePayment => {
                    // A concurrent call committed the same reference first
                    if let Some(outcome) = self.replayed_payment(account_id, payment_reference).await? {
                        return Ok(outcome);
                    }
                }
            }
        }
        Err(self.exhausted(account_id))
    }

    pub async fn payment_history(&self, account_id: &str) -> Result<Vec<PaymentRecord>> {
        require_non_empty("accountId", account_id)?;
        self.storage.payments_for(account_id).await
    }

    /// Clears daily counters on every row whose last reset predates today.
    pub async fn reset_daily(&self) -> Result<ResetSummary> {
        let today = self.clock.today();
        let mut affected = 0;
        for account_id in self.storage.account_ids().await? {
            if self
                .reset_account(&account_id, |record| record.apply_daily_reset(today))
                .await?
                .is_some()
            {
                affected += 1;
            }
        }
        info!(%today, affected, "daily reset complete");
        Ok(ResetSummary {
            job: ResetJob::Daily,
            affected,
        })
    }

    /// Clears monthly counters. Only the first UTC day of a month does anything.
    /// Free accounts have their per-tool counters cleared too, but only paid
    /// accounts count towards `affected`.
    pub async fn reset_monthly(&self) -> Result<ResetSummary> {
        let today = self.clock.today();
        if today.day() != 1 {
            debug!(%today, "monthly reset skipped: not the first day of the month");
            return Ok(ResetSummary {
                job: ResetJob::Monthly,
                affected: 0,
            });
        }

        let mut affected = 0;
        for account_id in self.storage.account_ids().await? {
            let reset = self
                .reset_account(&account_id, |record| record.apply_monthly_reset(today))
                .await?;
            if reset.is_some_and(|record| record.subscription_plan.is_paid()) {
                affected += 1;
            }
        }
        info!(%today, affected, "monthly reset complete");
        Ok(ResetSummary {
            job: ResetJob::Monthly,
            affected,
        })
    }

    /// Applies `reset` to one row. Returns the committed row, or `None` when
    /// the row needed no reset.
    async fn reset_account<F>(&self, account_id: &str, reset: F) -> Result<Option<UsageRecord>>
    where
        F: Fn(&mut UsageRecord) -> bool,
    {
        let _guard = self.lock_account(account_id).await;
        for _ in 0..self.attempts() {
            let Some(mut record) = self.storage.load(account_id).await? else {
                return Ok(None);
            };
            if !reset(&mut record) {
                return Ok(None);
            }
            if let Some(committed) = self.try_commit(record).await? {
                return Ok(Some(committed));
            }
        }
        Err(self.exhausted(account_id))
    }

    async fn replayed_payment(
        &self,
        account_id: &str,
        payment_reference: &str,
    ) -> Result<Option<UpgradeOutcome>> {
        let Some(existing) = self.storage.find_payment(payment_reference).await? else {
            return Ok(None);
        };
        if existing.account_id == account_id {
            info!(account_id, payment_reference, "payment already applied");
            Ok(Some(UpgradeOutcome::AlreadyApplied))
        } else {
            warn!(
                account_id,
                owner = %existing.account_id,
                payment_reference,
                "upgrade rejected: payment reference belongs to another account"
            );
            Ok(Some(UpgradeOutcome::Rejected(
                UpgradeRejection::ReferenceOwnedByOtherAccount,
            )))
        }
    }

    async fn load_or_create(&self, account_id: &str) -> Result<UsageRecord> {
        if let Some(record) = self.storage.load(account_id).await? {
            return Ok(record);
        }
        let record = UsageRecord::new_free(account_id, self.clock.now());
        if self.storage.insert(&record).await? {
            debug!(account_id, "created free-tier usage record");
            return Ok(record);
        }
        // Lost the insert race to a concurrent call
        self.storage.load(account_id).await?.ok_or_else(|| {
            LedgerError::Storage(format!("usage record for {account_id} missing after insert"))
        })
    }

    /// Writes `record` if nobody else did first. `None` means stale.
    async fn try_commit(&self, mut record: UsageRecord) -> Result<Option<UsageRecord>> {
        record.updated_at = self.clock.now();
        match self.storage.compare_and_swap(&record).await? {
            SwapOutcome::Committed => {
                record.version += 1;
                Ok(Some(record))
            }
            SwapOutcome::Stale => Ok(None),
        }
    }

    async fn lock_account(&self, account_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .account_locks
            .entry(account_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    fn attempts(&self) -> usize {
        self.policy.max_commit_attempts.max(1)
    }

    fn exhausted(&self, account_id: &str) -> LedgerError {
        warn!(account_id, attempts = self.attempts(), "gave up after repeated stale commits");
        LedgerError::Conflict(format!(
            "usage record for {account_id} kept changing during the update"
        ))
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(LedgerError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}
