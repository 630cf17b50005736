// Credits Ledger - per-account metering, periodic resets and plan upgrades
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

mod clock;
mod ledger;
mod period;
mod scheduler;
#[cfg(feature = "sqlite")]
mod sqlite;
mod storage;
mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use credits_common::Plan;
pub use ledger::CreditsLedger;
pub use period::{days_in_month, first_day_of_next_month, prorated_credits, remaining_days_in_month};
pub use scheduler::{duration_until_next_midnight, ResetScheduler};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
pub use storage::{InMemoryStorage, LedgerStorage, SwapOutcome, UpgradeCommit};
pub use types::*;

// Error Types
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Whether the caller should treat the operation as not applied and retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Storage(_) | LedgerError::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

// Policy

/// Optional per-tool sub-limits layered on top of the account-wide allowance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolLimits {
    #[serde(default)]
    pub daily_limit: Option<u32>,
    #[serde(default)]
    pub monthly_limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerPolicy {
    /// Paid accounts switch to slow mode once remaining credits drop below
    /// this share of the period's grant.
    pub slow_mode_threshold_percent: u8,
    /// Upper bound on re-evaluations after a stale compare-and-set.
    pub max_commit_attempts: usize,
    pub tool_limits: HashMap<String, ToolLimits>,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            slow_mode_threshold_percent: 10,
            max_commit_attempts: 64,
            tool_limits: HashMap::new(),
        }
    }
}

impl LedgerPolicy {
    pub fn limits_for(&self, tool_name: &str) -> ToolLimits {
        self.tool_limits.get(tool_name).copied().unwrap_or_default()
    }

    /// True when `remaining` is below the low-water mark of `granted`.
    pub fn below_low_water(&self, remaining: u32, granted: u32) -> bool {
        (remaining as u64) * 100 < (granted as u64) * self.slow_mode_threshold_percent as u64
    }
}
