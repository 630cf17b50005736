use chrono::{DateTime, Duration, NaiveDate, Utc};
use credits_common::{ConsumeResponse, ConsumeStatus, Plan, ToolUsageView, UsageSnapshot};
use serde::{Deserialize, Serialize};

use crate::period::{first_day_of_next_month, same_month};
use crate::ToolLimits;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsage {
    pub tool_name: String,
    pub daily_limit: Option<u32>,
    pub monthly_limit: Option<u32>,
    pub used_today: u32,
    pub used_this_month: u32,
}

impl ToolUsage {
    pub fn new(tool_name: &str, limits: ToolLimits) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            daily_limit: limits.daily_limit,
            monthly_limit: limits.monthly_limit,
            used_today: 0,
            used_this_month: 0,
        }
    }

    pub fn admits(&self, amount: u32) -> bool {
        let daily_ok = self
            .daily_limit
            .map_or(true, |limit| self.used_today as u64 + amount as u64 <= limit as u64);
        let monthly_ok = self
            .monthly_limit
            .map_or(true, |limit| self.used_this_month as u64 + amount as u64 <= limit as u64);
        daily_ok && monthly_ok
    }
}

/// One ledger row per account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub account_id: String,
    pub email: Option<String>,
    pub subscription_plan: Plan,
    pub daily_allowance: u32,
    pub monthly_allowance: u32,
    // Credits granted for the current monthly period; prorated after an upgrade
    pub monthly_credits: u32,
    pub used_today: u32,
    pub used_this_month: u32,
    pub last_reset_date: NaiveDate,
    pub last_monthly_reset_date: NaiveDate,
    pub next_reset_date: Option<NaiveDate>,
    pub slow_mode_enabled: bool,
    pub tools: Vec<ToolUsage>,

    // Row version for compare-and-set
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new_free(account_id: &str, now: DateTime<Utc>) -> Self {
        let allowance = Plan::Free.allowance();
        let today = now.date_naive();
        Self {
            account_id: account_id.to_string(),
            email: None,
            subscription_plan: Plan::Free,
            daily_allowance: allowance.daily,
            monthly_allowance: allowance.monthly,
            monthly_credits: allowance.monthly,
            used_today: 0,
            used_this_month: 0,
            last_reset_date: today,
            last_monthly_reset_date: today,
            next_reset_date: None,
            slow_mode_enabled: false,
            tools: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Budget left for the current period: daily on the free plan, monthly otherwise.
    pub fn remaining_credits(&self) -> u32 {
        if self.subscription_plan.is_paid() {
            self.monthly_credits.saturating_sub(self.used_this_month)
        } else {
            self.daily_allowance.saturating_sub(self.used_today)
        }
    }

    /// The allowance the remaining budget is measured against.
    pub fn granted_credits(&self) -> u32 {
        if self.subscription_plan.is_paid() {
            self.monthly_credits
        } else {
            self.daily_allowance
        }
    }

    pub fn needs_daily_reset(&self, today: NaiveDate) -> bool {
        today > self.last_reset_date
    }

    pub fn apply_daily_reset(&mut self, today: NaiveDate) -> bool {
        if !self.needs_daily_reset(today) {
            return false;
        }
        self.used_today = 0;
        for tool in &mut self.tools {
            tool.used_today = 0;
        }
        self.last_reset_date = today;
        true
    }

    /// Monthly resets happen on the first UTC day of a month, once per month.
    pub fn needs_monthly_reset(&self, today: NaiveDate) -> bool {
        use chrono::Datelike;
        today.day() == 1
            && today > self.last_monthly_reset_date
            && !same_month(self.last_monthly_reset_date, today)
    }

    pub fn apply_monthly_reset(&mut self, today: NaiveDate) -> bool {
        if !self.needs_monthly_reset(today) {
            return false;
        }
        self.used_this_month = 0;
        for tool in &mut self.tools {
            tool.used_this_month = 0;
        }
        self.monthly_credits = self.monthly_allowance;
        self.slow_mode_enabled = false;
        self.last_monthly_reset_date = today;
        self.next_reset_date = Some(first_day_of_next_month(today));
        true
    }

    /// Lazy reset applied before every read or write. Returns whether anything changed.
    pub fn refresh(&mut self, today: NaiveDate) -> bool {
        let daily = self.apply_daily_reset(today);
        let monthly = self.apply_monthly_reset(today);
        daily || monthly
    }

    pub fn tool(&self, tool_name: &str) -> Option<&ToolUsage> {
        self.tools.iter().find(|t| t.tool_name == tool_name)
    }

    pub(crate) fn tool_mut_or_insert(&mut self, tool_name: &str, limits: ToolLimits) -> &mut ToolUsage {
        let index = match self.tools.iter().position(|t| t.tool_name == tool_name) {
            Some(index) => index,
            None => {
                self.tools.push(ToolUsage::new(tool_name, limits));
                self.tools.len() - 1
            }
        };
        let tool = &mut self.tools[index];
        tool.daily_limit = limits.daily_limit;
        tool.monthly_limit = limits.monthly_limit;
        tool
    }

    /// Switches to `plan` with a fresh monthly period holding `granted` credits.
    pub(crate) fn apply_upgrade(&mut self, plan: Plan, granted: u32, now: DateTime<Utc>) {
        let allowance = plan.allowance();
        self.subscription_plan = plan;
        self.daily_allowance = allowance.daily;
        self.monthly_allowance = allowance.monthly;
        self.monthly_credits = granted;
        self.used_this_month = 0;
        for tool in &mut self.tools {
            tool.used_this_month = 0;
        }
        self.slow_mode_enabled = false;
        self.next_reset_date = Some((now + Duration::days(30)).date_naive());
    }

    pub fn to_snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            account_id: self.account_id.clone(),
            email: self.email.clone(),
            subscription_plan: self.subscription_plan,
            daily_allowance: self.daily_allowance,
            monthly_allowance: self.monthly_allowance,
            monthly_credits: self.monthly_credits,
            used_today: self.used_today,
            used_this_month: self.used_this_month,
            remaining_credits: self.remaining_credits(),
            last_reset_date: self.last_reset_date,
            next_reset_date: self.next_reset_date,
            slow_mode_enabled: self.slow_mode_enabled,
            tools: self
                .tools
                .iter()
                .map(|t| ToolUsageView {
                    tool_name: t.tool_name.clone(),
                    daily_limit: t.daily_limit,
                    monthly_limit: t.monthly_limit,
                    used_today: t.used_today,
                    used_this_month: t.used_this_month,
                })
                .collect(),
        }
    }
}

/// Append-only audit entry written with every applied upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub payment_reference: String,
    pub account_id: String,
    pub plan: Plan,
    pub prorated_credits: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InsufficientCredits,
    ToolLimitReached,
}

impl RejectReason {
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::InsufficientCredits => "insufficient credits",
            RejectReason::ToolLimitReached => "tool limit reached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeResult {
    Success { remaining_credits: u32 },
    /// Charged; the caller should delay the unit of work.
    SlowMode { remaining_credits: u32 },
    Rejected {
        reason: RejectReason,
        remaining_credits: u32,
    },
}

impl ConsumeResult {
    pub fn can_use(&self) -> bool {
        !matches!(self, ConsumeResult::Rejected { .. })
    }

    pub fn remaining_credits(&self) -> u32 {
        match *self {
            ConsumeResult::Success { remaining_credits }
            | ConsumeResult::SlowMode { remaining_credits }
            | ConsumeResult::Rejected {
                remaining_credits, ..
            } => remaining_credits,
        }
    }
}

impl From<ConsumeResult> for ConsumeResponse {
    fn from(result: ConsumeResult) -> Self {
        match result {
            ConsumeResult::Success { remaining_credits } => ConsumeResponse {
                status: ConsumeStatus::Success,
                can_use: true,
                message: None,
                remaining_credits: Some(remaining_credits),
            },
            ConsumeResult::SlowMode { remaining_credits } => ConsumeResponse {
                status: ConsumeStatus::SlowMode,
                can_use: true,
                message: Some("slow mode enabled, requests are throttled".to_string()),
                remaining_credits: Some(remaining_credits),
            },
            ConsumeResult::Rejected {
                reason,
                remaining_credits,
            } => ConsumeResponse {
                status: ConsumeStatus::Error,
                can_use: false,
                message: Some(reason.message().to_string()),
                remaining_credits: Some(remaining_credits),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeRejection {
    NotAPaidPlan,
    Downgrade { current: Plan },
    ReferenceOwnedByOtherAccount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Applied { prorated_credits: u32 },
    /// The payment reference was already applied to this account.
    AlreadyApplied,
    Rejected(UpgradeRejection),
}

impl UpgradeOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, UpgradeOutcome::Rejected(_))
    }
}
