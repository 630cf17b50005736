// Wire schema shared by the ledger, the gateway server and its clients

use std::fmt::Display;
use std::str::FromStr;

use chrono::NaiveDate;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown plan: {0}")]
pub struct UnknownPlan(pub String);

/// Subscription tier of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,     // 60 credits per day
    Basic,    // 3400 credits per month
    Advanced, // 8000 credits per month
    Pro,      // 18000 credits per month
}

impl Plan {
    pub fn allowance(&self) -> PlanAllowance {
        match self {
            Plan::Free => PlanAllowance {
                daily: 60,
                monthly: 0,
            },
            Plan::Basic => PlanAllowance {
                daily: 0,
                monthly: 3400,
            },
            Plan::Advanced => PlanAllowance {
                daily: 0,
                monthly: 8000,
            },
            Plan::Pro => PlanAllowance {
                daily: 0,
                monthly: 18000,
            },
        }
    }

    /// Paid plans are budgeted monthly, the free plan daily.
    pub fn is_paid(&self) -> bool {
        !matches!(self, Plan::Free)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Basic => "basic",
            Plan::Advanced => "advanced",
            Plan::Pro => "pro",
        }
    }
}

impl Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = UnknownPlan;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "basic" => Ok(Plan::Basic),
            "advanced" => Ok(Plan::Advanced),
            "pro" => Ok(Plan::Pro),
            other => Err(UnknownPlan(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanAllowance {
    pub daily: u32,
    pub monthly: u32,
}

// Usage snapshot

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUsageView {
    pub tool_name: String,
    pub daily_limit: Option<u32>,
    pub monthly_limit: Option<u32>,
    pub used_today: u32,
    pub used_this_month: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub subscription_plan: Plan,
    pub daily_allowance: u32,
    pub monthly_allowance: u32,
    pub monthly_credits: u32,
    pub used_today: u32,
    pub used_this_month: u32,
    pub remaining_credits: u32,
    pub last_reset_date: NaiveDate,
    pub next_reset_date: Option<NaiveDate>,
    pub slow_mode_enabled: bool,
    pub tools: Vec<ToolUsageView>,
}

// Requests

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUsageRequest {
    pub account_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

fn default_amount() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeCreditsRequest {
    pub account_id: String,
    pub tool_name: String,
    // Signed so that zero and negative amounts reach validation instead of
    // failing deserialization.
    #[serde(default = "default_amount")]
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePlanRequest {
    pub account_id: String,
    pub plan: String,
    pub payment_reference: String,
}

/// Every ledger operation as one tagged union, dispatched by `op`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerRequest {
    GetUsage(GetUsageRequest),
    ConsumeCredits(ConsumeCreditsRequest),
    UpgradePlan(UpgradePlanRequest),
    ResetDaily,
    ResetMonthly,
}

impl LedgerRequest {
    /// Operations reserved for the payment callback and the scheduler.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            LedgerRequest::UpgradePlan(_) | LedgerRequest::ResetDaily | LedgerRequest::ResetMonthly
        )
    }
}

// Responses

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeStatus {
    Success,
    SlowMode,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub status: ConsumeStatus,
    pub can_use: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_credits: Option<u32>,
}

impl ConsumeResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ConsumeStatus::Error,
            can_use: false,
            message: Some(message.into()),
            remaining_credits: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradePlanResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetJob {
    Daily,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetSummary {
    pub job: ResetJob,
    /// Rows the job changed. Monthly resets count paid-plan accounts only.
    pub affected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LedgerResponse {
    Usage(UsageSnapshot),
    Consume(ConsumeResponse),
    Upgrade(UpgradePlanResponse),
    Reset(ResetSummary),
}
