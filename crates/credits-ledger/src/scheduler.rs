use crate::{CreditsLedger, Result};
use chrono::{DateTime, Utc};
use credits_common::ResetSummary;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Time left until the next UTC midnight after `now`.
pub fn duration_until_next_midnight(now: DateTime<Utc>) -> Duration {
    let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
    let midnight = tomorrow.and_time(chrono::NaiveTime::MIN).and_utc();
    (midnight - now).to_std().unwrap_or(Duration::ZERO)
}

/// In-process fallback for the external cron trigger: runs the daily and
/// monthly resets right after every UTC midnight.
pub struct ResetScheduler {
    ledger: Arc<CreditsLedger>,
}

impl ResetScheduler {
    pub fn new(ledger: Arc<CreditsLedger>) -> Self {
        Self { ledger }
    }

    /// Runs both jobs once. The monthly job is a no-op outside the first day.
    pub async fn run_once(&self) -> Result<(ResetSummary, ResetSummary)> {
        let daily = self.ledger.reset_daily().await?;
        let monthly = self.ledger.reset_monthly().await?;
        Ok((daily, monthly))
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let clock = self.ledger.clock();
            loop {
                let wait = duration_until_next_midnight(clock.now());
                info!(wait_secs = wait.as_secs(), "next scheduled reset");
                // A second of slack so the clock has crossed into the new day
                tokio::time::sleep(wait + Duration::from_secs(1)).await;

                match self.run_once().await {
                    Ok((daily, monthly)) => info!(
                        daily = daily.affected,
                        monthly = monthly.affected,
                        "scheduled reset finished"
                    ),
                    Err(e) => error!("scheduled reset failed: {}", e),
                }
            }
        })
    }
}
