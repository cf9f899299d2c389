//! USD budget accounting per UTC day
//!
//! Quota limits how often the daemon may speak; the budget caps what it may
//! spend. Admission checks the per-task cap and the daily cap together, and
//! actual costs are recorded against the dispatch day.

use crate::config::BudgetConfig;
use crate::errors::Result;
use crate::store::Store;
use chrono::{DateTime, Utc};
use tracing::debug;

pub struct BudgetAccountant {
    config: BudgetConfig,
}

impl BudgetAccountant {
    pub fn new(config: BudgetConfig) -> Self {
        Self { config }
    }

    /// Whether a task with this estimated cost may be dispatched today
    pub fn admits_task(&self, store: &Store, now: DateTime<Utc>, est_usd: f64) -> Result<bool> {
        if est_usd > self.config.max_task_usd {
            debug!(est_usd, cap = self.config.max_task_usd, "Task over per-task budget");
            return Ok(false);
        }
        let spent = self.daily_spent(store, now)?;
        Ok(spent + est_usd <= self.config.max_daily_usd)
    }

    /// Record what a finished task actually cost
    pub fn record(&self, store: &Store, now: DateTime<Utc>, actual_usd: f64) -> Result<()> {
        store.record_spend(&day_key(now), actual_usd)
    }

    pub fn daily_spent(&self, store: &Store, now: DateTime<Utc>) -> Result<f64> {
        store.daily_spend(&day_key(now))
    }

    pub fn max_daily_usd(&self) -> f64 {
        self.config.max_daily_usd
    }
}

/// UTC calendar-day key used by the budget table
fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn accountant() -> BudgetAccountant {
        BudgetAccountant::new(BudgetConfig {
            max_task_usd: 2.0,
            max_daily_usd: 10.0,
        })
    }

    #[test]
    fn test_per_task_cap() {
        let store = Store::open_in_memory().unwrap();
        let budget = accountant();
        let now = Utc::now();

        assert!(budget.admits_task(&store, now, 1.5).unwrap());
        assert!(!budget.admits_task(&store, now, 2.5).unwrap());
    }

    #[test]
    fn test_daily_cap() {
        let store = Store::open_in_memory().unwrap();
        let budget = accountant();
        let now = Utc::now();

        budget.record(&store, now, 9.5).unwrap();
        assert!(budget.admits_task(&store, now, 0.5).unwrap());
        assert!(!budget.admits_task(&store, now, 0.6).unwrap());
    }

    #[test]
    fn test_days_are_independent() {
        let store = Store::open_in_memory().unwrap();
        let budget = accountant();

        let yesterday = Utc.with_ymd_and_hms(2026, 7, 31, 23, 0, 0).unwrap();
        let today = Utc.with_ymd_and_hms(2026, 8, 1, 1, 0, 0).unwrap();

        budget.record(&store, yesterday, 10.0).unwrap();
        assert!(!budget.admits_task(&store, yesterday, 0.1).unwrap());
        assert!(budget.admits_task(&store, today, 2.0).unwrap());
    }
}
