//! Per-model quota accounting within the rolling window
//!
//! The accountant never talks to the network on the hot path: it reads the
//! window row, applies the configured safety margin, and answers admission
//! questions. Operator corrections and the optional upstream sync both land
//! as corrections on the same window row.

use crate::config::QuotaConfig;
use crate::errors::{MagpieError, Result};
use crate::store::Store;
use crate::task::ModelTier;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Remaining messages per tier as reported by an upstream source
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RemainingSnapshot {
    pub opus: u32,
    pub sonnet: u32,
    pub haiku: u32,
}

impl RemainingSnapshot {
    pub fn for_tier(&self, tier: ModelTier) -> u32 {
        match tier {
            ModelTier::Opus => self.opus,
            ModelTier::Sonnet => self.sonnet,
            ModelTier::Haiku => self.haiku,
        }
    }
}

/// Tracks consumption against the configured limits and safety margin
pub struct QuotaAccountant {
    config: QuotaConfig,
}

impl QuotaAccountant {
    pub fn new(config: QuotaConfig) -> Self {
        Self { config }
    }

    /// Messages the daemon may still dispatch on this tier
    ///
    /// The safety margin reserves a slice of each limit for interactive use:
    /// `max(0, floor(limit * (1 - margin)) - consumed)`.
    pub fn remaining(&self, store: &Store, tier: ModelTier) -> Result<u32> {
        let window = store.get_quota_window()?;
        let effective = self.effective_limit(tier);
        Ok(effective.saturating_sub(window.consumed(tier)))
    }

    /// Whether one more dispatch fits on this tier
    pub fn admits(&self, store: &Store, tier: ModelTier) -> Result<bool> {
        Ok(self.remaining(store, tier)? >= 1)
    }

    /// Record consumption after a successful dispatch decision
    pub fn consume(&self, store: &Store, tier: ModelTier, n: u32) -> Result<()> {
        store.record_quota_consumption(tier, n)?;
        debug!(model = %tier, n, "Consumed quota");
        Ok(())
    }

    /// Undo a decrement when the dispatch never happened
    pub fn refund(&self, store: &Store, tier: ModelTier, n: u32) -> Result<()> {
        store.refund_quota(tier, n)?;
        info!(model = %tier, n, "Refunded quota");
        Ok(())
    }

    /// Operator correction: set consumed so that `remaining` matches
    pub fn correct(&self, store: &Store, tier: ModelTier, remaining_messages: u32) -> Result<()> {
        let consumed = self
            .effective_limit(tier)
            .saturating_sub(remaining_messages);
        store.set_quota_consumed(tier, consumed, remaining_messages, "operator")
    }

    /// Apply an upstream snapshot as authoritative corrections
    pub fn apply_upstream_snapshot(&self, store: &Store, snap: &RemainingSnapshot) -> Result<()> {
        for tier in ModelTier::ALL {
            let remaining = snap.for_tier(tier);
            let consumed = self.effective_limit(tier).saturating_sub(remaining);
            store.set_quota_consumed(tier, consumed, remaining, "upstream")?;
        }
        Ok(())
    }

    /// Roll the window when its length has elapsed; returns true on roll
    pub fn roll_if_due(&self, store: &Store, now: DateTime<Utc>) -> Result<bool> {
        store.roll_quota_window_if_due(now, self.config.window_hours)
    }

    /// Hours left before the current window rolls
    pub fn hours_until_roll(&self, store: &Store, now: DateTime<Utc>) -> Result<f64> {
        let window = store.get_quota_window()?;
        let length = chrono::Duration::hours(i64::from(self.config.window_hours));
        let left = (window.window_started_at + length) - now;
        Ok((left.num_seconds().max(0) as f64) / 3600.0)
    }

    /// Limit after the safety margin is carved out
    pub fn effective_limit(&self, tier: ModelTier) -> u32 {
        let raw = f64::from(self.config.limits.for_tier(tier));
        (raw * (1.0 - self.config.safety_margin)).floor().max(0.0) as u32
    }

    pub fn configured_limit(&self, tier: ModelTier) -> u32 {
        self.config.limits.for_tier(tier)
    }
}

/// HTTP client for the optional upstream quota endpoint
///
/// Expects a JSON body of remaining messages per tier:
/// `{"opus": 12, "sonnet": 140, "haiku": 800}`.
pub struct HttpQuotaUpstream {
    url: String,
    client: reqwest::Client,
}

impl HttpQuotaUpstream {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MagpieError::UpstreamSync(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub async fn fetch(&self) -> Result<RemainingSnapshot> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| MagpieError::UpstreamSync(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MagpieError::UpstreamSync(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }
        response
            .json::<RemainingSnapshot>()
            .await
            .map_err(|e| MagpieError::UpstreamSync(format!("bad response body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaLimits;

    fn accountant(margin: f64) -> QuotaAccountant {
        QuotaAccountant::new(QuotaConfig {
            window_hours: 5,
            safety_margin: margin,
            limits: QuotaLimits {
                opus: 45,
                sonnet: 225,
                haiku: 900,
            },
            sync_url: None,
        })
    }

    #[test]
    fn test_effective_limit_floors() {
        let quota = accountant(0.15);
        // 225 * 0.85 = 191.25 -> 191
        assert_eq!(quota.effective_limit(ModelTier::Sonnet), 191);
        assert_eq!(quota.effective_limit(ModelTier::Opus), 38);
    }

    #[test]
    fn test_remaining_and_admits() {
        let store = Store::open_in_memory().unwrap();
        let quota = accountant(0.15);

        assert_eq!(quota.remaining(&store, ModelTier::Sonnet).unwrap(), 191);
        quota.consume(&store, ModelTier::Sonnet, 190).unwrap();
        assert_eq!(quota.remaining(&store, ModelTier::Sonnet).unwrap(), 1);
        assert!(quota.admits(&store, ModelTier::Sonnet).unwrap());

        quota.consume(&store, ModelTier::Sonnet, 1).unwrap();
        assert_eq!(quota.remaining(&store, ModelTier::Sonnet).unwrap(), 0);
        assert!(!quota.admits(&store, ModelTier::Sonnet).unwrap());

        // Safety margin invariant: the refused dispatch would have crossed it
        let window = store.get_quota_window().unwrap();
        let limit = f64::from(quota.configured_limit(ModelTier::Sonnet));
        assert!(f64::from(window.consumed(ModelTier::Sonnet) + 1) > limit * 0.85);
    }

    #[test]
    fn test_consume_refund_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let quota = accountant(0.0);

        quota.consume(&store, ModelTier::Haiku, 1).unwrap();
        assert_eq!(quota.remaining(&store, ModelTier::Haiku).unwrap(), 899);
        quota.refund(&store, ModelTier::Haiku, 1).unwrap();
        assert_eq!(quota.remaining(&store, ModelTier::Haiku).unwrap(), 900);
    }

    #[test]
    fn test_correct_sets_remaining() {
        let store = Store::open_in_memory().unwrap();
        let quota = accountant(0.15);

        quota.correct(&store, ModelTier::Opus, 10).unwrap();
        assert_eq!(quota.remaining(&store, ModelTier::Opus).unwrap(), 10);

        // Correcting above the effective limit clamps consumed to zero
        quota.correct(&store, ModelTier::Opus, 999).unwrap();
        assert_eq!(quota.remaining(&store, ModelTier::Opus).unwrap(), 38);
    }

    #[test]
    fn test_upstream_snapshot_applies_all_tiers() {
        let store = Store::open_in_memory().unwrap();
        let quota = accountant(0.15);

        let snap = RemainingSnapshot {
            opus: 5,
            sonnet: 100,
            haiku: 700,
        };
        quota.apply_upstream_snapshot(&store, &snap).unwrap();

        assert_eq!(quota.remaining(&store, ModelTier::Opus).unwrap(), 5);
        assert_eq!(quota.remaining(&store, ModelTier::Sonnet).unwrap(), 100);
        assert_eq!(quota.remaining(&store, ModelTier::Haiku).unwrap(), 700);

        let history = store.list_quota_corrections(10).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|c| c.origin == "upstream"));
    }

    #[test]
    fn test_monotonic_until_roll() {
        let store = Store::open_in_memory().unwrap();
        let quota = accountant(0.0);

        let mut last = 0;
        for _ in 0..5 {
            quota.consume(&store, ModelTier::Sonnet, 1).unwrap();
            let consumed = store.get_quota_window().unwrap().consumed(ModelTier::Sonnet);
            assert!(consumed > last);
            last = consumed;
        }

        let window = store.get_quota_window().unwrap();
        let rolled = quota
            .roll_if_due(&store, window.window_started_at + chrono::Duration::hours(5))
            .unwrap();
        assert!(rolled);
        assert_eq!(
            store.get_quota_window().unwrap().consumed(ModelTier::Sonnet),
            0
        );
    }
}
