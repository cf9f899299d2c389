//! Model tier selection: difficulty, upgrades, downgrades
//!
//! Difficulty keywords pick a base tier; the upgrade rules spend surplus
//! quota on a better model when the window is about to roll or a long idle
//! stretch is predicted; downgrades walk down the ladder when the chosen
//! tier is not admitted. When even haiku is refused the task waits.

use crate::errors::Result;
use crate::quota::QuotaAccountant;
use crate::store::Store;
use crate::task::{ModelTier, RequestedModel};
use tracing::{debug, info};

/// Upgrade rule (a): this close to the window roll, surplus quota is wasted
const UPGRADE_WINDOW_HOURS_LEFT: f64 = 1.5;
const UPGRADE_WINDOW_HEADROOM: f64 = 0.30;

/// Upgrade rule (b): a long predicted idle stretch justifies a better model
const UPGRADE_IDLE_MINUTES: i64 = 6 * 60;
const UPGRADE_IDLE_HEADROOM: f64 = 0.40;

/// How far past the selected tier the downgrade walk may go
const MAX_DOWNGRADE_STEPS: usize = 2;

const COMPLEX_KEYWORDS: &[&str] = &[
    "security",
    "vulnerability",
    "architecture",
    "migration",
    "performance",
];

const SIMPLE_KEYWORDS: &[&str] = &[
    "docs", "lint", "format", "typo", "clean", "dead code", "changelog",
];

/// Task difficulty classification driving the default tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Difficulty {
    Simple,
    Medium,
    Complex,
}

impl Difficulty {
    pub fn base_tier(self) -> ModelTier {
        match self {
            Self::Simple => ModelTier::Haiku,
            Self::Medium => ModelTier::Sonnet,
            Self::Complex => ModelTier::Opus,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
        }
    }
}

/// Classify by keyword; complex keywords win over simple ones
pub fn classify(title: &str, description: Option<&str>) -> Difficulty {
    let haystack = match description {
        Some(desc) => format!("{title} {desc}").to_lowercase(),
        None => title.to_lowercase(),
    };
    if COMPLEX_KEYWORDS.iter().any(|kw| haystack.contains(kw)) {
        Difficulty::Complex
    } else if SIMPLE_KEYWORDS.iter().any(|kw| haystack.contains(kw)) {
        Difficulty::Simple
    } else {
        Difficulty::Medium
    }
}

/// Window/prediction facts the policy weighs for upgrades
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext {
    /// Hours until the quota window rolls
    pub hours_until_roll: f64,
    /// Longest predicted idle run within the next 8 hours, minutes
    pub predicted_idle_minutes: i64,
}

pub struct ModelPolicy;

impl ModelPolicy {
    /// Pick the tier for a dispatch, or `None` when nothing is admitted
    pub fn select(
        store: &Store,
        quota: &QuotaAccountant,
        requested: RequestedModel,
        difficulty: Difficulty,
        ctx: SelectionContext,
    ) -> Result<Option<ModelTier>> {
        let (mut tier, upgradable) = match requested {
            RequestedModel::Fixed(tier) => (tier, false),
            RequestedModel::Auto => (difficulty.base_tier(), true),
        };

        if upgradable {
            if let Some(upgraded) = tier.upgraded() {
                if Self::should_upgrade(store, quota, tier, ctx)? {
                    info!(from = %tier, to = %upgraded, "Upgrading model tier");
                    tier = upgraded;
                }
            }
        }

        // Downgrade walk: the selected tier, then up to two steps down
        let mut candidate = Some(tier);
        for _ in 0..=MAX_DOWNGRADE_STEPS {
            let Some(current) = candidate else { break };
            if quota.admits(store, current)? {
                if current != tier {
                    info!(from = %tier, to = %current, "Downgraded model tier");
                }
                return Ok(Some(current));
            }
            debug!(model = %current, "Tier not admitted, stepping down");
            candidate = current.downgraded();
        }

        Ok(None)
    }

    fn should_upgrade(
        store: &Store,
        quota: &QuotaAccountant,
        tier: ModelTier,
        ctx: SelectionContext,
    ) -> Result<bool> {
        let headroom = Self::remaining_fraction(store, quota, tier)?;

        if ctx.hours_until_roll < UPGRADE_WINDOW_HOURS_LEFT && headroom >= UPGRADE_WINDOW_HEADROOM {
            return Ok(true);
        }
        if ctx.predicted_idle_minutes >= UPGRADE_IDLE_MINUTES && headroom >= UPGRADE_IDLE_HEADROOM {
            return Ok(true);
        }
        Ok(false)
    }

    /// Remaining quota as a fraction of the tier's effective limit
    fn remaining_fraction(
        store: &Store,
        quota: &QuotaAccountant,
        tier: ModelTier,
    ) -> Result<f64> {
        let limit = quota.effective_limit(tier);
        if limit == 0 {
            return Ok(0.0);
        }
        Ok(f64::from(quota.remaining(store, tier)?) / f64::from(limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QuotaConfig, QuotaLimits};

    fn setup() -> (Store, QuotaAccountant) {
        let store = Store::open_in_memory().unwrap();
        let quota = QuotaAccountant::new(QuotaConfig {
            window_hours: 5,
            safety_margin: 0.0,
            limits: QuotaLimits {
                opus: 100,
                sonnet: 100,
                haiku: 100,
            },
            sync_url: None,
        });
        (store, quota)
    }

    fn quiet_ctx() -> SelectionContext {
        SelectionContext {
            hours_until_roll: 4.0,
            predicted_idle_minutes: 0,
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify("Fix login bug", None), Difficulty::Medium);
        assert_eq!(classify("Patch security hole", None), Difficulty::Complex);
        assert_eq!(
            classify("Update docs", Some("regenerate API reference")),
            Difficulty::Simple
        );
        assert_eq!(
            classify("Database migration plan", None),
            Difficulty::Complex
        );
        // Complex keywords win when both appear
        assert_eq!(
            classify("Performance docs", None),
            Difficulty::Complex
        );
        assert_eq!(classify("Remove dead code", None), Difficulty::Simple);
    }

    #[test]
    fn test_base_mapping() {
        assert_eq!(Difficulty::Simple.base_tier(), ModelTier::Haiku);
        assert_eq!(Difficulty::Medium.base_tier(), ModelTier::Sonnet);
        assert_eq!(Difficulty::Complex.base_tier(), ModelTier::Opus);
    }

    #[test]
    fn test_plain_selection() {
        let (store, quota) = setup();
        let tier = ModelPolicy::select(
            &store,
            &quota,
            RequestedModel::Auto,
            Difficulty::Medium,
            quiet_ctx(),
        )
        .unwrap();
        assert_eq!(tier, Some(ModelTier::Sonnet));
    }

    #[test]
    fn test_upgrade_for_window_headroom() {
        let (store, quota) = setup();
        // Window nearly over, sonnet half unused: spend it on opus
        let ctx = SelectionContext {
            hours_until_roll: 1.0,
            predicted_idle_minutes: 0,
        };
        let tier = ModelPolicy::select(
            &store,
            &quota,
            RequestedModel::Auto,
            Difficulty::Medium,
            ctx,
        )
        .unwrap();
        assert_eq!(tier, Some(ModelTier::Opus));
    }

    #[test]
    fn test_no_upgrade_without_headroom() {
        let (store, quota) = setup();
        // 75 of 100 consumed: 25% remaining is under the 30% bar
        quota.consume(&store, ModelTier::Sonnet, 75).unwrap();
        let ctx = SelectionContext {
            hours_until_roll: 1.0,
            predicted_idle_minutes: 0,
        };
        let tier = ModelPolicy::select(
            &store,
            &quota,
            RequestedModel::Auto,
            Difficulty::Medium,
            ctx,
        )
        .unwrap();
        assert_eq!(tier, Some(ModelTier::Sonnet));
    }

    #[test]
    fn test_upgrade_for_predicted_idle() {
        let (store, quota) = setup();
        let ctx = SelectionContext {
            hours_until_roll: 4.0,
            predicted_idle_minutes: 6 * 60,
        };
        let tier = ModelPolicy::select(
            &store,
            &quota,
            RequestedModel::Auto,
            Difficulty::Simple,
            ctx,
        )
        .unwrap();
        assert_eq!(tier, Some(ModelTier::Sonnet));
    }

    #[test]
    fn test_downgrade_when_not_admitted() {
        let (store, quota) = setup();
        quota.consume(&store, ModelTier::Sonnet, 100).unwrap();
        let tier = ModelPolicy::select(
            &store,
            &quota,
            RequestedModel::Auto,
            Difficulty::Medium,
            quiet_ctx(),
        )
        .unwrap();
        assert_eq!(tier, Some(ModelTier::Haiku));
    }

    #[test]
    fn test_two_step_downgrade() {
        let (store, quota) = setup();
        quota.consume(&store, ModelTier::Opus, 100).unwrap();
        quota.consume(&store, ModelTier::Sonnet, 100).unwrap();
        let tier = ModelPolicy::select(
            &store,
            &quota,
            RequestedModel::Auto,
            Difficulty::Complex,
            quiet_ctx(),
        )
        .unwrap();
        assert_eq!(tier, Some(ModelTier::Haiku));
    }

    #[test]
    fn test_everything_exhausted_selects_nothing() {
        let (store, quota) = setup();
        for tier in ModelTier::ALL {
            quota.consume(&store, tier, 100).unwrap();
        }
        let tier = ModelPolicy::select(
            &store,
            &quota,
            RequestedModel::Auto,
            Difficulty::Medium,
            quiet_ctx(),
        )
        .unwrap();
        assert_eq!(tier, None);
    }

    #[test]
    fn test_forced_model_skips_upgrade_but_downgrades() {
        let (store, quota) = setup();
        let ctx = SelectionContext {
            hours_until_roll: 1.0,
            predicted_idle_minutes: 8 * 60,
        };

        // Forced sonnet never upgrades, even with headroom and idle time
        let tier = ModelPolicy::select(
            &store,
            &quota,
            RequestedModel::Fixed(ModelTier::Sonnet),
            Difficulty::Medium,
            ctx,
        )
        .unwrap();
        assert_eq!(tier, Some(ModelTier::Sonnet));

        // But it still downgrades when sonnet is exhausted
        quota.consume(&store, ModelTier::Sonnet, 100).unwrap();
        let tier = ModelPolicy::select(
            &store,
            &quota,
            RequestedModel::Fixed(ModelTier::Sonnet),
            Difficulty::Medium,
            ctx,
        )
        .unwrap();
        assert_eq!(tier, Some(ModelTier::Haiku));
    }
}
