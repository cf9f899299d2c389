//! Weekly activity pattern and idle-window prediction
//!
//! The pattern is a 7x24 grid of "probability the operator is active",
//! learned from presence samples with Laplace smoothing so sparse buckets
//! drift toward 0.5 instead of flapping between certainties. Prediction
//! walks the grid forward in 15-minute steps in the operator's local time.

use crate::store::UsageSample;
use chrono::{DateTime, Datelike, Duration, Local, Timelike};
use std::time::Instant;
use tracing::debug;

/// Probability at or above which the operator is expected to be active
const RETURN_THRESHOLD: f64 = 0.5;

/// Probability below which a bucket counts as predicted-idle
const IDLE_THRESHOLD: f64 = 0.3;

/// Grid resolution for forward searches
const STEP_MINUTES: i64 = 15;

/// How far `minutes_until_likely_return` looks ahead
const RETURN_SEARCH_HOURS: i64 = 8;

/// Rebuild the cached pattern after this long
const PATTERN_TTL_SECS: u64 = 15 * 60;

/// Learned weekly activity heatmap
#[derive(Debug, Clone)]
pub struct ActivityPattern {
    /// probability[weekday 0-6 from Monday][hour 0-23]
    prob: [[f64; 24]; 7],
}

impl ActivityPattern {
    /// Learn the pattern from presence samples
    ///
    /// Each (weekday, hour) bucket is the Laplace-smoothed (alpha = 1) mean
    /// of the `active` flags falling into it.
    pub fn learn(samples: &[UsageSample]) -> Self {
        let mut actives = [[0u32; 24]; 7];
        let mut totals = [[0u32; 24]; 7];

        for sample in samples {
            let local = sample.observed_at.with_timezone(&Local);
            let day = local.weekday().num_days_from_monday() as usize;
            let hour = local.hour() as usize;
            totals[day][hour] += 1;
            if sample.active {
                actives[day][hour] += 1;
            }
        }

        let mut prob = [[0.0f64; 24]; 7];
        for day in 0..7 {
            for hour in 0..24 {
                prob[day][hour] = f64::from(actives[day][hour] + 1)
                    / f64::from(totals[day][hour] + 2);
            }
        }

        Self { prob }
    }

    /// Probability for a specific (weekday-from-Monday, hour) bucket
    pub fn probability(&self, weekday: usize, hour: usize) -> f64 {
        self.prob[weekday.min(6)][hour.min(23)]
    }

    /// Probability for the bucket containing `when`
    pub fn probability_at(&self, when: DateTime<Local>) -> f64 {
        self.probability(
            when.weekday().num_days_from_monday() as usize,
            when.hour() as usize,
        )
    }
}

/// Forward-looking queries over an [`ActivityPattern`]
#[derive(Debug, Clone)]
pub struct IdlePredictor {
    pattern: ActivityPattern,
}

impl IdlePredictor {
    pub fn new(pattern: ActivityPattern) -> Self {
        Self { pattern }
    }

    /// Smallest forward offset (minutes) at which the operator is likely
    /// active, searched in 15-minute steps up to 8 hours; `None` means the
    /// pattern predicts no return inside the horizon.
    pub fn minutes_until_likely_return(&self, now: DateTime<Local>) -> Option<i64> {
        let horizon = RETURN_SEARCH_HOURS * 60;
        let mut offset = 0;
        while offset <= horizon {
            let when = now + Duration::minutes(offset);
            if self.pattern.probability_at(when) >= RETURN_THRESHOLD {
                return Some(offset);
            }
            offset += STEP_MINUTES;
        }
        None
    }

    /// Longest run of contiguous predicted-idle 15-minute buckets within the
    /// next `horizon_hours`, in minutes
    pub fn longest_predicted_idle_within(
        &self,
        now: DateTime<Local>,
        horizon_hours: u32,
    ) -> i64 {
        let buckets = i64::from(horizon_hours) * 60 / STEP_MINUTES;
        let mut longest = 0i64;
        let mut run = 0i64;
        for i in 0..buckets {
            let when = now + Duration::minutes(i * STEP_MINUTES);
            if self.pattern.probability_at(when) < IDLE_THRESHOLD {
                run += STEP_MINUTES;
                longest = longest.max(run);
            } else {
                run = 0;
            }
        }
        longest
    }
}

/// Per-process pattern cache
///
/// The pattern is cheap to build but read on every tick; rebuilding every
/// 15 minutes keeps predictions current without hammering the store.
pub struct PredictorCache {
    built_at: Option<Instant>,
    predictor: Option<IdlePredictor>,
}

impl PredictorCache {
    pub fn new() -> Self {
        Self {
            built_at: None,
            predictor: None,
        }
    }

    /// Get the cached predictor, rebuilding from `samples()` when stale
    pub fn get<F>(&mut self, samples: F) -> crate::errors::Result<&IdlePredictor>
    where
        F: FnOnce() -> crate::errors::Result<Vec<UsageSample>>,
    {
        let stale = match self.built_at {
            Some(at) => at.elapsed().as_secs() >= PATTERN_TTL_SECS,
            None => true,
        };
        if stale {
            let samples = samples()?;
            debug!(samples = samples.len(), "Rebuilding activity pattern");
            self.predictor = Some(IdlePredictor::new(ActivityPattern::learn(&samples)));
            self.built_at = Some(Instant::now());
        }
        Ok(self.predictor.as_ref().expect("predictor just built"))
    }
}

impl Default for PredictorCache {
    fn default() -> Self {
        Self::new()
    }
}
