//! User presence sampling
//!
//! The operator counts as "present" precisely when a process is interacting
//! with the assistant, so the default probe greps the process table for the
//! assistant identifier. The probe is pluggable so headless environments and
//! tests can supply their own signal.

use crate::errors::Result;
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::process::Command;
use tracing::{debug, warn};

/// Capability that answers "is the operator interacting right now?"
pub trait UserPresenceProbe: Send {
    fn probe(&self) -> Result<bool>;
}

/// Default probe: any process whose command line mentions the assistant
///
/// Headless boxes without `ps` report never-active; the daemon is then gated
/// only by prediction, quota, and budget.
pub struct ProcessPresenceProbe {
    needle: String,
}

impl ProcessPresenceProbe {
    pub fn new(assistant_identifier: impl Into<String>) -> Self {
        Self {
            needle: assistant_identifier.into(),
        }
    }
}

impl UserPresenceProbe for ProcessPresenceProbe {
    fn probe(&self) -> Result<bool> {
        let output = match Command::new("ps").args(["-eo", "args"]).output() {
            Ok(output) => output,
            Err(e) => {
                warn!("ps unavailable, treating operator as absent: {e}");
                return Ok(false);
            }
        };

        let listing = String::from_utf8_lossy(&output.stdout);
        let active = listing.lines().any(|line| {
            // Skip the ps invocation itself and our own daemon
            line.contains(&self.needle)
                && !line.contains("ps -eo")
                && !line.contains("wise-magpie")
        });
        Ok(active)
    }
}

/// Samples presence once per tick and records it for pattern learning
pub struct ActivityMonitor {
    probe: Box<dyn UserPresenceProbe>,
    cached: Option<bool>,
}

impl ActivityMonitor {
    pub fn new(probe: Box<dyn UserPresenceProbe>) -> Self {
        Self {
            probe,
            cached: None,
        }
    }

    /// Drop the per-tick cache; called at the top of every tick
    pub fn begin_tick(&mut self) {
        self.cached = None;
    }

    /// Probe (at most once per tick) without persisting
    pub fn is_active(&mut self) -> Result<bool> {
        if let Some(active) = self.cached {
            return Ok(active);
        }
        let active = self.probe.probe()?;
        self.cached = Some(active);
        Ok(active)
    }

    /// Probe and persist a UsageSample for the predictor
    pub fn sample(&mut self, store: &Store, now: DateTime<Utc>) -> Result<bool> {
        let active = self.is_active()?;
        store.record_usage_sample(now, active)?;
        debug!(active, "Recorded presence sample");
        Ok(active)
    }

    /// Minutes since the last active sample; `None` when never seen active
    pub fn idle_minutes(&self, store: &Store, now: DateTime<Utc>) -> Result<Option<i64>> {
        let last = store.last_active_sample_at()?;
        Ok(last.map(|at| (now - at).num_minutes().max(0)))
    }
}
