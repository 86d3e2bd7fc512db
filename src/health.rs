//! Collector health signals derived from `CollectorStatus` rows

use crate::types::{AggregationFault, CollectorStatus, Platform};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HealthSignal {
    Healthy,
    /// No status row was ever written for the platform
    NeverReported,
    /// No successful poll since `last_success_at` (None if it never succeeded)
    Stale { last_success_at: Option<i64> },
    Failing {
        consecutive_failures: i64,
        last_error: Option<String>,
    },
    /// Stopped on an authentication failure; needs operator action
    Halted { last_error: Option<String> },
}

impl HealthSignal {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthSignal::Healthy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformHealth {
    pub platform: Platform,
    pub signal: HealthSignal,
}

/// Classify one status. Halted wins over stale, stale over failing.
pub fn assess_status(status: &CollectorStatus, now: i64, stale_after_secs: i64) -> HealthSignal {
    if status.halted {
        return HealthSignal::Halted {
            last_error: status.last_error.clone(),
        };
    }
    let stale = match status.last_success_at {
        Some(at) => now - at > stale_after_secs,
        None => true,
    };
    if stale {
        return HealthSignal::Stale {
            last_success_at: status.last_success_at,
        };
    }
    if status.consecutive_failures > 0 {
        return HealthSignal::Failing {
            consecutive_failures: status.consecutive_failures,
            last_error: status.last_error.clone(),
        };
    }
    HealthSignal::Healthy
}

/// One entry per known platform, in `Platform::all()` order
pub fn assess(statuses: &[CollectorStatus], now: i64, stale_after_secs: i64) -> Vec<PlatformHealth> {
    Platform::all()
        .into_iter()
        .map(|platform| {
            let signal = statuses
                .iter()
                .find(|s| s.platform == platform)
                .map(|s| assess_status(s, now, stale_after_secs))
                .unwrap_or(HealthSignal::NeverReported);
            PlatformHealth { platform, signal }
        })
        .collect()
}

/// Full operator report, serialized by the `health` binary
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: i64,
    pub collectors: Vec<PlatformHealth>,
    pub statuses: Vec<CollectorStatus>,
    pub recent_faults: Vec<AggregationFault>,
}

impl HealthReport {
    pub fn new(
        statuses: Vec<CollectorStatus>,
        recent_faults: Vec<AggregationFault>,
        now: i64,
        stale_after_secs: i64,
    ) -> Self {
        Self {
            generated_at: now,
            collectors: assess(&statuses, now, stale_after_secs),
            statuses,
            recent_faults,
        }
    }

    pub fn all_healthy(&self) -> bool {
        self.collectors.iter().all(|c| c.signal.is_healthy())
    }

    pub fn log_summary(&self) {
        for entry in &self.collectors {
            match &entry.signal {
                HealthSignal::Healthy => log::info!("💚 {} collector healthy", entry.platform),
                HealthSignal::NeverReported => {
                    log::warn!("⚠️  {} collector has never reported", entry.platform)
                }
                HealthSignal::Stale { last_success_at } => log::warn!(
                    "⚠️  {} collector stale (last success: {:?})",
                    entry.platform,
                    last_success_at
                ),
                HealthSignal::Failing {
                    consecutive_failures,
                    last_error,
                } => log::warn!(
                    "⚠️  {} collector failing ({} in a row): {}",
                    entry.platform,
                    consecutive_failures,
                    last_error.as_deref().unwrap_or("-")
                ),
                HealthSignal::Halted { last_error } => log::error!(
                    "🛑 {} collector halted: {}",
                    entry.platform,
                    last_error.as_deref().unwrap_or("-")
                ),
            }
        }
        if !self.recent_faults.is_empty() {
            log::warn!("⚠️  {} aggregation fault(s) need review", self.recent_faults.len());
        }
    }
}
