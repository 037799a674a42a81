use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time statistics for one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxStats {
    pub start_time: Option<DateTime<Utc>>,
    pub uptime_secs: f64,
    pub successful_actions: u64,
    pub failed_actions: u64,
}

/// Monotonic action counters. Only the executor increments them.
#[derive(Debug, Default)]
pub struct ActionCounters {
    successful: AtomicU64,
    failed: AtomicU64,
}

impl ActionCounters {
    pub fn record(&self, success: bool) {
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn successful(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Seconds between `start` and `end` (or now), zero if never started.
pub(crate) fn uptime_secs(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> f64 {
    match start {
        Some(start) => {
            let end = end.unwrap_or_else(Utc::now);
            (end - start).num_milliseconds().max(0) as f64 / 1000.0
        }
        None => 0.0,
    }
}
