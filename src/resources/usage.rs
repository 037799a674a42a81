//! Measured resource consumption and the short rolling window kept per sandbox.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::spec::ComputeSpec;

/// Number of measurements retained per sandbox.
pub const USAGE_HISTORY_LEN: usize = 5;

/// One measurement reported by a runtime backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceMeasurement {
    pub taken_at: DateTime<Utc>,
    pub usage: ComputeSpec,
}

impl ResourceMeasurement {
    pub fn now(usage: ComputeSpec) -> Self {
        Self {
            taken_at: Utc::now(),
            usage,
        }
    }
}

/// Bounded window of recent measurements.
#[derive(Debug, Default)]
pub struct UsageHistory {
    samples: VecDeque<ResourceMeasurement>,
}

impl UsageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a measurement, evicting the oldest once the window is full.
    pub fn record(&mut self, measurement: ResourceMeasurement) {
        if self.samples.len() == USAGE_HISTORY_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(measurement);
    }

    pub fn latest(&self) -> Option<&ResourceMeasurement> {
        self.samples.back()
    }

    /// Per-dimension maximum over the window, `None` when empty.
    pub fn peak(&self) -> Option<ComputeSpec> {
        self.samples
            .iter()
            .map(|m| m.usage)
            .reduce(|acc, usage| acc.max(&usage))
    }

    pub fn samples(&self) -> Vec<ResourceMeasurement> {
        self.samples.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Resource usage report for one sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsageReport {
    /// Absolute amount reserved in the ledger.
    pub allocated: ComputeSpec,
    pub latest: Option<ResourceMeasurement>,
    pub peak: Option<ComputeSpec>,
    pub samples: Vec<ResourceMeasurement>,
}
