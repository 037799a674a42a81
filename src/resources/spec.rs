//! Compute demand vectors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Tolerance used when comparing fractional capacity figures.
pub(crate) const EPSILON: f64 = 1e-9;

/// How the values of a [`ComputeSpec`] are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceUnit {
    /// Cores, GB and Gbps.
    #[default]
    Absolute,
    /// Percent (0-100) of the machine's total capacity.
    Percentage,
}

/// One axis of the capacity vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Cpu,
    Memory,
    Disk,
    NetworkBandwidth,
}

impl Dimension {
    /// All dimensions in the order admission checks them.
    pub const ALL: [Dimension; 4] = [
        Dimension::Cpu,
        Dimension::Memory,
        Dimension::Disk,
        Dimension::NetworkBandwidth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Cpu => "cpu",
            Dimension::Memory => "memory",
            Dimension::Disk => "disk",
            Dimension::NetworkBandwidth => "network_bandwidth",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource-demand vector: CPU cores, memory GB, disk GB and network Gbps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeSpec {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub network_bandwidth: f64,
    pub unit: ResourceUnit,
}

impl ComputeSpec {
    /// Absolute demand in cores, GB, GB and Gbps.
    pub fn absolute(cpu: f64, memory: f64, disk: f64, network_bandwidth: f64) -> Self {
        Self {
            cpu,
            memory,
            disk,
            network_bandwidth,
            unit: ResourceUnit::Absolute,
        }
    }

    /// Demand expressed as percent of total machine capacity.
    pub fn percentage(cpu: f64, memory: f64, disk: f64, network_bandwidth: f64) -> Self {
        Self {
            cpu,
            memory,
            disk,
            network_bandwidth,
            unit: ResourceUnit::Percentage,
        }
    }

    /// The all-zero absolute vector.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Only CPU, everything else zero. Handy for tests and quick configs.
    pub fn cpu_only(cpu: f64) -> Self {
        Self::absolute(cpu, 0.0, 0.0, 0.0)
    }

    pub fn get(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Cpu => self.cpu,
            Dimension::Memory => self.memory,
            Dimension::Disk => self.disk,
            Dimension::NetworkBandwidth => self.network_bandwidth,
        }
    }

    fn get_mut(&mut self, dimension: Dimension) -> &mut f64 {
        match dimension {
            Dimension::Cpu => &mut self.cpu,
            Dimension::Memory => &mut self.memory,
            Dimension::Disk => &mut self.disk,
            Dimension::NetworkBandwidth => &mut self.network_bandwidth,
        }
    }

    pub fn is_percentage(&self) -> bool {
        self.unit == ResourceUnit::Percentage
    }

    /// Reject negative, non-finite, or out-of-range values.
    pub fn validate(&self) -> Result<(), LedgerError> {
        for dimension in Dimension::ALL {
            let value = self.get(dimension);
            if !value.is_finite() || value < 0.0 {
                return Err(LedgerError::InvalidSpec {
                    reason: format!("{} must be a non-negative number, got {}", dimension, value),
                });
            }
            if self.is_percentage() && value > 100.0 + EPSILON {
                return Err(LedgerError::InvalidSpec {
                    reason: format!("{} percentage must be at most 100, got {}", dimension, value),
                });
            }
        }
        Ok(())
    }

    /// Resolve to absolute units against `total`. Absolute specs are returned
    /// unchanged.
    pub fn resolve_against(&self, total: &ComputeSpec) -> ComputeSpec {
        if !self.is_percentage() {
            return *self;
        }
        let mut resolved = ComputeSpec::zero();
        for dimension in Dimension::ALL {
            *resolved.get_mut(dimension) = total.get(dimension) * self.get(dimension) / 100.0;
        }
        resolved
    }

    /// Per-dimension sum. The unit of `self` is kept.
    pub fn plus(&self, other: &ComputeSpec) -> ComputeSpec {
        let mut out = *self;
        for dimension in Dimension::ALL {
            *out.get_mut(dimension) += other.get(dimension);
        }
        out
    }

    /// Per-dimension difference clamped at zero.
    pub fn saturating_minus(&self, other: &ComputeSpec) -> ComputeSpec {
        let mut out = *self;
        for dimension in Dimension::ALL {
            let value = self.get(dimension) - other.get(dimension);
            *out.get_mut(dimension) = if value < EPSILON { 0.0 } else { value };
        }
        out
    }

    /// Per-dimension maximum.
    pub fn max(&self, other: &ComputeSpec) -> ComputeSpec {
        let mut out = *self;
        for dimension in Dimension::ALL {
            *out.get_mut(dimension) = self.get(dimension).max(other.get(dimension));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_defaults_to_absolute_when_omitted() {
        let spec: ComputeSpec = serde_json::from_value(serde_json::json!({
            "cpu": 2.0,
            "memory": 4.0,
            "disk": 10.0,
            "network_bandwidth": 1.0
        }))
        .unwrap();
        assert_eq!(spec.unit, ResourceUnit::Absolute);
    }

    #[test]
    fn test_percentage_unit_deserializes() {
        let spec: ComputeSpec = serde_json::from_value(serde_json::json!({
            "cpu": 50.0,
            "memory": 25.0,
            "disk": 0.0,
            "network_bandwidth": 0.0,
            "unit": "percentage"
        }))
        .unwrap();
        assert!(spec.is_percentage());
    }

    #[test]
    fn test_resolve_percentage_against_total() {
        let total = ComputeSpec::absolute(8.0, 32.0, 100.0, 10.0);
        let resolved = ComputeSpec::percentage(50.0, 25.0, 10.0, 0.0).resolve_against(&total);
        assert_eq!(resolved, ComputeSpec::absolute(4.0, 8.0, 10.0, 0.0));
    }

    #[test]
    fn test_resolve_absolute_is_identity() {
        let total = ComputeSpec::absolute(8.0, 32.0, 100.0, 10.0);
        let spec = ComputeSpec::absolute(1.0, 2.0, 3.0, 4.0);
        assert_eq!(spec.resolve_against(&total), spec);
    }

    #[test]
    fn test_validate_rejects_negative() {
        let spec = ComputeSpec::absolute(-1.0, 0.0, 0.0, 0.0);
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("cpu"));
    }

    #[test]
    fn test_validate_rejects_nan() {
        let spec = ComputeSpec::absolute(0.0, f64::NAN, 0.0, 0.0);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_percentage_over_100() {
        let spec = ComputeSpec::percentage(0.0, 0.0, 120.0, 0.0);
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("disk"));
    }

    #[test]
    fn test_saturating_minus_clamps_at_zero() {
        let a = ComputeSpec::absolute(1.0, 2.0, 0.0, 0.0);
        let b = ComputeSpec::absolute(2.0, 1.0, 0.0, 0.0);
        assert_eq!(a.saturating_minus(&b), ComputeSpec::absolute(0.0, 1.0, 0.0, 0.0));
    }

    #[test]
    fn test_dimension_display() {
        assert_eq!(Dimension::NetworkBandwidth.to_string(), "network_bandwidth");
    }
}
