//! Machine-wide capacity ledger.
//!
//! Every admission runs in a single critical section: percentage resolution,
//! the availability check across all dimensions, and the commit all happen
//! under one lock, so two concurrent reservations can never both observe the
//! same "available" figure.
//!
//! Reservations are keyed by sandbox id, so releasing the same sandbox twice
//! returns its capacity only once.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::Mutex;

use super::spec::{ComputeSpec, Dimension, EPSILON, ResourceUnit};
use crate::error::LedgerError;
use crate::sandbox::SandboxId;

struct LedgerState {
    total: ComputeSpec,
    allocated: ComputeSpec,
    reservations: HashMap<SandboxId, ComputeSpec>,
}

/// Read-only view of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub total: ComputeSpec,
    pub allocated: ComputeSpec,
    pub available: ComputeSpec,
    pub active_sandboxes: u32,
    pub sandbox_limit: Option<u32>,
}

/// Tracks total vs. allocated compute capacity for one machine.
pub struct ResourceLedger {
    state: Mutex<LedgerState>,
    sandbox_limit: Option<u32>,
}

impl ResourceLedger {
    /// Create a ledger for a machine with the given absolute capacity.
    pub fn new(total: ComputeSpec) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                total: ComputeSpec {
                    unit: ResourceUnit::Absolute,
                    ..total
                },
                allocated: ComputeSpec::zero(),
                reservations: HashMap::new(),
            }),
            sandbox_limit: None,
        }
    }

    /// Cap the number of concurrently admitted sandboxes.
    pub fn with_sandbox_limit(mut self, max: u32) -> Self {
        self.sandbox_limit = Some(max);
        self
    }

    /// Admit sandbox `sandbox_id` demanding `spec`.
    ///
    /// Percentage specs are resolved against the current totals inside the
    /// same critical section as the check. On success the absolute amount
    /// actually reserved is returned and held under `sandbox_id` until
    /// [`release`](Self::release). On failure nothing is mutated and the error
    /// names the first violated dimension.
    pub async fn reserve(
        &self,
        sandbox_id: &SandboxId,
        spec: &ComputeSpec,
    ) -> Result<ComputeSpec, LedgerError> {
        spec.validate()?;

        let mut state = self.state.lock().await;

        if state.reservations.contains_key(sandbox_id) {
            return Err(LedgerError::InvalidSpec {
                reason: format!("sandbox {} already holds a reservation", sandbox_id),
            });
        }

        if let Some(max) = self.sandbox_limit
            && state.reservations.len() >= max as usize
        {
            return Err(LedgerError::SandboxLimit { max });
        }

        let demand = spec.resolve_against(&state.total);
        for dimension in Dimension::ALL {
            let requested = demand.get(dimension);
            let available = state.total.get(dimension) - state.allocated.get(dimension);
            if requested > available + EPSILON {
                tracing::debug!(
                    dimension = %dimension,
                    requested,
                    available,
                    "Reservation rejected"
                );
                return Err(LedgerError::InsufficientCapacity {
                    dimension,
                    requested,
                    available: available.max(0.0),
                });
            }
        }

        state.allocated = state.allocated.plus(&demand);
        state.reservations.insert(sandbox_id.clone(), demand);
        Ok(demand)
    }

    /// Return the capacity held by `sandbox_id`. Returns `None` when the
    /// sandbox holds nothing, in which case the ledger is untouched.
    pub async fn release(&self, sandbox_id: &SandboxId) -> Option<ComputeSpec> {
        let mut state = self.state.lock().await;
        let reserved = state.reservations.remove(sandbox_id)?;
        state.allocated = state.allocated.saturating_minus(&reserved);
        Some(reserved)
    }

    /// Current totals, allocations and availability.
    pub async fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock().await;
        LedgerSnapshot {
            total: state.total,
            allocated: state.allocated,
            available: state.total.saturating_minus(&state.allocated),
            active_sandboxes: state.reservations.len() as u32,
            sandbox_limit: self.sandbox_limit,
        }
    }
}
