//! Per-sandbox state machine.
//!
//! Transitions on one sandbox are serialized by `control`; different
//! sandboxes never contend. Readers (executor, gateway lookups) only take the
//! short `status` lock and never wait behind a slow backend call.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::config::DatabaseConfig;
use super::state::SandboxState;
use super::stats::{ActionCounters, SandboxStats, uptime_secs};
use super::SandboxId;
use crate::backend::{BackendHandle, RuntimeBackend};
use crate::error::OrchestratorError;
use crate::executor::BatchRecord;
use crate::resources::{ComputeSpec, ResourceLedger, ResourceMeasurement, ResourceUsageReport, UsageHistory};

struct Status {
    state: SandboxState,
    endpoint: Option<String>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    last_activity_at: DateTime<Utc>,
}

/// Serializable view of a sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxRecord {
    pub id: SandboxId,
    pub name: String,
    pub state: SandboxState,
    pub endpoint: Option<String>,
    /// Demand as submitted, possibly in percentage units.
    pub requested: ComputeSpec,
    /// Absolute amount held in the ledger.
    pub compute_spec: ComputeSpec,
    pub database: Option<DatabaseConfig>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub stats: SandboxStats,
}

/// Batches kept per sandbox unless configured otherwise.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// One sandbox owned by the orchestrator.
pub struct Sandbox {
    id: SandboxId,
    name: String,
    handle: BackendHandle,
    requested: ComputeSpec,
    reserved: ComputeSpec,
    database: Option<DatabaseConfig>,
    created_at: DateTime<Utc>,
    status: RwLock<Status>,
    control: Mutex<()>,
    cancel: CancellationToken,
    counters: ActionCounters,
    usage: Mutex<UsageHistory>,
    history: Mutex<VecDeque<BatchRecord>>,
    history_limit: usize,
}

impl Sandbox {
    /// A freshly prepared sandbox in CREATED, holding `reserved` in the ledger.
    pub fn new(
        id: SandboxId,
        name: impl Into<String>,
        handle: BackendHandle,
        requested: ComputeSpec,
        reserved: ComputeSpec,
        database: Option<DatabaseConfig>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            handle,
            requested,
            reserved,
            database,
            created_at: now,
            status: RwLock::new(Status {
                state: SandboxState::Created,
                endpoint: None,
                started_at: None,
                stopped_at: None,
                last_activity_at: now,
            }),
            control: Mutex::new(()),
            cancel: CancellationToken::new(),
            counters: ActionCounters::default(),
            usage: Mutex::new(UsageHistory::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Keep at most `limit` batches; older ones are dropped first.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &BackendHandle {
        &self.handle
    }

    pub fn reserved(&self) -> &ComputeSpec {
        &self.reserved
    }

    /// Token cancelled as soon as a stop begins.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn counters(&self) -> &ActionCounters {
        &self.counters
    }

    pub async fn state(&self) -> SandboxState {
        self.status.read().await.state
    }

    pub async fn endpoint(&self) -> Option<String> {
        self.status.read().await.endpoint.clone()
    }

    pub async fn last_activity_at(&self) -> DateTime<Utc> {
        self.status.read().await.last_activity_at
    }

    /// Mark the sandbox as recently used.
    pub async fn touch(&self) {
        self.status.write().await.last_activity_at = Utc::now();
    }

    /// The live endpoint, or `NotRunning` for every other state.
    pub async fn ensure_running(&self) -> Result<String, OrchestratorError> {
        let status = self.status.read().await;
        match (&status.state, &status.endpoint) {
            (SandboxState::Running, Some(endpoint)) => Ok(endpoint.clone()),
            (state, _) => Err(OrchestratorError::NotRunning {
                sandbox_id: self.id.clone(),
                state: *state,
            }),
        }
    }

    /// `InvalidState` if the sandbox reached a terminal state.
    pub async fn ensure_live(&self, operation: &'static str) -> Result<SandboxState, OrchestratorError> {
        let state = self.state().await;
        if state.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                sandbox_id: self.id.clone(),
                state,
                operation,
            });
        }
        Ok(state)
    }

    fn transition(&self, status: &mut Status, target: SandboxState) {
        debug_assert!(
            status.state.can_transition_to(target),
            "illegal transition {} -> {}",
            status.state,
            target
        );
        tracing::info!(
            sandbox_id = %self.id,
            from = %status.state,
            to = %target,
            "Sandbox state transition"
        );
        status.state = target;
        status.last_activity_at = Utc::now();
    }

    /// CREATED → STARTING → RUNNING. A backend failure moves the sandbox to
    /// FAILED and returns its reservation to the ledger.
    pub async fn start(
        &self,
        backend: &dyn RuntimeBackend,
        ledger: &ResourceLedger,
    ) -> Result<String, OrchestratorError> {
        let _control = self.control.lock().await;

        {
            let mut status = self.status.write().await;
            if status.state != SandboxState::Created {
                return Err(OrchestratorError::InvalidState {
                    sandbox_id: self.id.clone(),
                    state: status.state,
                    operation: "start",
                });
            }
            self.transition(&mut status, SandboxState::Starting);
        }

        match backend.start(&self.handle).await {
            Ok(endpoint) => {
                let mut status = self.status.write().await;
                status.endpoint = Some(endpoint.clone());
                status.started_at = Some(Utc::now());
                self.transition(&mut status, SandboxState::Running);
                Ok(endpoint)
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %self.id, error = %e, "Backend failed to start sandbox");
                {
                    let mut status = self.status.write().await;
                    self.transition(&mut status, SandboxState::Failed);
                }
                self.cancel.cancel();
                // The prepared environment is of no further use.
                if let Err(stop_err) = backend.stop(&self.handle).await {
                    tracing::debug!(sandbox_id = %self.id, error = %stop_err, "Cleanup after failed start");
                }
                self.release_reservation(ledger).await;
                Err(OrchestratorError::Backend {
                    sandbox_id: self.id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// CREATED/RUNNING → STOPPING → TERMINATED, or FAILED if the backend
    /// reports an error. The reservation is released either way.
    pub async fn stop(
        &self,
        backend: &dyn RuntimeBackend,
        ledger: &ResourceLedger,
    ) -> Result<(), OrchestratorError> {
        let _control = self.control.lock().await;

        {
            let mut status = self.status.write().await;
            if !status.state.can_transition_to(SandboxState::Stopping) {
                return Err(OrchestratorError::InvalidState {
                    sandbox_id: self.id.clone(),
                    state: status.state,
                    operation: "stop",
                });
            }
            self.transition(&mut status, SandboxState::Stopping);
        }
        // Interrupt any in-flight batch.
        self.cancel.cancel();

        let result = backend.stop(&self.handle).await;

        {
            let mut status = self.status.write().await;
            status.stopped_at = Some(Utc::now());
            status.endpoint = None;
            let target = if result.is_ok() {
                SandboxState::Terminated
            } else {
                SandboxState::Failed
            };
            self.transition(&mut status, target);
        }
        self.release_reservation(ledger).await;

        result.map_err(|e| {
            tracing::warn!(sandbox_id = %self.id, error = %e, "Backend failed to stop sandbox");
            OrchestratorError::Backend {
                sandbox_id: self.id.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// Return the reservation to the ledger. Only the first call frees
    /// capacity.
    pub async fn release_reservation(&self, ledger: &ResourceLedger) {
        if ledger.release(&self.id).await.is_some() {
            tracing::debug!(sandbox_id = %self.id, "Released sandbox reservation");
        }
    }

    /// When the sandbox reached a terminal state, if it has.
    pub async fn stopped_at(&self) -> Option<DateTime<Utc>> {
        let status = self.status.read().await;
        if status.state.is_terminal() {
            Some(status.stopped_at.unwrap_or(status.last_activity_at))
        } else {
            None
        }
    }

    pub async fn stats(&self) -> SandboxStats {
        let status = self.status.read().await;
        SandboxStats {
            start_time: status.started_at,
            uptime_secs: uptime_secs(status.started_at, status.stopped_at),
            successful_actions: self.counters.successful(),
            failed_actions: self.counters.failed(),
        }
    }

    pub async fn record(&self) -> SandboxRecord {
        let stats = self.stats().await;
        let status = self.status.read().await;
        SandboxRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            state: status.state,
            endpoint: status.endpoint.clone(),
            requested: self.requested,
            compute_spec: self.reserved,
            database: self.database.clone(),
            created_at: self.created_at,
            last_activity_at: status.last_activity_at,
            stats,
        }
    }

    pub async fn record_usage(&self, measurement: ResourceMeasurement) {
        self.usage.lock().await.record(measurement);
    }

    pub async fn usage_report(&self) -> ResourceUsageReport {
        let usage = self.usage.lock().await;
        ResourceUsageReport {
            allocated: self.reserved,
            latest: usage.latest().cloned(),
            peak: usage.peak(),
            samples: usage.samples(),
        }
    }

    pub async fn push_history(&self, batch: BatchRecord) {
        let mut history = self.history.lock().await;
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(batch);
    }

    pub async fn history(&self) -> Vec<BatchRecord> {
        self.history.lock().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::{LocalBackend, PrepareSpec};
    use crate::executor::{ActionBatch, ActionSpec};

    async fn prepared(backend: &LocalBackend, ledger: &ResourceLedger, id: &str) -> Sandbox {
        let requested = ComputeSpec::cpu_only(1.0);
        let id = SandboxId::new(id);
        let reserved = ledger.reserve(&id, &requested).await.unwrap();
        let handle = backend
            .prepare(&PrepareSpec {
                sandbox_id: id.clone(),
                name: "test".to_string(),
                compute: reserved,
                database: None,
                tools: Vec::new(),
            })
            .await
            .unwrap();
        Sandbox::new(id, "test", handle, requested, reserved, None)
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let backend = LocalBackend::new("http://localhost");
        let ledger = ResourceLedger::new(ComputeSpec::cpu_only(4.0));
        let sandbox = prepared(&backend, &ledger, "sbx-life1").await;

        let endpoint = sandbox.start(&backend, &ledger).await.unwrap();
        assert_eq!(sandbox.state().await, SandboxState::Running);
        assert_eq!(sandbox.ensure_running().await.unwrap(), endpoint);
        assert!(sandbox.stats().await.start_time.is_some());

        sandbox.stop(&backend, &ledger).await.unwrap();
        assert_eq!(sandbox.state().await, SandboxState::Terminated);
        assert!(sandbox.cancellation().is_cancelled());
        assert_eq!(ledger.snapshot().await.allocated.cpu, 0.0);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid_state() {
        let backend = LocalBackend::new("http://localhost");
        let ledger = ResourceLedger::new(ComputeSpec::cpu_only(4.0));
        let sandbox = prepared(&backend, &ledger, "sbx-life2").await;
        sandbox.start(&backend, &ledger).await.unwrap();
        let err = sandbox.start(&backend, &ledger).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidState { state: SandboxState::Running, .. }
        ));
    }

    #[tokio::test]
    async fn test_created_is_not_running() {
        let backend = LocalBackend::new("http://localhost");
        let ledger = ResourceLedger::new(ComputeSpec::cpu_only(4.0));
        let sandbox = prepared(&backend, &ledger, "sbx-life3").await;
        let err = sandbox.ensure_running().await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::NotRunning { state: SandboxState::Created, .. }
        ));
    }

    #[tokio::test]
    async fn test_stop_from_created_releases() {
        let backend = LocalBackend::new("http://localhost");
        let ledger = ResourceLedger::new(ComputeSpec::cpu_only(4.0));
        let sandbox = prepared(&backend, &ledger, "sbx-life4").await;
        sandbox.stop(&backend, &ledger).await.unwrap();
        assert_eq!(sandbox.state().await, SandboxState::Terminated);
        assert_eq!(ledger.snapshot().await.active_sandboxes, 0);
    }

    #[tokio::test]
    async fn test_stop_terminal_is_invalid_state() {
        let backend = LocalBackend::new("http://localhost");
        let ledger = ResourceLedger::new(ComputeSpec::cpu_only(4.0));
        let sandbox = prepared(&backend, &ledger, "sbx-life5").await;
        sandbox.stop(&backend, &ledger).await.unwrap();
        let err = sandbox.stop(&backend, &ledger).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { .. }));
        assert!(sandbox.ensure_live("stop").await.is_err());
    }

    #[tokio::test]
    async fn test_stop_with_backend_failure_still_releases() {
        let backend = LocalBackend::new("http://localhost");
        let ledger = ResourceLedger::new(ComputeSpec::cpu_only(4.0));
        let sandbox = prepared(&backend, &ledger, "sbx-life6").await;
        sandbox.start(&backend, &ledger).await.unwrap();
        // Dispose the environment behind the sandbox's back.
        backend.stop(sandbox.handle()).await.unwrap();

        let err = sandbox.stop(&backend, &ledger).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Backend { .. }));
        assert_eq!(sandbox.state().await, SandboxState::Failed);
        assert_eq!(ledger.snapshot().await.allocated.cpu, 0.0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let ledger = ResourceLedger::new(ComputeSpec::cpu_only(4.0));
        let backend = LocalBackend::new("http://localhost");
        let sandbox = prepared(&backend, &ledger, "sbx-life7").await;
        let _other = ledger
            .reserve(&SandboxId::new("sbx-other"), &ComputeSpec::cpu_only(2.0))
            .await
            .unwrap();
        sandbox.release_reservation(&ledger).await;
        sandbox.release_reservation(&ledger).await;
        assert_eq!(ledger.snapshot().await.allocated.cpu, 2.0);
    }

    #[tokio::test]
    async fn test_concurrent_stops_release_once() {
        let ledger = Arc::new(ResourceLedger::new(ComputeSpec::cpu_only(4.0)));
        let backend = Arc::new(LocalBackend::new("http://localhost"));
        let sandbox = Arc::new(prepared(&backend, &ledger, "sbx-life8").await);
        sandbox.start(backend.as_ref(), &ledger).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let (sandbox, backend, ledger) =
                (Arc::clone(&sandbox), Arc::clone(&backend), Arc::clone(&ledger));
            tasks.push(tokio::spawn(async move {
                sandbox.stop(backend.as_ref(), &ledger).await.is_ok()
            }));
        }
        let mut ok = 0;
        for task in tasks {
            if task.await.unwrap() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(ledger.snapshot().await.active_sandboxes, 0);
    }

    #[tokio::test]
    async fn test_history_keeps_most_recent_batches() {
        let backend = LocalBackend::new("http://localhost");
        let ledger = ResourceLedger::new(ComputeSpec::cpu_only(4.0));
        let sandbox = prepared(&backend, &ledger, "sbx-life9")
            .await
            .with_history_limit(3);

        for i in 0..5 {
            sandbox
                .push_history(BatchRecord {
                    executed_at: Utc::now(),
                    actions: ActionBatch::new()
                        .with(format!("action-{}", i), ActionSpec::new(serde_json::json!({}))),
                    observations: Vec::new(),
                })
                .await;
        }

        let history = sandbox.history().await;
        let names: Vec<&str> = history
            .iter()
            .filter_map(|b| b.actions.iter().next().map(|(name, _)| name))
            .collect();
        assert_eq!(names, vec!["action-2", "action-3", "action-4"]);
    }

    #[tokio::test]
    async fn test_stopped_at_set_only_when_terminal() {
        let backend = LocalBackend::new("http://localhost");
        let ledger = ResourceLedger::new(ComputeSpec::cpu_only(4.0));
        let sandbox = prepared(&backend, &ledger, "sbx-life10").await;
        assert!(sandbox.stopped_at().await.is_none());
        sandbox.stop(&backend, &ledger).await.unwrap();
        assert!(sandbox.stopped_at().await.is_some());
    }
}
