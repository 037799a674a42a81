//! Sandbox orchestration: admission, backend preparation, and routing of
//! control requests to the right sandbox.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::{PrepareSpec, RuntimeBackend};
use crate::error::OrchestratorError;
use crate::executor::{ActionExecutionRequest, ActionExecutor, BatchRecord, Observation};
use crate::resources::{LedgerSnapshot, ResourceLedger, ResourceMeasurement, ResourceUsageReport};
use crate::sandbox::{
    DEFAULT_HISTORY_LIMIT, Sandbox, SandboxConfig, SandboxId, SandboxRecord, SandboxState, SandboxStats,
};
use crate::tools::ToolDescriptor;

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedSandbox {
    pub sandbox_id: SandboxId,
    /// Empty until the sandbox is started.
    pub sandbox_url: String,
}

/// How much finished state the orchestrator keeps around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// TERMINATED and FAILED sandboxes kept readable; the oldest are evicted
    /// first.
    pub max_terminal_sandboxes: usize,
    /// Batches kept in each sandbox's action history.
    pub max_history_batches: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_terminal_sandboxes: 100,
            max_history_batches: DEFAULT_HISTORY_LIMIT,
        }
    }
}

pub struct Orchestrator {
    ledger: Arc<ResourceLedger>,
    backend: Arc<dyn RuntimeBackend>,
    executor: ActionExecutor,
    sandboxes: RwLock<HashMap<SandboxId, Arc<Sandbox>>>,
    retention: RetentionPolicy,
}

impl Orchestrator {
    pub fn new(ledger: Arc<ResourceLedger>, backend: Arc<dyn RuntimeBackend>) -> Self {
        Self {
            executor: ActionExecutor::new(Arc::clone(&backend)),
            ledger,
            backend,
            sandboxes: RwLock::new(HashMap::new()),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    async fn lookup(&self, sandbox_id: &SandboxId) -> Result<Arc<Sandbox>, OrchestratorError> {
        self.sandboxes
            .read()
            .await
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound {
                sandbox_id: sandbox_id.clone(),
            })
    }

    /// Reserve capacity and prepare a backend environment. Nothing is
    /// recorded when admission fails; a preparation failure returns the
    /// reservation before reporting.
    pub async fn create_sandbox(
        &self,
        name: &str,
        config: &SandboxConfig,
    ) -> Result<CreatedSandbox, OrchestratorError> {
        let sandbox_id = SandboxId::generate();
        let reserved = self
            .ledger
            .reserve(&sandbox_id, &config.compute)
            .await
            .map_err(|e| {
                tracing::warn!(name = name, error = %e, "Sandbox admission rejected");
                OrchestratorError::from(e)
            })?;

        let prepare = PrepareSpec {
            sandbox_id: sandbox_id.clone(),
            name: name.to_string(),
            compute: reserved,
            database: config.database.clone(),
            tools: config.tools.clone(),
        };

        let handle = match self.backend.prepare(&prepare).await {
            Ok(handle) => handle,
            Err(e) => {
                self.ledger.release(&sandbox_id).await;
                tracing::warn!(
                    sandbox_id = %sandbox_id,
                    backend = self.backend.name(),
                    error = %e,
                    "Backend preparation failed, reservation rolled back"
                );
                return Err(OrchestratorError::Backend {
                    sandbox_id,
                    reason: e.to_string(),
                });
            }
        };

        let sandbox = Arc::new(
            Sandbox::new(
                sandbox_id.clone(),
                name,
                handle,
                config.compute,
                reserved,
                config.database.clone(),
            )
            .with_history_limit(self.retention.max_history_batches),
        );
        self.sandboxes
            .write()
            .await
            .insert(sandbox_id.clone(), sandbox);

        tracing::info!(
            sandbox_id = %sandbox_id,
            name = name,
            cpu = reserved.cpu,
            memory = reserved.memory,
            "Sandbox created"
        );

        Ok(CreatedSandbox {
            sandbox_id,
            sandbox_url: String::new(),
        })
    }

    /// Start a CREATED sandbox and return its endpoint.
    pub async fn start_sandbox(&self, sandbox_id: &SandboxId) -> Result<String, OrchestratorError> {
        let sandbox = self.lookup(sandbox_id).await?;
        let result = sandbox.start(self.backend.as_ref(), &self.ledger).await;
        if result.is_err() && sandbox.state().await.is_terminal() {
            self.evict_terminal().await;
        }
        result
    }

    /// Stop a sandbox. Its reservation is released even if the backend fails,
    /// and its still-running actions are aborted.
    pub async fn stop_sandbox(&self, sandbox_id: &SandboxId) -> Result<(), OrchestratorError> {
        let sandbox = self.lookup(sandbox_id).await?;
        let result = sandbox.stop(self.backend.as_ref(), &self.ledger).await;
        if !matches!(result, Err(OrchestratorError::InvalidState { .. })) {
            self.executor.forget_sandbox(sandbox_id).await;
            self.evict_terminal().await;
        }
        result
    }

    /// Drop the oldest terminal sandboxes beyond the retention limit.
    /// Returns how many were evicted.
    pub async fn evict_terminal(&self) -> usize {
        let sandboxes: Vec<Arc<Sandbox>> = self.sandboxes.read().await.values().cloned().collect();
        let mut terminal = Vec::new();
        for sandbox in sandboxes {
            if let Some(stopped_at) = sandbox.stopped_at().await {
                terminal.push((stopped_at, sandbox.id().clone()));
            }
        }
        if terminal.len() <= self.retention.max_terminal_sandboxes {
            return 0;
        }

        terminal.sort();
        let excess = terminal.len() - self.retention.max_terminal_sandboxes;
        let mut map = self.sandboxes.write().await;
        for (_, id) in terminal.iter().take(excess) {
            map.remove(id);
            tracing::debug!(sandbox_id = %id, "Evicted terminal sandbox");
        }
        excess
    }

    /// Number of still-running actions tracked for polling.
    pub async fn pending_action_count(&self) -> usize {
        self.executor.pending_count().await
    }

    pub async fn get_sandbox_url(&self, sandbox_id: &SandboxId) -> Result<String, OrchestratorError> {
        let sandbox = self.lookup(sandbox_id).await?;
        let endpoint = sandbox.ensure_running().await?;
        sandbox.touch().await;
        Ok(endpoint)
    }

    /// Endpoint lookup used by the gateway. Does not count as activity.
    pub async fn resolve_endpoint(&self, sandbox_id: &SandboxId) -> Result<String, OrchestratorError> {
        self.lookup(sandbox_id).await?.ensure_running().await
    }

    /// Stats stay readable after termination.
    pub async fn get_sandbox_stats(&self, sandbox_id: &SandboxId) -> Result<SandboxStats, OrchestratorError> {
        Ok(self.lookup(sandbox_id).await?.stats().await)
    }

    pub async fn get_sandbox(&self, sandbox_id: &SandboxId) -> Result<SandboxRecord, OrchestratorError> {
        Ok(self.lookup(sandbox_id).await?.record().await)
    }

    pub async fn list_sandboxes(&self) -> Vec<SandboxRecord> {
        let sandboxes: Vec<Arc<Sandbox>> = self.sandboxes.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(sandboxes.len());
        for sandbox in sandboxes {
            records.push(sandbox.record().await);
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    pub async fn get_sandbox_capabilities(
        &self,
        sandbox_id: &SandboxId,
    ) -> Result<Vec<ToolDescriptor>, OrchestratorError> {
        let sandbox = self.lookup(sandbox_id).await?;
        sandbox.ensure_live("get capabilities").await?;
        let tools = self
            .backend
            .capabilities(sandbox.handle())
            .await
            .map_err(|e| OrchestratorError::Backend {
                sandbox_id: sandbox_id.clone(),
                reason: e.to_string(),
            })?;
        sandbox.touch().await;
        Ok(tools)
    }

    /// Allocation plus the recent measurement window. A fresh measurement is
    /// taken first when the sandbox is running.
    pub async fn get_sandbox_resource_usage(
        &self,
        sandbox_id: &SandboxId,
    ) -> Result<ResourceUsageReport, OrchestratorError> {
        let sandbox = self.lookup(sandbox_id).await?;
        let state = sandbox.ensure_live("get resource usage").await?;
        if state == SandboxState::Running {
            match self.backend.measure(sandbox.handle()).await {
                Ok(Some(usage)) => sandbox.record_usage(ResourceMeasurement::now(usage)).await,
                Ok(None) => {}
                Err(e) => {
                    return Err(OrchestratorError::Backend {
                        sandbox_id: sandbox_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(sandbox.usage_report().await)
    }

    pub async fn get_sandbox_history(
        &self,
        sandbox_id: &SandboxId,
    ) -> Result<Vec<BatchRecord>, OrchestratorError> {
        Ok(self.lookup(sandbox_id).await?.history().await)
    }

    pub async fn execute_actions(
        &self,
        sandbox_id: &SandboxId,
        request: ActionExecutionRequest,
    ) -> Result<Vec<Observation>, OrchestratorError> {
        let sandbox = self.lookup(sandbox_id).await?;
        self.executor.execute_actions(&sandbox, request).await
    }

    pub async fn poll_action(
        &self,
        sandbox_id: &SandboxId,
        handle: Uuid,
    ) -> Result<Observation, OrchestratorError> {
        self.lookup(sandbox_id).await?;
        self.executor.poll_action(sandbox_id, handle).await
    }

    pub async fn get_total_resource_stats(&self) -> LedgerSnapshot {
        self.ledger.snapshot().await
    }

    /// Stop every live sandbox and abort background actions. Returns the
    /// sandboxes that failed to stop cleanly.
    pub async fn shutdown(&self) -> BTreeMap<String, String> {
        let sandboxes: Vec<Arc<Sandbox>> = self.sandboxes.read().await.values().cloned().collect();
        let mut live = Vec::new();
        for sandbox in sandboxes {
            if !sandbox.state().await.is_terminal() {
                live.push(sandbox);
            }
        }

        let stops = live.iter().map(|sandbox| async move {
            let result = sandbox.stop(self.backend.as_ref(), &self.ledger).await;
            (sandbox.id().to_string(), result)
        });
        let mut failures = BTreeMap::new();
        for (id, result) in futures::future::join_all(stops).await {
            if let Err(e) = result {
                failures.insert(id, e.to_string());
            }
        }

        self.executor.close().await;
        tracing::info!(
            stopped = live.len(),
            failed = failures.len(),
            "Orchestrator shut down"
        );
        failures
    }
}
