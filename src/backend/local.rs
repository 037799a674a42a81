//! In-process backend that hosts each sandbox as a private tool registry.
//!
//! Endpoints point at the data-plane routes served by this process, so the
//! gateway can proxy to a local sandbox exactly like it would to a remote one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BackendHandle, PrepareSpec, RuntimeBackend};
use crate::error::BackendError;
use crate::resources::ComputeSpec;
use crate::sandbox::SandboxId;
use crate::tools::{ToolDescriptor, ToolError, ToolRegistry};

struct Environment {
    sandbox_id: SandboxId,
    tools: ToolRegistry,
    compute: ComputeSpec,
    running: bool,
    in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight counter when an invocation finishes or is dropped.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct LocalBackend {
    endpoint_base: String,
    catalogue: ToolRegistry,
    environments: RwLock<HashMap<BackendHandle, Environment>>,
}

impl LocalBackend {
    /// `endpoint_base` is the public base URL of the data-plane router,
    /// e.g. `http://127.0.0.1:8000`.
    pub fn new(endpoint_base: impl Into<String>) -> Self {
        Self::with_catalogue(endpoint_base, ToolRegistry::with_builtins())
    }

    pub fn with_catalogue(endpoint_base: impl Into<String>, catalogue: ToolRegistry) -> Self {
        Self {
            endpoint_base: endpoint_base.into().trim_end_matches('/').to_string(),
            catalogue,
            environments: RwLock::new(HashMap::new()),
        }
    }

    /// Number of prepared environments, running or not.
    pub async fn environment_count(&self) -> usize {
        self.environments.read().await.len()
    }

    fn unknown(handle: &BackendHandle) -> BackendError {
        BackendError::UnknownHandle {
            handle: handle.to_string(),
        }
    }
}

#[async_trait]
impl RuntimeBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn prepare(&self, spec: &PrepareSpec) -> Result<BackendHandle, BackendError> {
        let tools = self
            .catalogue
            .subset(&spec.tools)
            .map_err(|e| BackendError::PrepareFailed {
                reason: e.to_string(),
            })?;

        let handle = BackendHandle::new(format!("local-{}", spec.sandbox_id));
        let mut environments = self.environments.write().await;
        if environments.contains_key(&handle) {
            return Err(BackendError::PrepareFailed {
                reason: format!("environment {} already exists", handle),
            });
        }

        tracing::debug!(
            sandbox_id = %spec.sandbox_id,
            handle = %handle,
            tools = tools.len(),
            "Prepared local environment"
        );

        environments.insert(
            handle.clone(),
            Environment {
                sandbox_id: spec.sandbox_id.clone(),
                tools,
                compute: spec.compute,
                running: false,
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
        );
        Ok(handle)
    }

    async fn start(&self, handle: &BackendHandle) -> Result<String, BackendError> {
        let mut environments = self.environments.write().await;
        let env = environments
            .get_mut(handle)
            .ok_or_else(|| Self::unknown(handle))?;
        if env.running {
            return Err(BackendError::StartFailed {
                reason: format!("environment {} is already running", handle),
            });
        }
        env.running = true;
        Ok(format!(
            "{}/sandboxes/{}",
            self.endpoint_base, env.sandbox_id
        ))
    }

    async fn stop(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        self.environments
            .write()
            .await
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| Self::unknown(handle))
    }

    async fn invoke(
        &self,
        handle: &BackendHandle,
        action: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, BackendError> {
        let (tool, in_flight) = {
            let environments = self.environments.read().await;
            let env = environments
                .get(handle)
                .ok_or_else(|| Self::unknown(handle))?;
            if !env.running {
                return Err(BackendError::NotRunning {
                    handle: handle.to_string(),
                });
            }
            let tool = env
                .tools
                .get(action)
                .ok_or_else(|| ToolError::NotFound(action.to_string()))?;
            (tool, Arc::clone(&env.in_flight))
        };

        let _guard = InFlightGuard::enter(&in_flight);
        let output = tool.execute(args).await?;
        Ok(output.result)
    }

    async fn capabilities(&self, handle: &BackendHandle) -> Result<Vec<ToolDescriptor>, BackendError> {
        let environments = self.environments.read().await;
        let env = environments
            .get(handle)
            .ok_or_else(|| Self::unknown(handle))?;
        Ok(env.tools.descriptors())
    }

    /// Simulated usage: one core per in-flight invocation, bounded by the
    /// reservation. Other dimensions are not observable in-process.
    async fn measure(&self, handle: &BackendHandle) -> Result<Option<ComputeSpec>, BackendError> {
        let environments = self.environments.read().await;
        let env = environments
            .get(handle)
            .ok_or_else(|| Self::unknown(handle))?;
        if !env.running {
            return Ok(None);
        }
        let busy = env.in_flight.load(Ordering::SeqCst) as f64;
        Ok(Some(ComputeSpec::cpu_only(busy.min(env.compute.cpu))))
    }
}
