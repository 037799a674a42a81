//! Runtime backends: the opaque collaborators that actually host sandboxes.
//!
//! The orchestrator only ever talks to a `dyn RuntimeBackend`; which variant
//! is used is decided once at construction time.

mod local;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

pub use local::LocalBackend;

use crate::error::BackendError;
use crate::resources::ComputeSpec;
use crate::sandbox::{DatabaseConfig, SandboxId};
use crate::tools::ToolDescriptor;

/// Opaque reference to a prepared environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BackendHandle(String);

impl BackendHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the backend is asked to prepare.
#[derive(Debug, Clone)]
pub struct PrepareSpec {
    pub sandbox_id: SandboxId,
    pub name: String,
    /// Absolute amount reserved in the ledger.
    pub compute: ComputeSpec,
    pub database: Option<DatabaseConfig>,
    pub tools: Vec<String>,
}

#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Allocate an environment without starting it.
    async fn prepare(&self, spec: &PrepareSpec) -> Result<BackendHandle, BackendError>;

    /// Start a prepared environment and return its execution endpoint.
    async fn start(&self, handle: &BackendHandle) -> Result<String, BackendError>;

    /// Stop and dispose of an environment. Called for prepared-but-never-started
    /// environments too.
    async fn stop(&self, handle: &BackendHandle) -> Result<(), BackendError>;

    /// Run one named action with a JSON argument object.
    async fn invoke(
        &self,
        handle: &BackendHandle,
        action: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, BackendError>;

    /// Tool API reference for the environment.
    async fn capabilities(&self, handle: &BackendHandle) -> Result<Vec<ToolDescriptor>, BackendError>;

    /// Current resource consumption, if the backend can measure it.
    async fn measure(&self, _handle: &BackendHandle) -> Result<Option<ComputeSpec>, BackendError> {
        Ok(None)
    }
}
