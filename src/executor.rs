//! Runs batches of named actions against a running sandbox.
//!
//! A batch runs strictly in request order. Actions without a timeout are
//! awaited before the next one starts. Actions with a timeout run on their own
//! task; if they are not done in time the batch moves on, reporting
//! `stillRunning`, and the result can be collected later with
//! [`ActionExecutor::poll_action`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::RuntimeBackend;
use crate::error::OrchestratorError;
use crate::resources::ResourceMeasurement;
use crate::sandbox::{Sandbox, SandboxId};

fn empty_args() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// One requested action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default)]
    pub explanation: String,
    #[serde(default = "empty_args", alias = "arguments")]
    pub args: serde_json::Value,
    /// Stop waiting after this long and report the action as still running.
    #[serde(default, rename = "timeoutMs", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ActionSpec {
    pub fn new(args: serde_json::Value) -> Self {
        Self {
            explanation: String::new(),
            args,
            timeout_ms: None,
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Action name → spec, in insertion order. Names are unique within a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionBatch(Vec<(String, ActionSpec)>);

impl ActionBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action. A repeated name replaces the earlier spec in place.
    pub fn with(mut self, name: impl Into<String>, spec: ActionSpec) -> Self {
        let name = name.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = spec,
            None => self.0.push((name, spec)),
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ActionSpec)> {
        self.0.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for ActionBatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, spec) in &self.0 {
            map.serialize_entry(name, spec)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ActionBatch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BatchVisitor;

        impl<'de> Visitor<'de> for BatchVisitor {
            type Value = ActionBatch;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of action name to action spec")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ActionBatch, A::Error> {
                let mut actions: Vec<(String, ActionSpec)> =
                    Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, spec)) = map.next_entry::<String, ActionSpec>()? {
                    if actions.iter().any(|(n, _)| *n == name) {
                        return Err(de::Error::custom(format!("duplicate action: {}", name)));
                    }
                    actions.push((name, spec));
                }
                Ok(ActionBatch(actions))
            }
        }

        deserializer.deserialize_map(BatchVisitor)
    }
}

/// Body of `POST /actions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionExecutionRequest {
    pub actions: ActionBatch,
}

impl From<ActionBatch> for ActionExecutionRequest {
    fn from(actions: ActionBatch) -> Self {
        Self { actions }
    }
}

/// Outcome of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub function_name: String,
    pub output: String,
    pub still_running: bool,
    /// True when `output` carries a failure description.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    /// Poll handle for a still-running (or polled) action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Uuid>,
}

impl Observation {
    fn completed(function_name: &str, value: serde_json::Value) -> Self {
        let output = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Self {
            function_name: function_name.to_string(),
            output,
            still_running: false,
            failed: false,
            handle: None,
        }
    }

    fn failed(function_name: &str, detail: impl fmt::Display) -> Self {
        Self {
            function_name: function_name.to_string(),
            output: format!("Error: {}", detail),
            still_running: false,
            failed: true,
            handle: None,
        }
    }

    fn interrupted(function_name: &str) -> Self {
        Self::failed(function_name, "interrupted: sandbox is stopping")
    }

    fn still_running(function_name: &str, handle: Uuid) -> Self {
        Self {
            function_name: function_name.to_string(),
            output: String::new(),
            still_running: true,
            failed: false,
            handle: Some(handle),
        }
    }

    fn with_handle(mut self, handle: Uuid) -> Self {
        self.handle = Some(handle);
        self
    }
}

/// Body returned by `POST /actions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionExecutionResponse {
    pub observations: Vec<Observation>,
}

/// One executed batch, kept in the sandbox's action history.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub executed_at: DateTime<Utc>,
    pub actions: ActionBatch,
    pub observations: Vec<Observation>,
}

struct PendingAction {
    sandbox: Arc<Sandbox>,
    function_name: String,
    task: JoinHandle<Observation>,
}

impl PendingAction {
    /// Abort the task. An action that never finished counts as failed; one
    /// that finished already recorded its own outcome.
    async fn abort(self) {
        self.task.abort();
        if self.task.await.is_err() {
            self.sandbox.counters().record(false);
            tracing::debug!(
                sandbox_id = %self.sandbox.id(),
                action = %self.function_name,
                "Pending action aborted"
            );
        }
    }
}

/// Executes action batches through a runtime backend.
pub struct ActionExecutor {
    backend: Arc<dyn RuntimeBackend>,
    pending: Mutex<HashMap<Uuid, PendingAction>>,
}

impl ActionExecutor {
    pub fn new(backend: Arc<dyn RuntimeBackend>) -> Self {
        Self {
            backend,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Run `request` against `sandbox`, returning one observation per action
    /// in request order. Fails with `NotRunning` unless the sandbox is RUNNING.
    pub async fn execute_actions(
        &self,
        sandbox: &Arc<Sandbox>,
        request: ActionExecutionRequest,
    ) -> Result<Vec<Observation>, OrchestratorError> {
        sandbox.ensure_running().await?;
        let cancel = sandbox.cancellation();

        tracing::debug!(
            sandbox_id = %sandbox.id(),
            actions = request.actions.len(),
            "Executing action batch"
        );

        let mut observations = Vec::with_capacity(request.actions.len());
        for (name, spec) in request.actions.iter() {
            if cancel.is_cancelled() {
                sandbox.counters().record(false);
                observations.push(Observation::interrupted(name));
                continue;
            }

            let action = run_action(
                Arc::clone(&self.backend),
                Arc::clone(sandbox),
                name.to_string(),
                spec.args.clone(),
                cancel.clone(),
            );

            let observation = match spec.timeout_ms {
                None => action.await,
                Some(ms) => {
                    let mut task = tokio::spawn(action);
                    match tokio::time::timeout(Duration::from_millis(ms), &mut task).await {
                        Ok(joined) => joined_observation(sandbox, name, joined),
                        Err(_) => {
                            let handle = Uuid::new_v4();
                            tracing::debug!(
                                sandbox_id = %sandbox.id(),
                                action = name,
                                handle = %handle,
                                "Action still running after timeout"
                            );
                            self.pending.lock().await.insert(
                                handle,
                                PendingAction {
                                    sandbox: Arc::clone(sandbox),
                                    function_name: name.to_string(),
                                    task,
                                },
                            );
                            Observation::still_running(name, handle)
                        }
                    }
                }
            };
            observations.push(observation);
        }

        self.sample_usage(sandbox).await;
        sandbox
            .push_history(BatchRecord {
                executed_at: Utc::now(),
                actions: request.actions,
                observations: observations.clone(),
            })
            .await;

        Ok(observations)
    }

    /// Status of an action that was still running when its batch returned.
    /// Once finished, the final observation is returned and the handle is
    /// forgotten.
    pub async fn poll_action(
        &self,
        sandbox_id: &SandboxId,
        handle: Uuid,
    ) -> Result<Observation, OrchestratorError> {
        let mut pending = self.pending.lock().await;
        let entry = match pending.remove(&handle) {
            Some(entry) if entry.sandbox.id() == sandbox_id => entry,
            Some(entry) => {
                pending.insert(handle, entry);
                return Err(OrchestratorError::UnknownAction { handle });
            }
            None => return Err(OrchestratorError::UnknownAction { handle }),
        };

        if !entry.task.is_finished() {
            let observation = Observation::still_running(&entry.function_name, handle);
            pending.insert(handle, entry);
            return Ok(observation);
        }
        drop(pending);

        let joined = entry.task.await;
        let observation = match joined {
            Ok(observation) => observation,
            Err(e) => join_failure(&entry.function_name, e),
        };
        Ok(observation.with_handle(handle))
    }

    /// Number of actions still tracked for polling.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Abort the background actions of one sandbox and forget their handles.
    pub async fn forget_sandbox(&self, sandbox_id: &SandboxId) {
        let entries: Vec<PendingAction> = {
            let mut pending = self.pending.lock().await;
            let handles: Vec<Uuid> = pending
                .iter()
                .filter(|(_, entry)| entry.sandbox.id() == sandbox_id)
                .map(|(handle, _)| *handle)
                .collect();
            handles
                .iter()
                .filter_map(|handle| pending.remove(handle))
                .collect()
        };
        if entries.is_empty() {
            return;
        }
        tracing::debug!(sandbox_id = %sandbox_id, count = entries.len(), "Dropping pending actions");
        for entry in entries {
            entry.abort().await;
        }
    }

    /// Abort background actions and forget their handles. Safe to call more
    /// than once.
    pub async fn close(&self) {
        let entries: Vec<PendingAction> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, entry)| entry).collect()
        };
        if entries.is_empty() {
            return;
        }
        tracing::debug!(count = entries.len(), "Aborting pending actions");
        for entry in entries {
            entry.abort().await;
        }
    }

    async fn sample_usage(&self, sandbox: &Sandbox) {
        match self.backend.measure(sandbox.handle()).await {
            Ok(Some(usage)) => sandbox.record_usage(ResourceMeasurement::now(usage)).await,
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(sandbox_id = %sandbox.id(), error = %e, "Usage measurement failed");
            }
        }
    }
}

/// Invoke one action, update the sandbox counters, and build its observation.
async fn run_action(
    backend: Arc<dyn RuntimeBackend>,
    sandbox: Arc<Sandbox>,
    name: String,
    args: serde_json::Value,
    cancel: CancellationToken,
) -> Observation {
    let result = tokio::select! {
        _ = cancel.cancelled() => {
            sandbox.counters().record(false);
            return Observation::interrupted(&name);
        }
        result = backend.invoke(sandbox.handle(), &name, args) => result,
    };

    match result {
        Ok(value) => {
            sandbox.counters().record(true);
            sandbox.touch().await;
            Observation::completed(&name, value)
        }
        Err(e) => {
            tracing::debug!(sandbox_id = %sandbox.id(), action = %name, error = %e, "Action failed");
            sandbox.counters().record(false);
            Observation::failed(&name, e)
        }
    }
}

fn joined_observation(
    sandbox: &Sandbox,
    name: &str,
    joined: Result<Observation, JoinError>,
) -> Observation {
    match joined {
        Ok(observation) => observation,
        Err(e) => {
            sandbox.counters().record(false);
            join_failure(name, e)
        }
    }
}

fn join_failure(name: &str, err: JoinError) -> Observation {
    if err.is_cancelled() {
        Observation::failed(name, "aborted")
    } else {
        Observation::failed(name, "action panicked")
    }
}
