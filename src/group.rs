//! Named collections of sandboxes sharing one template.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::OrchestratorError;
use crate::gateway::ApiKeyStore;
use crate::orchestrator::Orchestrator;
use crate::resources::ComputeSpec;
use crate::sandbox::{SandboxConfig, SandboxId, SandboxState};

/// What a client needs to reach a started sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxAccess {
    pub sandbox_id: SandboxId,
    pub url: String,
    /// Present when the group issues gateway keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Aggregated usage of a group's members.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupResourceStats {
    pub sandboxes: usize,
    pub live_sandboxes: usize,
    /// Sum of reservations held by live members.
    pub allocated: ComputeSpec,
    /// Sum of the latest measurement of each live member.
    pub measured: ComputeSpec,
    pub successful_actions: u64,
    pub failed_actions: u64,
}

/// One member as seen by group status. `state` is absent once the
/// orchestrator no longer retains the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMember {
    pub name: String,
    pub sandbox_id: SandboxId,
    pub state: Option<SandboxState>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
    pub name: String,
    pub members: Vec<GroupMember>,
    pub resources: GroupResourceStats,
}

/// A name is claimed as `Creating` while the backend prepares the sandbox.
#[derive(Debug, Clone)]
enum Member {
    Creating,
    Ready(SandboxId),
}

pub struct SandboxGroup {
    name: String,
    orchestrator: Arc<Orchestrator>,
    template: SandboxConfig,
    members: RwLock<HashMap<String, Member>>,
    keys: Option<ApiKeyStore>,
    key_ttl: Option<Duration>,
}

impl SandboxGroup {
    pub fn new(name: impl Into<String>, orchestrator: Arc<Orchestrator>, template: SandboxConfig) -> Self {
        Self {
            name: name.into(),
            orchestrator,
            template,
            members: RwLock::new(HashMap::new()),
            keys: None,
            key_ttl: None,
        }
    }

    /// Issue a gateway key on every start and revoke it on end.
    pub fn with_key_store(mut self, keys: ApiKeyStore, ttl: Option<Duration>) -> Self {
        self.keys = Some(keys);
        self.key_ttl = ttl;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &SandboxConfig {
        &self.template
    }

    /// Id of a created member. Names still being created are unknown.
    pub async fn sandbox_id(&self, name: &str) -> Result<SandboxId, OrchestratorError> {
        match self.members.read().await.get(name) {
            Some(Member::Ready(id)) => Ok(id.clone()),
            _ => Err(OrchestratorError::UnknownName {
                name: name.to_string(),
            }),
        }
    }

    pub async fn member_names(&self) -> Vec<String> {
        self.ready_members().await.into_iter().map(|(name, _)| name).collect()
    }

    /// Created members, sorted by name.
    async fn ready_members(&self) -> Vec<(String, SandboxId)> {
        let mut members: Vec<(String, SandboxId)> = self
            .members
            .read()
            .await
            .iter()
            .filter_map(|(name, member)| match member {
                Member::Ready(id) => Some((name.clone(), id.clone())),
                Member::Creating => None,
            })
            .collect();
        members.sort();
        members
    }

    /// Create a member from the group template. The name is claimed before
    /// the backend is called, so other members stay usable meanwhile.
    pub async fn create_sandbox(&self, name: &str) -> Result<SandboxId, OrchestratorError> {
        {
            let mut members = self.members.write().await;
            if members.contains_key(name) {
                return Err(OrchestratorError::DuplicateName {
                    name: name.to_string(),
                });
            }
            members.insert(name.to_string(), Member::Creating);
        }

        let result = self
            .orchestrator
            .create_sandbox(&format!("{}/{}", self.name, name), &self.template)
            .await;

        let mut members = self.members.write().await;
        match result {
            Ok(created) => {
                members.insert(name.to_string(), Member::Ready(created.sandbox_id.clone()));
                tracing::info!(
                    group = %self.name,
                    name = name,
                    sandbox_id = %created.sandbox_id,
                    "Group member created"
                );
                Ok(created.sandbox_id)
            }
            Err(e) => {
                members.remove(name);
                Err(e)
            }
        }
    }

    pub async fn start_sandbox(&self, name: &str) -> Result<SandboxAccess, OrchestratorError> {
        let sandbox_id = self.sandbox_id(name).await?;
        let url = self.orchestrator.start_sandbox(&sandbox_id).await?;
        let api_key = match &self.keys {
            Some(keys) => Some(keys.issue(&sandbox_id, self.key_ttl).await),
            None => None,
        };
        Ok(SandboxAccess {
            sandbox_id,
            url,
            api_key,
        })
    }

    /// Stop a member. The mapping is removed once the stop completes,
    /// whatever its outcome.
    pub async fn end_sandbox(&self, name: &str) -> Result<(), OrchestratorError> {
        let sandbox_id = self.sandbox_id(name).await?;
        let result = self.stop_member(&sandbox_id).await;
        self.forget(name, &sandbox_id).await;
        result
    }

    /// Stop every member concurrently. All stops are attempted; failures are
    /// reported together.
    pub async fn end_group(&self) -> Result<(), OrchestratorError> {
        let members = self.ready_members().await;

        let stops = members.iter().map(|(name, sandbox_id)| async move {
            (name.clone(), self.stop_member(sandbox_id).await)
        });
        let outcomes = futures::future::join_all(stops).await;

        let mut details = BTreeMap::new();
        for (name, result) in outcomes {
            if let Err(e) = result {
                details.insert(name, e.to_string());
            }
        }
        for (name, sandbox_id) in &members {
            self.forget(name, sandbox_id).await;
        }

        tracing::info!(
            group = %self.name,
            members = members.len(),
            failed = details.len(),
            "Group ended"
        );

        if details.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::PartialCleanupFailure { details })
        }
    }

    pub async fn get_resource_stats(&self) -> Result<GroupResourceStats, OrchestratorError> {
        let members = self.ready_members().await;

        let mut stats = GroupResourceStats {
            sandboxes: members.len(),
            live_sandboxes: 0,
            allocated: ComputeSpec::zero(),
            measured: ComputeSpec::zero(),
            successful_actions: 0,
            failed_actions: 0,
        };
        for (_, sandbox_id) in &members {
            let record = match self.orchestrator.get_sandbox(sandbox_id).await {
                Ok(record) => record,
                // Evicted after termination.
                Err(OrchestratorError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            stats.successful_actions += record.stats.successful_actions;
            stats.failed_actions += record.stats.failed_actions;
            if record.state.is_terminal() {
                continue;
            }
            stats.live_sandboxes += 1;
            stats.allocated = stats.allocated.plus(&record.compute_spec);
            let usage = self.orchestrator.get_sandbox_resource_usage(sandbox_id).await?;
            if let Some(latest) = usage.latest {
                stats.measured = stats.measured.plus(&latest.usage);
            }
        }
        Ok(stats)
    }

    /// Members with their current state, plus aggregated resources.
    pub async fn status(&self) -> Result<GroupStatus, OrchestratorError> {
        let mut members = Vec::new();
        for (name, sandbox_id) in self.ready_members().await {
            let state = self
                .orchestrator
                .get_sandbox(&sandbox_id)
                .await
                .ok()
                .map(|record| record.state);
            members.push(GroupMember {
                name,
                sandbox_id,
                state,
            });
        }
        Ok(GroupStatus {
            name: self.name.clone(),
            members,
            resources: self.get_resource_stats().await?,
        })
    }

    /// Stop one member, treating an already-terminal or evicted sandbox as
    /// stopped.
    async fn stop_member(&self, sandbox_id: &SandboxId) -> Result<(), OrchestratorError> {
        match self.orchestrator.stop_sandbox(sandbox_id).await {
            Err(OrchestratorError::InvalidState { state, .. }) if state.is_terminal() => Ok(()),
            Err(OrchestratorError::NotFound { .. }) => Ok(()),
            other => other,
        }
    }

    async fn forget(&self, name: &str, sandbox_id: &SandboxId) {
        self.members.write().await.remove(name);
        if let Some(keys) = &self.keys {
            keys.revoke(sandbox_id).await;
        }
    }
}
