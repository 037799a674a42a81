//! Creation-time configuration for sandboxes.

use serde::{Deserialize, Serialize};

use crate::resources::ComputeSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    Vector,
    Graph,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseAccess {
    #[default]
    ReadOnly,
    ReadWrite,
}

/// Database attached to every sandbox of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub kind: DatabaseKind,
    #[serde(default)]
    pub access: DatabaseAccess,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// Everything needed to create one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub compute: ComputeSpec,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Tool names to expose. Empty means every tool the backend offers.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl SandboxConfig {
    pub fn new(compute: ComputeSpec) -> Self {
        Self {
            compute,
            database: None,
            tools: Vec::new(),
        }
    }

    pub fn with_database(mut self, database: DatabaseConfig) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }
}
