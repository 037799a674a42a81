//! Sandbox identity, configuration, and lifecycle.

mod config;
mod lifecycle;
mod state;
mod stats;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use config::{DatabaseAccess, DatabaseConfig, DatabaseKind, SandboxConfig};
pub use lifecycle::{DEFAULT_HISTORY_LIMIT, Sandbox, SandboxRecord};
pub use state::SandboxState;
pub use stats::{ActionCounters, SandboxStats};

/// Unique, immutable sandbox identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// A fresh id of the form `sbx-` followed by 12 hex digits.
    pub fn generate() -> Self {
        let raw = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("sbx-{}", &raw[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SandboxId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SandboxId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = SandboxId::generate();
        let b = SandboxId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_generated_id_shape() {
        let id = SandboxId::generate();
        assert!(id.as_str().starts_with("sbx-"));
        assert_eq!(id.as_str().len(), 16);
        assert!(
            id.as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        );
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = SandboxId::new("sbx-abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"sbx-abc\"");
    }
}
