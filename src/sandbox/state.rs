use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxState {
    Created,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl SandboxState {
    /// TERMINATED and FAILED admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxState::Terminated | SandboxState::Failed)
    }

    pub fn can_transition_to(&self, target: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, target),
            (Created, Starting)
                | (Created, Stopping)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Stopping, Terminated)
                | (Stopping, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Created => "CREATED",
            SandboxState::Starting => "STARTING",
            SandboxState::Running => "RUNNING",
            SandboxState::Stopping => "STOPPING",
            SandboxState::Terminated => "TERMINATED",
            SandboxState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(SandboxState::Created.can_transition_to(SandboxState::Starting));
        assert!(SandboxState::Starting.can_transition_to(SandboxState::Running));
        assert!(SandboxState::Running.can_transition_to(SandboxState::Stopping));
        assert!(SandboxState::Stopping.can_transition_to(SandboxState::Terminated));
    }

    #[test]
    fn test_failure_transitions() {
        assert!(SandboxState::Starting.can_transition_to(SandboxState::Failed));
        assert!(SandboxState::Stopping.can_transition_to(SandboxState::Failed));
    }

    #[test]
    fn test_created_can_be_stopped_without_starting() {
        assert!(SandboxState::Created.can_transition_to(SandboxState::Stopping));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [SandboxState::Terminated, SandboxState::Failed] {
            assert!(terminal.is_terminal());
            for target in [
                SandboxState::Created,
                SandboxState::Starting,
                SandboxState::Running,
                SandboxState::Stopping,
                SandboxState::Terminated,
                SandboxState::Failed,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn test_running_cannot_restart() {
        assert!(!SandboxState::Running.can_transition_to(SandboxState::Starting));
    }

    #[test]
    fn test_serializes_uppercase() {
        let json = serde_json::to_string(&SandboxState::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
    }
}
