//! Shell command execution inside the sandbox's working directory.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::tools::tool::{Tool, ToolError, ToolOutput, require_str};

/// Default per-command timeout when the caller gives none.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Output beyond this many bytes per stream is truncated.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Runs a command through `sh -c` and captures exit code, stdout and stderr.
#[derive(Debug, Clone)]
pub struct ExecuteCommandTool {
    working_dir: Option<PathBuf>,
    default_timeout: Duration,
}

impl Default for ExecuteCommandTool {
    fn default() -> Self {
        Self {
            working_dir: None,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ExecuteCommandTool {
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

fn truncate(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_OUTPUT_BYTES);
    let mut text = String::from_utf8_lossy(&bytes[..end]).into_owned();
    if bytes.len() > MAX_OUTPUT_BYTES {
        text.push_str("\n... (truncated)");
    }
    text
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Run a shell command and return its exit code, stdout and stderr."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Command line passed to `sh -c`"
                },
                "timeout_secs": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Kill the command after this many seconds"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();

        let command = require_str(&params, "command")?;
        if command.trim().is_empty() {
            return Err(ToolError::InvalidParameters(
                "'command' must not be empty".to_string(),
            ));
        }
        let timeout = params
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn: {}", e)))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ToolError::Timeout(timeout))?
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let result = serde_json::json!({
            "exit_code": output.status.code(),
            "stdout": truncate(&output.stdout),
            "stderr": truncate(&output.stderr),
        });

        Ok(ToolOutput::success(result, start.elapsed()))
    }
}
