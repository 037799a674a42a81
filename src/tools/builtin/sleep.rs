//! Sleep tool, mostly useful for exercising still-running actions.

use std::time::Duration;

use async_trait::async_trait;

use crate::tools::tool::{Tool, ToolError, ToolOutput};

/// Upper bound on a single sleep.
const MAX_SLEEP_MS: u64 = 10 * 60 * 1000;

pub struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Wait for the given number of milliseconds, then report how long was slept."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "ms": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Milliseconds to sleep"
                }
            },
            "required": ["ms"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();

        let ms = params
            .get("ms")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'ms' parameter".to_string()))?;
        if ms > MAX_SLEEP_MS {
            return Err(ToolError::InvalidParameters(format!(
                "'ms' must be at most {}",
                MAX_SLEEP_MS
            )));
        }

        tokio::time::sleep(Duration::from_millis(ms)).await;

        Ok(ToolOutput::success(
            serde_json::json!({ "slept_ms": ms }),
            start.elapsed(),
        ))
    }
}
