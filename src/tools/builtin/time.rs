//! Current-time tool.

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};

use crate::tools::tool::{Tool, ToolError, ToolOutput};

/// Reports the current time, optionally shifted to a fixed UTC offset.
pub struct TimeTool;

#[async_trait]
impl Tool for TimeTool {
    fn name(&self) -> &str {
        "get_current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time as ISO 8601 and unix timestamps."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "utc_offset_minutes": {
                    "type": "integer",
                    "description": "Offset from UTC in minutes for the ISO output (default 0)"
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();

        let offset_minutes = match params.get("utc_offset_minutes") {
            None | Some(serde_json::Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| {
                ToolError::InvalidParameters("'utc_offset_minutes' must be an integer".to_string())
            })?,
        };
        let offset = i32::try_from(offset_minutes * 60)
            .ok()
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                ToolError::InvalidParameters(format!(
                    "utc offset out of range: {} minutes",
                    offset_minutes
                ))
            })?;

        let now = Utc::now();
        let result = serde_json::json!({
            "iso": now.with_timezone(&offset).to_rfc3339(),
            "unix": now.timestamp(),
            "unix_millis": now.timestamp_millis()
        });

        Ok(ToolOutput::success(result, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name() {
        assert_eq!(TimeTool.name(), "get_current_time");
    }

    #[tokio::test]
    async fn test_execute_now() {
        let output = TimeTool.execute(serde_json::json!({})).await.unwrap();
        assert!(output.result.get("iso").is_some());
        assert!(output.result.get("unix").is_some());
        assert!(output.result.get("unix_millis").is_some());
    }

    #[tokio::test]
    async fn test_execute_with_offset() {
        let output = TimeTool
            .execute(serde_json::json!({"utc_offset_minutes": 120}))
            .await
            .unwrap();
        let iso = output.result.get("iso").unwrap().as_str().unwrap();
        assert!(iso.ends_with("+02:00"));
    }

    #[tokio::test]
    async fn test_execute_offset_out_of_range() {
        let err = TimeTool
            .execute(serde_json::json!({"utc_offset_minutes": 100000}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_execute_offset_wrong_type() {
        let err = TimeTool
            .execute(serde_json::json!({"utc_offset_minutes": "two"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}
