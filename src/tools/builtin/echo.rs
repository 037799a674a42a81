//! Echo tool for smoke-testing a sandbox.

use async_trait::async_trait;

use crate::tools::tool::{Tool, ToolError, ToolOutput};

/// Returns its input unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the input text. Useful for checking that a sandbox is reachable."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The text to echo back"
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();

        // "message" is accepted as an alias for older clients.
        let text = params
            .get("text")
            .or_else(|| params.get("message"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'text' parameter".to_string()))?;

        Ok(ToolOutput::text(text, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name() {
        assert_eq!(EchoTool.name(), "echo");
    }

    #[test]
    fn test_parameters_schema_requires_text() {
        let schema = EchoTool.parameters_schema();
        let required = schema.get("required").unwrap().as_array().unwrap();
        assert!(required.iter().any(|v| v.as_str() == Some("text")));
    }

    #[tokio::test]
    async fn test_execute_text() {
        let output = EchoTool
            .execute(serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(output.result.as_str().unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_execute_message_alias() {
        let output = EchoTool
            .execute(serde_json::json!({"message": "hello world"}))
            .await
            .unwrap();
        assert_eq!(output.result.as_str().unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_execute_missing_text() {
        let err = EchoTool.execute(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}
