//! Built-in tools for chatrelay
//!
//! Two small self-contained tools that ship with the engine: an echo tool
//! useful for exercising the tool loop end to end, and a clock tool giving
//! models access to the current time.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::{RelayError, Result};

use super::{Tool, ToolContext};

/// Tool that returns its input unchanged.
///
/// # Parameters
/// - `text`: The text to echo back (required)
///
/// # Example
/// ```rust
/// use chatrelay::tools::{EchoTool, Tool, ToolContext};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let tool = EchoTool;
/// let ctx = ToolContext::new();
/// let result = tool.execute(json!({"text": "ping"}), &ctx).await;
/// assert_eq!(result.unwrap(), "ping");
/// # });
/// ```
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the given text unchanged"
    }

    fn parameters(&self) -> Value {
        json!({
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

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::ToolExecution("Missing 'text' argument".into()))?;
        Ok(text.to_string())
    }
}

/// Tool that reports the current time in UTC.
///
/// # Parameters
/// - `format`: Output format, one of `"human"` (default), `"rfc3339"`,
///   `"unix"` (optional)
pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "format": {
                    "type": "string",
                    "enum": ["human", "rfc3339", "unix"],
                    "description": "Output format (default: human)"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String> {
        let format = args
            .get("format")
            .and_then(|v| v.as_str())
            .unwrap_or("human");

        let now = Utc::now();
        match format {
            "human" => Ok(now.format("%Y-%m-%d %H:%M:%S UTC").to_string()),
            "rfc3339" => Ok(now.to_rfc3339()),
            "unix" => Ok(now.timestamp().to_string()),
            other => Err(RelayError::ToolExecution(format!(
                "Unknown format '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_returns_input() {
        let tool = EchoTool;
        let ctx = ToolContext::new();

        let result = tool.execute(json!({"text": "hello"}), &ctx).await;
        assert_eq!(result.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_echo_preserves_unicode() {
        let tool = EchoTool;
        let ctx = ToolContext::new();

        let result = tool.execute(json!({"text": "日本語 🎉"}), &ctx).await;
        assert_eq!(result.unwrap(), "日本語 🎉");
    }

    #[tokio::test]
    async fn test_echo_missing_text() {
        let tool = EchoTool;
        let ctx = ToolContext::new();

        let result = tool.execute(json!({}), &ctx).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Missing 'text'"));
    }

    #[tokio::test]
    async fn test_clock_default_format() {
        let tool = ClockTool;
        let ctx = ToolContext::new();

        let result = tool.execute(json!({}), &ctx).await.unwrap();
        assert!(result.ends_with("UTC"));
        assert!(result.contains('-'));
        assert!(result.contains(':'));
    }

    #[tokio::test]
    async fn test_clock_unix_format() {
        let tool = ClockTool;
        let ctx = ToolContext::new();

        let result = tool.execute(json!({"format": "unix"}), &ctx).await.unwrap();
        let seconds: i64 = result.parse().unwrap();
        // sometime after 2024
        assert!(seconds > 1_700_000_000);
    }

    #[tokio::test]
    async fn test_clock_rfc3339_format() {
        let tool = ClockTool;
        let ctx = ToolContext::new();

        let result = tool
            .execute(json!({"format": "rfc3339"}), &ctx)
            .await
            .unwrap();
        assert!(result.contains('T'));
    }

    #[tokio::test]
    async fn test_clock_unknown_format() {
        let tool = ClockTool;
        let ctx = ToolContext::new();

        let result = tool.execute(json!({"format": "stardate"}), &ctx).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("stardate"));
    }

    #[test]
    fn test_tool_metadata() {
        assert_eq!(EchoTool.name(), "echo");
        assert_eq!(ClockTool.name(), "clock");
        assert!(!EchoTool.description().is_empty());
        assert!(!ClockTool.description().is_empty());
        assert_eq!(EchoTool.parameters()["required"][0], "text");
        assert_eq!(ClockTool.parameters()["type"], "object");
    }
}
