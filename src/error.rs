//! Error types for ChatRelay
//!
//! One taxonomy covers the whole engine. The important distinction is
//! per-call vs. per-round: [`RelayError::ToolsJson`] and
//! [`RelayError::ToolExecution`] abandon a single tool call and let the round
//! continue, while everything else fails the round.

use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RelayError>;

/// All failure modes surfaced by the engine.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Network or provider failure. Fails the round; never retried internally.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Tool-call arguments failed to parse as a JSON object after the stream
    /// declared them complete. The call is abandoned, the round continues.
    #[error("Tool arguments are not valid JSON: {0}")]
    ToolsJson(String),

    /// Tool registry miss or handler failure. The call is abandoned, the
    /// round continues.
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// The tool loop reached the configured trip cap.
    #[error("too many rounds: trip limit of {0} exceeded")]
    LoopLimitExceeded(usize),

    /// A non-streaming completion returned zero choices.
    #[error("response is empty")]
    EmptyResponse,

    /// The user already has a round in flight.
    #[error("concurrent chat exceeded for user {0}")]
    ChatBusy(String),

    /// The caller cancelled the round.
    #[error("round cancelled")]
    Cancelled,

    /// History store failure.
    #[error("History error: {0}")]
    History(String),

    /// Invalid or missing configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Filesystem failure (history persistence).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure (exchange records, wire bodies).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

impl RelayError {
    /// Whether this error abandons only a single tool call rather than the
    /// whole round.
    pub fn is_call_local(&self) -> bool {
        matches!(self, RelayError::ToolsJson(_) | RelayError::ToolExecution(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_limit_message() {
        let err = RelayError::LoopLimitExceeded(5);
        assert!(err.to_string().contains("too many rounds"));
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn test_empty_response_message() {
        assert_eq!(RelayError::EmptyResponse.to_string(), "response is empty");
    }

    #[test]
    fn test_chat_busy_names_user() {
        let err = RelayError::ChatBusy("u42".into());
        assert!(err.to_string().contains("concurrent chat exceeded"));
        assert!(err.to_string().contains("u42"));
    }

    #[test]
    fn test_call_local_classification() {
        assert!(RelayError::ToolsJson("x".into()).is_call_local());
        assert!(RelayError::ToolExecution("x".into()).is_call_local());
        assert!(!RelayError::Transport("x".into()).is_call_local());
        assert!(!RelayError::LoopLimitExceeded(5).is_call_local());
        assert!(!RelayError::Cancelled.is_call_local());
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{invalid");
        let err: RelayError = parse.unwrap_err().into();
        assert!(matches!(err, RelayError::Json(_)));
    }
}
