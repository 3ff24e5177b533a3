//! Provider adapters - normalized access to LLM chat-completion backends
//!
//! Every backend implements the [`Provider`] trait: model selection, request
//! encoding, a streaming invocation yielding [`ResponseEvent`]s, and a
//! blocking single-shot invocation. The orchestration loop only ever talks to
//! `Arc<dyn Provider>`; which backend is active is decided once, from
//! configuration, by [`from_config`].

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::history::{ChatMessage, ToolInvocation};

/// Upper timeout for streaming requests. Streams stay open for the whole
/// generation, so this is generous.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Upper timeout for non-streaming requests.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// One tool-call fragment as it arrives on the wire, keyed by call index.
///
/// Fields the wire omitted are empty strings; the accumulator treats empty as
/// absent (first non-empty occurrence wins).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    /// Position of the call in this response's tool-call list.
    pub index: usize,
    /// Provider-assigned call id.
    pub id: String,
    /// Tool name; non-empty only on the fragment that opens the call.
    pub name: String,
    /// A piece of the JSON argument string.
    pub arguments: String,
    /// Wire `type` field.
    pub kind: String,
}

/// One event from an open response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    /// A piece of assistant text.
    Delta(String),
    /// A piece of a tool-call descriptor.
    ToolCall(ToolCallFragment),
    /// Token usage reported by the backend.
    Usage(u64),
    /// The backend signalled completion.
    Done,
}

/// Pull-based stream of response events, one per call to `recv`.
///
/// Mirrors the upstream SDK shape: the consumer drives the stream and
/// suspends between events. Dropping the stream closes the connection.
#[async_trait]
pub trait ResponseStream: Send {
    /// The next event, or `None` once the stream is exhausted.
    ///
    /// # Errors
    ///
    /// [`RelayError::Transport`] on connection or protocol failure. The
    /// stream is unusable afterwards.
    async fn recv(&mut self) -> Result<Option<ResponseEvent>>;
}

/// A provider-neutral request: the resolved model, the bounded context, and
/// the wire-format tool specs offered to the model.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tool_specs: Vec<Value>,
}

/// The reply of a non-streaming invocation.
#[derive(Debug, Clone)]
pub struct SyncReply {
    /// Assistant text (may be empty when the model only requested tools).
    pub content: String,
    /// Tool calls the model requested, arguments arriving whole.
    pub tool_calls: Vec<ToolInvocation>,
    /// Total tokens this invocation consumed.
    pub total_tokens: u64,
}

/// Contract implemented once per backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider name, used as the metrics key and config selector.
    fn name(&self) -> &str;

    /// Resolve the model for a round: the user's preferred mode when this
    /// provider supports it, else the provider default.
    fn select_model(&self, user_mode: Option<&str>) -> String;

    /// Bundle a context into a request for this backend.
    fn encode(&self, model: &str, messages: Vec<ChatMessage>, tool_specs: Vec<Value>) -> ProviderRequest {
        ProviderRequest {
            model: model.to_string(),
            messages,
            tool_specs,
        }
    }

    /// Open a streaming completion.
    ///
    /// Transport errors surface immediately; nothing is retried here.
    async fn open_stream(&self, request: &ProviderRequest) -> Result<Box<dyn ResponseStream>>;

    /// One blocking completion.
    ///
    /// # Errors
    ///
    /// [`RelayError::EmptyResponse`] when the backend returns zero choices.
    async fn invoke_sync(&self, request: &ProviderRequest) -> Result<SyncReply>;
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("name", &self.name()).finish()
    }
}

/// Build the configured provider.
///
/// # Errors
///
/// [`RelayError::Config`] for an unknown provider name or a missing API key.
pub fn from_config(config: &Config) -> Result<Arc<dyn Provider>> {
    match config.provider.as_str() {
        "deepseek" => Ok(Arc::new(OpenAiCompatProvider::deepseek(config)?)),
        "openrouter" => Ok(Arc::new(OpenAiCompatProvider::openrouter(config)?)),
        other => Err(RelayError::Config(format!("unknown provider: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_unknown_provider() {
        let config = Config {
            provider: "carrier-pigeon".to_string(),
            ..Config::default()
        };
        let err = from_config(&config).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn test_from_config_requires_api_key() {
        let config = Config::default();
        let err = from_config(&config).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_from_config_builds_deepseek() {
        let config = Config {
            deepseek_api_key: Some("sk-test".to_string()),
            ..Config::default()
        };
        let provider = from_config(&config).unwrap();
        assert_eq!(provider.name(), "deepseek");
    }

    #[test]
    fn test_timeouts_ordering() {
        assert!(STREAM_TIMEOUT > SYNC_TIMEOUT);
    }
}
