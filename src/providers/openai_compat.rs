//! OpenAI-compatible chat-completions adapter
//!
//! One adapter covers every backend speaking the OpenAI chat-completions
//! dialect: JSON request bodies, SSE response streams (`data:` lines, a
//! `[DONE]` terminator), delta objects carrying text and index-keyed
//! tool-call fragments, and usage chunks when `stream_options.include_usage`
//! is set. DeepSeek and OpenRouter ship as configured instances of this one
//! implementation.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{Config, Sampling};
use crate::error::{RelayError, Result};
use crate::history::{ChatMessage, Role, ToolInvocation};

use super::{
    Provider, ProviderRequest, ResponseEvent, ResponseStream, SyncReply, ToolCallFragment,
    STREAM_TIMEOUT, SYNC_TIMEOUT,
};

/// An OpenAI-compatible chat-completions backend.
///
/// # Example
/// ```
/// use chatrelay::config::Config;
/// use chatrelay::providers::{OpenAiCompatProvider, Provider};
///
/// let config = Config {
///     deepseek_api_key: Some("sk-test".to_string()),
///     ..Config::default()
/// };
/// let provider = OpenAiCompatProvider::deepseek(&config).unwrap();
/// assert_eq!(provider.name(), "deepseek");
/// assert_eq!(provider.select_model(None), "deepseek-chat");
/// ```
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    default_model: String,
    models: Vec<String>,
    sampling: Sampling,
    stream_client: reqwest::Client,
    sync_client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Build an adapter for an arbitrary OpenAI-compatible endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be constructed (e.g. an
    /// invalid proxy URL).
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
        models: &[&str],
        config: &Config,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            models: models.iter().map(|m| m.to_string()).collect(),
            sampling: config.sampling.clone(),
            stream_client: build_client(config.proxy.as_deref(), STREAM_TIMEOUT)?,
            sync_client: build_client(config.proxy.as_deref(), SYNC_TIMEOUT)?,
        })
    }

    /// The DeepSeek backend (api.deepseek.com).
    ///
    /// # Errors
    ///
    /// [`RelayError::Config`] when `DEEPSEEK_API_KEY` is not configured.
    pub fn deepseek(config: &Config) -> Result<Self> {
        let api_key = config
            .api_key_for("deepseek")
            .ok_or_else(|| RelayError::Config("DEEPSEEK_API_KEY is not set".to_string()))?
            .to_string();
        Self::new(
            "deepseek",
            "https://api.deepseek.com",
            api_key,
            "deepseek-chat",
            &["deepseek-chat", "deepseek-reasoner"],
            config,
        )
    }

    /// The OpenRouter backend (openrouter.ai), multiplexing several upstream
    /// model families behind one endpoint.
    ///
    /// # Errors
    ///
    /// [`RelayError::Config`] when `OPENROUTER_API_KEY` is not configured.
    pub fn openrouter(config: &Config) -> Result<Self> {
        let api_key = config
            .api_key_for("openrouter")
            .ok_or_else(|| RelayError::Config("OPENROUTER_API_KEY is not set".to_string()))?
            .to_string();
        Self::new(
            "openrouter",
            "https://openrouter.ai/api/v1",
            api_key,
            "deepseek/deepseek-chat-v3-0324",
            &[
                "deepseek/deepseek-chat-v3-0324",
                "deepseek/deepseek-r1",
                "anthropic/claude-3.5-sonnet",
                "openai/gpt-4o",
                "google/gemini-2.0-flash-001",
            ],
            config,
        )
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Render the wire body for one request.
    fn wire_body(&self, request: &ProviderRequest, stream: bool) -> WireRequest {
        WireRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(wire_message).collect(),
            tools: if request.tool_specs.is_empty() {
                None
            } else {
                Some(request.tool_specs.clone())
            },
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            max_tokens: self.sampling.max_tokens,
            temperature: self.sampling.temperature,
            top_p: self.sampling.top_p,
            frequency_penalty: self.sampling.frequency_penalty,
            presence_penalty: self.sampling.presence_penalty,
            stop: self.sampling.stop.clone(),
        }
    }

    /// Map a parsed non-streaming completion into a [`SyncReply`].
    fn reply_from(completion: ChatCompletion) -> Result<SyncReply> {
        let Some(choice) = completion.choices.into_iter().next() else {
            return Err(RelayError::EmptyResponse);
        };
        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolInvocation {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
                kind: call.kind,
            })
            .collect();
        Ok(SyncReply {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            total_tokens: completion.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn select_model(&self, user_mode: Option<&str>) -> String {
        match user_mode {
            Some(mode) if self.models.iter().any(|m| m == mode) => mode.to_string(),
            Some(mode) => {
                debug!(provider = %self.name, mode, "user mode not supported, using default");
                self.default_model.clone()
            }
            None => self.default_model.clone(),
        }
    }

    async fn open_stream(&self, request: &ProviderRequest) -> Result<Box<dyn ResponseStream>> {
        let body = self.wire_body(request, true);
        let response = self
            .stream_client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = check_status(self.name(), response).await?;
        Ok(Box::new(SseStream {
            response,
            parser: SseParser::default(),
        }))
    }

    async fn invoke_sync(&self, request: &ProviderRequest) -> Result<SyncReply> {
        let body = self.wire_body(request, false);
        let response = self
            .sync_client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = check_status(self.name(), response).await?;
        let completion: ChatCompletion = response.json().await?;
        Self::reply_from(completion)
    }
}

/// Turn an HTTP error status into a transport error carrying a truncated
/// body snippet.
async fn check_status(provider: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    Err(RelayError::Transport(format!(
        "{} returned {}: {}",
        provider, status, snippet
    )))
}

fn build_client(proxy: Option<&str>, timeout: Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    Ok(builder.build()?)
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    #[serde(default)]
    function: WireFunction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

fn wire_message(message: &ChatMessage) -> WireMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let tool_calls = message.tool_calls.as_ref().map(|calls| {
        calls
            .iter()
            .map(|call| WireToolCall {
                id: call.id.clone(),
                kind: call.kind.clone(),
                function: WireFunction {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            })
            .collect()
    });
    WireMessage {
        role,
        content: message.content.clone(),
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UsageInfo {
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<SyncChoice>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct SyncChoice {
    #[serde(default)]
    message: SyncMessage,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SyncMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

// ---------------------------------------------------------------------------
// SSE decoding
// ---------------------------------------------------------------------------

/// Incremental SSE decoder: bytes in, [`ResponseEvent`]s out.
///
/// Lines are assembled in a byte buffer before UTF-8 conversion so a
/// multi-byte character split across network chunks is never mangled.
#[derive(Default)]
struct SseParser {
    buffer: Vec<u8>,
    pending: VecDeque<ResponseEvent>,
    finished: bool,
}

impl SseParser {
    fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.consume_line(line.trim());
        }
    }

    /// The transport ended; synthesize `Done` if the backend never sent
    /// `[DONE]`.
    fn end_of_input(&mut self) {
        if !self.finished {
            self.finished = true;
            self.pending.push_back(ResponseEvent::Done);
        }
    }

    fn next_event(&mut self) -> Option<ResponseEvent> {
        self.pending.pop_front()
    }

    fn is_exhausted(&self) -> bool {
        self.finished && self.pending.is_empty()
    }

    fn consume_line(&mut self, line: &str) {
        if self.finished {
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.finished = true;
            self.pending.push_back(ResponseEvent::Done);
            return;
        }
        match serde_json::from_str::<ChatCompletionChunk>(data) {
            Ok(chunk) => push_chunk_events(chunk, &mut self.pending),
            Err(err) => warn!(%err, "skipping malformed stream chunk"),
        }
    }
}

/// Flatten one parsed chunk into events, preserving wire order: tool-call
/// fragments, then text, then usage.
fn push_chunk_events(chunk: ChatCompletionChunk, out: &mut VecDeque<ResponseEvent>) {
    for choice in chunk.choices {
        if let Some(calls) = choice.delta.tool_calls {
            for call in calls {
                let function = call.function.unwrap_or_default();
                out.push_back(ResponseEvent::ToolCall(ToolCallFragment {
                    index: call.index,
                    id: call.id.unwrap_or_default(),
                    name: function.name.unwrap_or_default(),
                    arguments: function.arguments.unwrap_or_default(),
                    kind: call.kind.unwrap_or_default(),
                }));
            }
        }
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                out.push_back(ResponseEvent::Delta(content));
            }
        }
    }
    if let Some(usage) = chunk.usage {
        out.push_back(ResponseEvent::Usage(usage.total_tokens));
    }
}

/// A live SSE response stream.
struct SseStream {
    response: reqwest::Response,
    parser: SseParser,
}

#[async_trait]
impl ResponseStream for SseStream {
    async fn recv(&mut self) -> Result<Option<ResponseEvent>> {
        loop {
            if let Some(event) = self.parser.next_event() {
                return Ok(Some(event));
            }
            if self.parser.is_exhausted() {
                return Ok(None);
            }
            match self.response.chunk().await? {
                Some(bytes) => self.parser.feed(&bytes),
                None => self.parser.end_of_input(),
            }
        }
    }
}
