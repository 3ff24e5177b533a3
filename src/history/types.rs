//! Core history types: exchanges, chat messages, and tool invocations.
//!
//! [`ChatMessage`] is the provider-neutral message form used for context
//! building; adapters encode it into their own wire shape. The same form,
//! serialized as JSON, is what [`Exchange::auxiliary_content`] stores for
//! tool-call traces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One resolved question/answer pair in a user's history.
///
/// Created in memory when a round begins and persisted once the round
/// finishes; never mutated after persistence. `answer` may be empty only for
/// rounds that produced tool activity without user-visible text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    /// The user's prompt.
    pub question: String,
    /// The assistant's final text, cumulative across tool trips.
    pub answer: String,
    /// Serialized tool-call trace for this exchange, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary_content: Option<String>,
    /// Total tokens the round consumed.
    #[serde(default)]
    pub token_cost: u64,
    /// When the round finished.
    pub created_at: DateTime<Utc>,
}

impl Exchange {
    /// Create an exchange with the current timestamp.
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            auxiliary_content: None,
            token_cost: 0,
            created_at: Utc::now(),
        }
    }

    /// Attach a serialized tool trace.
    pub fn with_auxiliary(mut self, trace: impl Into<String>) -> Self {
        self.auxiliary_content = Some(trace.into());
        self
    }

    /// Set the token cost.
    pub fn with_token_cost(mut self, tokens: u64) -> Self {
        self.token_cost = tokens;
        self
    }
}

/// Message role in a conversation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One completed tool-call descriptor, as the model requested it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Provider-assigned call id, echoed back by the tool result.
    pub id: String,
    /// Tool name to resolve in the registry.
    pub name: String,
    /// Raw JSON argument string.
    pub arguments: String,
    /// Wire `type` field, normally `"function"`.
    #[serde(rename = "type")]
    pub kind: String,
}

impl ToolInvocation {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
            kind: "function".to_string(),
        }
    }
}

/// A role-tagged message in a conversation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Tool calls carried by an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolInvocation>>,
    /// For tool-role messages: the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Assistant message carrying the tool calls it requested.
    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        calls: Vec<ToolInvocation>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// Tool-role message binding a result to its call id.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool && self.tool_call_id.is_some()
    }
}

/// Everything persisted for one user: exchange history plus the preferred
/// model mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserHistory {
    /// The owning user.
    pub user_id: String,
    /// Preferred model mode, honored when the active provider supports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Exchanges in completion order, oldest first.
    #[serde(default)]
    pub exchanges: Vec<Exchange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserHistory {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            mode: None,
            exchanges: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append an exchange and bump the update timestamp.
    pub fn add_exchange(&mut self, exchange: Exchange) {
        self.exchanges.push(exchange);
        self.updated_at = Utc::now();
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// The most recent `limit` exchanges, oldest first.
    pub fn recent(&self, limit: usize) -> &[Exchange] {
        let start = self.exchanges.len().saturating_sub(limit);
        &self.exchanges[start..]
    }
}
