//! Context building for rounds
//!
//! Builds the bounded message sequence sent to a provider: a window over the
//! user's persisted exchanges followed by the new prompt. Persisted tool
//! traces are spliced back between their question and answer so the provider
//! sees a protocol-valid transcript.

use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::history::{ChatMessage, HistoryStore};

/// Builds conversation context from stored history.
pub struct ContextBuilder {
    history: Arc<dyn HistoryStore>,
    history_limit: usize,
}

impl ContextBuilder {
    pub fn new(history: Arc<dyn HistoryStore>, history_limit: usize) -> Self {
        Self {
            history,
            history_limit,
        }
    }

    /// Assemble the messages for one round, oldest first, ending with the
    /// new prompt.
    ///
    /// Exchanges with an empty question or answer are skipped. A stored tool
    /// trace that fails to decode is logged and dropped; the exchange's
    /// question and answer still make it into the context.
    ///
    /// # Errors
    ///
    /// Propagates history-store failures.
    pub async fn build(&self, user_id: &str, prompt: &str) -> Result<Vec<ChatMessage>> {
        let exchanges = self
            .history
            .load_recent_exchanges(user_id, self.history_limit)
            .await?;

        let mut messages = Vec::with_capacity(exchanges.len() * 2 + 1);
        for exchange in &exchanges {
            if exchange.question.is_empty() || exchange.answer.is_empty() {
                continue;
            }
            messages.push(ChatMessage::user(&exchange.question));
            if let Some(trace) = &exchange.auxiliary_content {
                splice_trace(&mut messages, user_id, trace);
            }
            messages.push(ChatMessage::assistant(&exchange.answer));
        }
        messages.push(ChatMessage::user(prompt));
        Ok(messages)
    }
}

/// Decode a persisted tool trace and append it in original order.
fn splice_trace(messages: &mut Vec<ChatMessage>, user_id: &str, trace: &str) {
    match serde_json::from_str::<Vec<ChatMessage>>(trace) {
        Ok(spliced) => messages.extend(spliced),
        Err(err) => warn!(user_id, %err, "dropping undecodable tool trace"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{Exchange, HistoryManager, Role, ToolInvocation};

    async fn seeded(entries: &[(&str, &str)]) -> Arc<HistoryManager> {
        let manager = Arc::new(HistoryManager::new_memory());
        for (question, answer) in entries {
            manager
                .append_exchange("u1", Exchange::new(*question, *answer))
                .await
                .unwrap();
        }
        manager
    }

    #[tokio::test]
    async fn test_empty_history_yields_prompt_only() {
        let manager = Arc::new(HistoryManager::new_memory());
        let builder = ContextBuilder::new(manager, 10);

        let messages = builder.build("u1", "first question").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "first question");
    }

    #[tokio::test]
    async fn test_exchanges_in_order_prompt_last() {
        let manager = seeded(&[("q1", "a1"), ("q2", "a2")]).await;
        let builder = ContextBuilder::new(manager, 10);

        let messages = builder.build("u1", "q3").await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2", "a2", "q3"]);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[4].role, Role::User);
    }

    #[tokio::test]
    async fn test_window_keeps_most_recent() {
        let manager = Arc::new(HistoryManager::new_memory());
        for i in 0..12 {
            manager
                .append_exchange("u1", Exchange::new(format!("q{}", i), format!("a{}", i)))
                .await
                .unwrap();
        }
        let builder = ContextBuilder::new(manager, 10);

        let messages = builder.build("u1", "next").await.unwrap();
        // 10 exchanges * 2 + prompt
        assert_eq!(messages.len(), 21);
        assert_eq!(messages[0].content, "q2");
        assert_eq!(messages[19].content, "a11");
        assert_eq!(messages[20].content, "next");
    }

    #[tokio::test]
    async fn test_incomplete_exchanges_skipped() {
        let manager = seeded(&[("q1", "a1"), ("q2", ""), ("", "a3"), ("q4", "a4")]).await;
        let builder = ContextBuilder::new(manager, 10);

        let messages = builder.build("u1", "q5").await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "a1", "q4", "a4", "q5"]);
    }

    #[tokio::test]
    async fn test_tool_trace_spliced_between_question_and_answer() {
        let trace = vec![
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![ToolInvocation::new("call_1", "clock", "{}")],
            ),
            ChatMessage::tool_result("call_1", "12:00"),
        ];
        let exchange = Exchange::new("what time?", "It is noon.")
            .with_auxiliary(serde_json::to_string(&trace).unwrap());

        let manager = Arc::new(HistoryManager::new_memory());
        manager.append_exchange("u1", exchange).await.unwrap();
        let builder = ContextBuilder::new(manager, 10);

        let messages = builder.build("u1", "thanks").await.unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].content, "what time?");
        assert!(messages[1].has_tool_calls());
        assert_eq!(messages[2].role, Role::Tool);
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(messages[3].content, "It is noon.");
        assert_eq!(messages[4].content, "thanks");
    }

    #[tokio::test]
    async fn test_undecodable_trace_dropped_not_fatal() {
        let exchange = Exchange::new("q1", "a1").with_auxiliary("{broken");
        let manager = Arc::new(HistoryManager::new_memory());
        manager.append_exchange("u1", exchange).await.unwrap();
        let builder = ContextBuilder::new(manager, 10);

        let messages = builder.build("u1", "q2").await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2"]);
    }

    #[tokio::test]
    async fn test_users_isolated() {
        let manager = seeded(&[("q1", "a1")]).await;
        let builder = ContextBuilder::new(manager, 10);

        let messages = builder.build("other", "hello").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }
}
