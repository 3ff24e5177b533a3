//! Tool-call reassembly and dispatch
//!
//! Tool-call descriptors arrive fragmented across independent stream events:
//! a fragment carrying the call's name opens it, argument pieces follow with
//! no name, and fragments for different calls may interleave. The dispatcher
//! keeps an explicit keyed table (call index -> [`PendingToolCall`]) so an
//! interleaved stream can never append an argument piece to the wrong call,
//! probes the argument buffer for completeness after every append, and
//! executes each reassembled call at most once through the tool registry.
//!
//! A failed call (unparseable arguments, unknown tool, handler error) is
//! abandoned with a log line; the stream and the round continue without it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::history::{ChatMessage, ToolInvocation};
use crate::providers::ToolCallFragment;
use crate::tools::{ToolContext, ToolRegistry};

/// An in-progress reconstruction of one tool invocation.
#[derive(Debug)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
    kind: String,
    executed: bool,
    abandoned: bool,
}

impl PendingToolCall {
    fn settled(&self) -> bool {
        self.executed || self.abandoned
    }
}

/// Tool activity of one finished trip: the descriptors the model requested
/// and the results their execution produced, paired one to one.
#[derive(Debug, Clone)]
pub struct TripTools {
    /// Executed calls, in stream order. Every entry has a matching result.
    pub descriptors: Vec<ToolInvocation>,
    /// Tool-role result messages, in execution order.
    pub results: Vec<ChatMessage>,
}

/// Reassembles fragmented tool calls and executes them as they complete.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    ctx: ToolContext,
    calls: BTreeMap<usize, PendingToolCall>,
    results: Vec<(usize, ChatMessage)>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, ctx: ToolContext) -> Self {
        Self {
            registry,
            ctx,
            calls: BTreeMap::new(),
            results: Vec::new(),
        }
    }

    /// Fold one stream fragment into the table, executing the call if its
    /// argument buffer just became complete.
    ///
    /// Never fails the round: every failure mode abandons only the one call.
    pub async fn ingest(&mut self, fragment: ToolCallFragment) {
        let index = fragment.index;
        match self.calls.get_mut(&index) {
            None if !fragment.name.is_empty() => {
                debug!(tool = %fragment.name, index, "tool call opened");
                if !fragment.arguments.is_empty() {
                    warn!(
                        tool = %fragment.name,
                        index,
                        "opening fragment carries an argument tail"
                    );
                }
                self.calls.insert(
                    index,
                    PendingToolCall {
                        id: fragment.id,
                        name: fragment.name,
                        arguments: fragment.arguments,
                        kind: fragment.kind,
                        executed: false,
                        abandoned: false,
                    },
                );
            }
            None => {
                warn!(index, "argument fragment for an unopened tool call");
                return;
            }
            Some(call) => {
                if call.settled() {
                    return;
                }
                if !fragment.name.is_empty() {
                    // second opener for an index: first name wins
                    warn!(index, first = %call.name, dup = %fragment.name, "duplicate tool call opener");
                } else {
                    call.arguments.push_str(&fragment.arguments);
                }
                if call.id.is_empty() {
                    call.id = fragment.id;
                }
                if call.kind.is_empty() {
                    call.kind = fragment.kind;
                }
            }
        }
        self.try_dispatch(index).await;
    }

    /// Execute the call at `index` if its buffer parses as a JSON object.
    ///
    /// A parse failure here just means the arguments are still incomplete.
    async fn try_dispatch(&mut self, index: usize) {
        let Some(call) = self.calls.get(&index) else {
            return;
        };
        if call.settled() {
            return;
        }
        let Ok(args) = serde_json::from_str::<serde_json::Map<String, Value>>(&call.arguments)
        else {
            return;
        };

        let name = call.name.clone();
        let outcome = match self.registry.resolve(&name) {
            Some(tool) => tool.execute(Value::Object(args), &self.ctx).await,
            None => {
                warn!(tool = %name, index, "no handler registered, abandoning call");
                self.mark_abandoned(index);
                return;
            }
        };

        // table untouched across the await; re-borrow to record the outcome
        let Some(call) = self.calls.get_mut(&index) else {
            return;
        };
        match outcome {
            Ok(output) => {
                debug!(tool = %name, index, "tool call executed");
                call.executed = true;
                let result = ChatMessage::tool_result(call.id.clone(), output);
                self.results.push((index, result));
            }
            Err(err) => {
                warn!(tool = %name, index, %err, "tool execution failed, abandoning call");
                call.abandoned = true;
            }
        }
    }

    /// Fold in a call whose arguments arrived whole (non-streaming replies).
    ///
    /// Same parse, resolution and abandonment rules as the fragmented path.
    pub async fn ingest_whole(&mut self, index: usize, call: ToolInvocation) {
        debug!(tool = %call.name, index, "tool call received whole");
        self.calls.insert(
            index,
            PendingToolCall {
                id: call.id,
                name: call.name,
                arguments: call.arguments,
                kind: call.kind,
                executed: false,
                abandoned: false,
            },
        );
        self.try_dispatch(index).await;
    }

    fn mark_abandoned(&mut self, index: usize) {
        if let Some(call) = self.calls.get_mut(&index) {
            call.abandoned = true;
        }
    }

    /// The stream ended: any call still pending has a final buffer that never
    /// parsed, which is a terminal argument error for that call.
    pub fn finalize(&mut self) {
        for (index, call) in self.calls.iter_mut() {
            if !call.settled() {
                warn!(
                    tool = %call.name,
                    index,
                    buffer = %call.arguments,
                    "tool arguments never became valid JSON, abandoning call"
                );
                call.abandoned = true;
            }
        }
    }

    /// Whether this trip produced at least one executed call.
    pub fn has_results(&self) -> bool {
        !self.results.is_empty()
    }

    /// Consume the dispatcher, yielding the trip's tool activity.
    ///
    /// Descriptors cover only executed calls so every `tool_call_id` in the
    /// assistant message pairs with exactly one result message.
    pub fn into_trip_tools(self) -> Option<TripTools> {
        if self.results.is_empty() {
            return None;
        }
        let descriptors = self
            .calls
            .values()
            .filter(|call| call.executed)
            .map(|call| ToolInvocation {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                kind: if call.kind.is_empty() {
                    "function".to_string()
                } else {
                    call.kind.clone()
                },
            })
            .collect();
        let results = self.results.into_iter().map(|(_, msg)| msg).collect();
        Some(TripTools {
            descriptors,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::error::{RelayError, Result};
    use crate::tools::{EchoTool, Tool};

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
            Err(RelayError::ToolExecution("boom".into()))
        }
    }

    struct CountingTool {
        hits: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Tool for Arc<CountingTool> {
        fn name(&self) -> &str {
            "counter"
        }

        fn description(&self) -> &str {
            "Counts executions"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
            let n = self
                .hits
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(format!("hit {}", n + 1))
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(FailingTool));
        Arc::new(registry)
    }

    fn dispatcher() -> ToolDispatcher {
        ToolDispatcher::new(registry(), ToolContext::new())
    }

    fn opener(index: usize, id: &str, name: &str) -> ToolCallFragment {
        ToolCallFragment {
            index,
            id: id.to_string(),
            name: name.to_string(),
            kind: "function".to_string(),
            ..ToolCallFragment::default()
        }
    }

    fn args(index: usize, piece: &str) -> ToolCallFragment {
        ToolCallFragment {
            index,
            arguments: piece.to_string(),
            ..ToolCallFragment::default()
        }
    }

    #[tokio::test]
    async fn test_fragmented_call_reassembled_and_executed() {
        let mut dispatcher = dispatcher();
        dispatcher.ingest(opener(0, "call_1", "echo")).await;
        dispatcher.ingest(args(0, "{\"text\":")).await;
        assert!(!dispatcher.has_results()); // still incomplete
        dispatcher.ingest(args(0, " \"hi\"}")).await;

        assert!(dispatcher.has_results());
        let tools = dispatcher.into_trip_tools().unwrap();
        assert_eq!(tools.descriptors.len(), 1);
        assert_eq!(tools.descriptors[0].id, "call_1");
        assert_eq!(tools.descriptors[0].name, "echo");
        assert_eq!(tools.descriptors[0].arguments, "{\"text\": \"hi\"}");
        assert_eq!(tools.results.len(), 1);
        assert_eq!(tools.results[0].content, "hi");
        assert_eq!(tools.results[0].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn test_interleaved_indexes_do_not_cross_wires() {
        let mut dispatcher = dispatcher();
        dispatcher.ingest(opener(0, "call_a", "echo")).await;
        dispatcher.ingest(opener(1, "call_b", "echo")).await;
        // argument pieces alternate between the two calls
        dispatcher.ingest(args(1, "{\"text\":\"second\"")).await;
        dispatcher.ingest(args(0, "{\"text\":\"first\"")).await;
        dispatcher.ingest(args(0, "}")).await;
        dispatcher.ingest(args(1, "}")).await;

        let tools = dispatcher.into_trip_tools().unwrap();
        assert_eq!(tools.descriptors.len(), 2);
        assert_eq!(tools.descriptors[0].id, "call_a");
        assert_eq!(tools.descriptors[1].id, "call_b");
        // execution order follows buffer completion order
        assert_eq!(tools.results[0].content, "first");
        assert_eq!(tools.results[0].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(tools.results[1].content, "second");
        assert_eq!(tools.results[1].tool_call_id.as_deref(), Some("call_b"));
    }

    #[tokio::test]
    async fn test_call_executes_at_most_once() {
        let counter = Arc::new(CountingTool {
            hits: std::sync::atomic::AtomicUsize::new(0),
        });
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Arc::clone(&counter)));
        let mut dispatcher = ToolDispatcher::new(Arc::new(registry), ToolContext::new());

        dispatcher.ingest(opener(0, "c1", "counter")).await;
        dispatcher.ingest(args(0, "{}")).await;
        // stray fragments after completion are ignored
        dispatcher.ingest(args(0, "{}")).await;
        dispatcher.ingest(args(0, "garbage")).await;

        assert_eq!(counter.hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        let tools = dispatcher.into_trip_tools().unwrap();
        assert_eq!(tools.results.len(), 1);
        assert_eq!(tools.descriptors[0].arguments, "{}");
    }

    #[tokio::test]
    async fn test_opener_with_argument_tail_seeds_buffer() {
        let mut dispatcher = dispatcher();
        let mut fragment = opener(0, "c1", "echo");
        fragment.arguments = "{\"text\":\"all at once\"}".to_string();
        dispatcher.ingest(fragment).await;

        let tools = dispatcher.into_trip_tools().unwrap();
        assert_eq!(tools.results[0].content, "all at once");
    }

    #[tokio::test]
    async fn test_unknown_tool_abandoned_others_survive() {
        let mut dispatcher = dispatcher();
        dispatcher.ingest(opener(0, "c1", "missing")).await;
        dispatcher.ingest(args(0, "{}")).await;
        dispatcher.ingest(opener(1, "c2", "echo")).await;
        dispatcher.ingest(args(1, "{\"text\":\"ok\"}")).await;
        dispatcher.finalize();

        let tools = dispatcher.into_trip_tools().unwrap();
        assert_eq!(tools.descriptors.len(), 1);
        assert_eq!(tools.descriptors[0].name, "echo");
        assert_eq!(tools.results.len(), 1);
        assert_eq!(tools.results[0].content, "ok");
    }

    #[tokio::test]
    async fn test_execution_failure_abandons_call() {
        let mut dispatcher = dispatcher();
        dispatcher.ingest(opener(0, "c1", "broken")).await;
        dispatcher.ingest(args(0, "{}")).await;
        dispatcher.finalize();

        assert!(!dispatcher.has_results());
        assert!(dispatcher.into_trip_tools().is_none());
    }

    #[tokio::test]
    async fn test_unparseable_final_buffer_abandoned() {
        let mut dispatcher = dispatcher();
        dispatcher.ingest(opener(0, "c1", "echo")).await;
        dispatcher.ingest(args(0, "{\"text\": \"never closed")).await;
        dispatcher.finalize();

        assert!(dispatcher.into_trip_tools().is_none());
    }

    #[tokio::test]
    async fn test_non_object_arguments_rejected() {
        let mut dispatcher = dispatcher();
        dispatcher.ingest(opener(0, "c1", "echo")).await;
        // parses as JSON but not as a property map
        dispatcher.ingest(args(0, "[1, 2]")).await;
        dispatcher.finalize();

        assert!(dispatcher.into_trip_tools().is_none());
    }

    #[tokio::test]
    async fn test_argument_fragment_without_opener_dropped() {
        let mut dispatcher = dispatcher();
        dispatcher.ingest(args(3, "{\"text\":\"orphan\"}")).await;
        dispatcher.finalize();

        assert!(dispatcher.into_trip_tools().is_none());
    }

    #[tokio::test]
    async fn test_id_captured_once_first_wins() {
        let mut dispatcher = dispatcher();
        let mut first = opener(0, "", "echo");
        first.kind = String::new();
        dispatcher.ingest(first).await;
        // id and kind arrive on a later fragment
        let mut late = args(0, "{\"text\":\"x\"");
        late.id = "late_id".to_string();
        late.kind = "function".to_string();
        dispatcher.ingest(late).await;
        let mut ignored = args(0, "}");
        ignored.id = "other_id".to_string();
        dispatcher.ingest(ignored).await;

        let tools = dispatcher.into_trip_tools().unwrap();
        assert_eq!(tools.descriptors[0].id, "late_id");
        assert_eq!(tools.results[0].tool_call_id.as_deref(), Some("late_id"));
    }

    #[tokio::test]
    async fn test_duplicate_opener_keeps_first_name() {
        let mut dispatcher = dispatcher();
        dispatcher.ingest(opener(0, "c1", "echo")).await;
        dispatcher.ingest(opener(0, "c9", "broken")).await;
        dispatcher.ingest(args(0, "{\"text\":\"kept\"}")).await;

        let tools = dispatcher.into_trip_tools().unwrap();
        assert_eq!(tools.descriptors[0].name, "echo");
        assert_eq!(tools.descriptors[0].id, "c1");
        assert_eq!(tools.results[0].content, "kept");
    }

    #[tokio::test]
    async fn test_whole_call_executes_without_fragmentation() {
        let mut dispatcher = dispatcher();
        dispatcher
            .ingest_whole(0, ToolInvocation::new("c1", "echo", "{\"text\":\"whole\"}"))
            .await;
        dispatcher
            .ingest_whole(1, ToolInvocation::new("c2", "missing", "{}"))
            .await;
        dispatcher.finalize();

        let tools = dispatcher.into_trip_tools().unwrap();
        assert_eq!(tools.descriptors.len(), 1);
        assert_eq!(tools.results[0].content, "whole");
        assert_eq!(tools.results[0].tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_no_tool_activity_yields_none() {
        let mut dispatcher = dispatcher();
        dispatcher.finalize();
        assert!(!dispatcher.has_results());
        assert!(dispatcher.into_trip_tools().is_none());
    }
}
