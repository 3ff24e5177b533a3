//! Round orchestration
//!
//! [`RoundLoop`] drives one user prompt to a final answer. A round is an
//! explicit bounded state machine:
//!
//! ```text
//! START -> STREAMING -> (TOOLS_PENDING -> STREAMING)* -> DONE
//!                 \-> FAILED
//! ```
//!
//! Each `STREAMING` entry is one provider trip: open a stream, feed text
//! deltas to the [`SegmentWriter`], feed tool-call fragments to the
//! [`ToolDispatcher`]. A trip that executed tools re-enters `STREAMING` with
//! the results appended to the context, up to a configured trip cap. The
//! machine is a `loop` over a state enum, so the cap is structural, not a
//! recursion depth hoped to hold.
//!
//! `DONE` persists one exchange (prompt, cumulative answer, tool trace,
//! token cost); `FAILED` persists nothing and whatever segments were already
//! delivered stay delivered.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::history::{ChatMessage, Exchange, HistoryStore};
use crate::metrics::UsageMetrics;
use crate::providers::{Provider, ResponseEvent};
use crate::segment::{Segment, SegmentWriter};
use crate::tools::{ToolContext, ToolRegistry};

use super::context::ContextBuilder;
use super::dispatch::{ToolDispatcher, TripTools};
use super::guard::ActiveRounds;

/// Buffered segments between a round task and its consumer. The channel is
/// bounded so a slow consumer applies backpressure instead of growing memory.
const SEGMENT_CHANNEL_CAPACITY: usize = 32;

/// Terminal accounting of a successful round.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    /// Cumulative assistant text across all trips.
    pub answer: String,
    /// Total tokens the round consumed.
    pub token_cost: u64,
    /// Provider trips taken (1 for a round without tool calls).
    pub trips: usize,
}

/// Caller's view of a running round: the ordered segment stream, the
/// cancellation token, and the terminal outcome.
#[derive(Debug)]
pub struct RoundHandle {
    segments: mpsc::Receiver<Segment>,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<Result<RoundOutcome>>,
}

impl RoundHandle {
    /// Next segment in emission order; `None` once the round has closed the
    /// channel (exactly once, on `DONE` and `FAILED` alike).
    pub async fn next_segment(&mut self) -> Option<Segment> {
        self.segments.recv().await
    }

    /// Abort the round at its next suspension point. The round fails with
    /// [`RelayError::Cancelled`] and persists nothing.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token a caller can hold to cancel after moving the handle elsewhere.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the round to finish. Unconsumed segments are drained and
    /// discarded so the round never blocks on the bounded channel.
    pub async fn outcome(mut self) -> Result<RoundOutcome> {
        while self.segments.recv().await.is_some() {}
        match self.outcome.await {
            Ok(result) => result,
            // the round task went away without reporting
            Err(_) => Err(RelayError::Cancelled),
        }
    }
}

/// The orchestration engine. One instance serves all users; each round runs
/// as its own task.
pub struct RoundLoop {
    config: Config,
    history: Arc<dyn HistoryStore>,
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    metrics: Arc<UsageMetrics>,
    rounds: Arc<ActiveRounds>,
}

impl RoundLoop {
    pub fn new(
        config: Config,
        history: Arc<dyn HistoryStore>,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        metrics: Arc<UsageMetrics>,
    ) -> Self {
        Self {
            config,
            history,
            provider,
            tools,
            metrics,
            rounds: Arc::new(ActiveRounds::new()),
        }
    }

    /// Whether the user has a round in flight.
    pub fn is_busy(&self, user_id: &str) -> bool {
        self.rounds.is_active(user_id)
    }

    /// Start a streaming round for `user_id`.
    ///
    /// The round runs as a spawned task; the returned handle carries its
    /// segment stream and outcome. The per-user slot is claimed before the
    /// task starts and released when it ends, whatever the exit path.
    ///
    /// # Errors
    ///
    /// [`RelayError::ChatBusy`] when the user's previous round is still
    /// active.
    pub fn begin_round(&self, user_id: &str, prompt: &str) -> Result<RoundHandle> {
        let permit = self.rounds.acquire(user_id)?;
        let (segment_tx, segment_rx) = mpsc::channel(SEGMENT_CHANNEL_CAPACITY);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let task = RoundTask {
            config: self.config.clone(),
            history: Arc::clone(&self.history),
            provider: Arc::clone(&self.provider),
            tools: Arc::clone(&self.tools),
            metrics: Arc::clone(&self.metrics),
            round_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            prompt: prompt.to_string(),
            cancel: cancel.clone(),
        };
        tokio::spawn(async move {
            let _permit = permit;
            let result = task.run(segment_tx).await;
            if let Err(err) = &result {
                warn!(round_id = %task.round_id, user_id = %task.user_id, %err, "round failed");
            }
            // the caller may have dropped the handle; nothing to do then
            let _ = outcome_tx.send(result);
        });

        Ok(RoundHandle {
            segments: segment_rx,
            cancel,
            outcome: outcome_rx,
        })
    }

    /// Run a non-streaming round to completion: same state machine, one
    /// blocking completion per trip, tool arguments arriving whole.
    ///
    /// # Errors
    ///
    /// [`RelayError::ChatBusy`] when the user already has a round in flight;
    /// otherwise the same failure modes as a streaming round.
    pub async fn ask_once(&self, user_id: &str, prompt: &str) -> Result<RoundOutcome> {
        let _permit = self.rounds.acquire(user_id)?;
        let round_id = Uuid::new_v4();
        let started = Instant::now();

        let mode = self.history.get_user_mode(user_id).await?;
        let model = self.provider.select_model(mode.as_deref());
        let builder = ContextBuilder::new(Arc::clone(&self.history), self.config.history_limit);
        let mut messages = builder.build(user_id, prompt).await?;

        let mut trace: Vec<ChatMessage> = Vec::new();
        let mut answer = String::new();
        let mut token_cost = 0u64;
        let mut trips = 0usize;

        loop {
            trips += 1;
            if trips > self.config.max_tool_trips {
                return Err(RelayError::LoopLimitExceeded(self.config.max_tool_trips));
            }
            let request = self
                .provider
                .encode(&model, messages.clone(), self.tools.specs());
            let reply = self.provider.invoke_sync(&request).await?;
            self.metrics
                .record_tokens(self.provider.name(), reply.total_tokens);
            token_cost += reply.total_tokens;
            answer.push_str(&reply.content);

            if reply.tool_calls.is_empty() {
                break;
            }
            let ctx = ToolContext::new().with_user(user_id);
            let mut dispatcher = ToolDispatcher::new(Arc::clone(&self.tools), ctx);
            for (index, call) in reply.tool_calls.into_iter().enumerate() {
                dispatcher.ingest_whole(index, call).await;
            }
            dispatcher.finalize();
            let Some(tools) = dispatcher.into_trip_tools() else {
                // every requested call was abandoned; finish with the text
                // produced so far
                break;
            };
            let assistant = ChatMessage::assistant_with_tool_calls(answer.clone(), tools.descriptors);
            messages.push(assistant.clone());
            trace.push(assistant);
            for result in tools.results {
                messages.push(result.clone());
                trace.push(result);
            }
        }

        let mut exchange = Exchange::new(prompt, answer.clone()).with_token_cost(token_cost);
        if !trace.is_empty() {
            exchange = exchange.with_auxiliary(serde_json::to_string(&trace)?);
        }
        self.history.append_exchange(user_id, exchange).await?;
        self.metrics
            .record_round(self.provider.name(), started.elapsed());
        info!(round_id = %round_id, user_id, trips, tokens = token_cost, "round complete");
        Ok(RoundOutcome {
            answer,
            token_cost,
            trips,
        })
    }
}

/// Loop states. Failure is not a state here: errors propagate as `Result`
/// and the task's exit paths handle them uniformly.
enum RoundState {
    Streaming,
    ToolsPending(TripTools),
    Done,
}

/// Everything one round task owns.
struct RoundTask {
    config: Config,
    history: Arc<dyn HistoryStore>,
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    metrics: Arc<UsageMetrics>,
    round_id: Uuid,
    user_id: String,
    prompt: String,
    cancel: CancellationToken,
}

impl RoundTask {
    async fn run(&self, segment_tx: mpsc::Sender<Segment>) -> Result<RoundOutcome> {
        let started = Instant::now();
        let mut writer = SegmentWriter::new(segment_tx);
        let mut trace: Vec<ChatMessage> = Vec::new();
        let mut trips = 0usize;

        self.drive(&mut writer, &mut trace, &mut trips).await?;

        let (answer, token_cost) = writer.finish().await?;
        let mut exchange =
            Exchange::new(self.prompt.clone(), answer.clone()).with_token_cost(token_cost);
        if !trace.is_empty() {
            exchange = exchange.with_auxiliary(serde_json::to_string(&trace)?);
        }
        self.history.append_exchange(&self.user_id, exchange).await?;
        self.metrics
            .record_round(self.provider.name(), started.elapsed());
        info!(
            round_id = %self.round_id,
            user_id = %self.user_id,
            trips,
            tokens = token_cost,
            "round complete"
        );
        Ok(RoundOutcome {
            answer,
            token_cost,
            trips,
        })
    }

    /// The state machine proper. Returns when the round reaches `DONE`;
    /// any error is the `FAILED` transition.
    async fn drive(
        &self,
        writer: &mut SegmentWriter,
        trace: &mut Vec<ChatMessage>,
        trips: &mut usize,
    ) -> Result<()> {
        let mode = self.history.get_user_mode(&self.user_id).await?;
        let model = self.provider.select_model(mode.as_deref());
        let builder = ContextBuilder::new(Arc::clone(&self.history), self.config.history_limit);
        let mut messages = builder.build(&self.user_id, &self.prompt).await?;
        debug!(
            round_id = %self.round_id,
            user_id = %self.user_id,
            model = %model,
            context = messages.len(),
            "round started"
        );

        let mut state = RoundState::Streaming;
        loop {
            state = match state {
                RoundState::Streaming => {
                    *trips += 1;
                    // checked before touching the network, so the failing
                    // trip costs nothing
                    if *trips > self.config.max_tool_trips {
                        return Err(RelayError::LoopLimitExceeded(self.config.max_tool_trips));
                    }
                    match self.run_trip(&model, &messages, writer).await? {
                        Some(tools) => RoundState::ToolsPending(tools),
                        None => RoundState::Done,
                    }
                }
                RoundState::ToolsPending(tools) => {
                    let assistant = ChatMessage::assistant_with_tool_calls(
                        writer.full_content(),
                        tools.descriptors,
                    );
                    messages.push(assistant.clone());
                    trace.push(assistant);
                    for result in tools.results {
                        messages.push(result.clone());
                        trace.push(result);
                    }
                    writer.begin_trip();
                    RoundState::Streaming
                }
                RoundState::Done => return Ok(()),
            };
        }
    }

    /// One provider trip: stream events into the writer and the dispatcher
    /// until the stream completes.
    ///
    /// Returns the trip's executed tool activity, `None` when the model
    /// produced a final answer.
    async fn run_trip(
        &self,
        model: &str,
        messages: &[ChatMessage],
        writer: &mut SegmentWriter,
    ) -> Result<Option<TripTools>> {
        let request = self
            .provider
            .encode(model, messages.to_vec(), self.tools.specs());
        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
            opened = self.provider.open_stream(&request) => opened?,
        };

        let ctx = ToolContext::new().with_user(&self.user_id);
        let mut dispatcher = ToolDispatcher::new(Arc::clone(&self.tools), ctx);
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
                event = stream.recv() => event?,
            };
            match event {
                Some(ResponseEvent::Delta(text)) => writer.push(&text).await?,
                Some(ResponseEvent::ToolCall(fragment)) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
                        () = dispatcher.ingest(fragment) => {}
                    }
                }
                Some(ResponseEvent::Usage(tokens)) => {
                    writer.add_tokens(tokens);
                    self.metrics.record_tokens(self.provider.name(), tokens);
                }
                Some(ResponseEvent::Done) | None => break,
            }
        }
        dispatcher.finalize();
        writer.flush_trailing().await?;
        Ok(dispatcher.into_trip_tools())
    }
}
