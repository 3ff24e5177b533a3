//! chatrelay - streaming LLM round orchestration
//!
//! chatrelay turns one user prompt into one finished exchange: it builds a
//! bounded context from the user's history, streams the model's reply while
//! re-chunking it into transport-sized segments, reassembles and executes
//! tool calls the model requests mid-stream, feeds the results back for
//! follow-up trips, and persists the finished exchange with its token cost.
//!
//! # Modules
//!
//! - [`agent`] - the round state machine, context building, tool dispatch
//! - [`providers`] - OpenAI-compatible backends (DeepSeek, OpenRouter)
//! - [`segment`] - streaming delta aggregation into transport segments
//! - [`history`] - per-user exchange storage with optional file persistence
//! - [`tools`] - the tool trait, registry, and built-ins
//! - [`metrics`] - process-wide token and duration accounting
//! - [`config`] - environment-driven configuration
//! - [`error`] - the crate-wide error type

pub mod agent;
pub mod config;
pub mod error;
pub mod history;
pub mod metrics;
pub mod providers;
pub mod segment;
pub mod tools;

pub use agent::{RoundHandle, RoundLoop, RoundOutcome};
pub use config::Config;
pub use error::{RelayError, Result};
pub use history::{Exchange, HistoryManager, HistoryStore};
pub use metrics::UsageMetrics;
pub use providers::Provider;
pub use segment::Segment;
pub use tools::{Tool, ToolContext, ToolRegistry};
