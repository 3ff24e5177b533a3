//! Agent module - round orchestration and conversation handling
//!
//! This module drives one user prompt to a final answer. The round loop is
//! responsible for:
//!
//! - Admitting one round per user at a time
//! - Building conversation context from stored history
//! - Streaming provider responses and re-chunking them into segments
//! - Reassembling fragmented tool calls, executing them, and feeding results
//!   back to the model
//! - Persisting the finished exchange and recording usage
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Caller    │────>│  RoundLoop  │────>│  Provider   │
//! │ (RoundHandle│     │ (state      │     │ (DeepSeek / │
//! │  segments)  │<────│  machine)   │<────│  OpenRouter)│
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   │
//!                            │                   │
//!                            ▼                   ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │   History   │     │    Tools    │
//!                     │   Manager   │     │  Registry   │
//!                     └─────────────┘     └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chatrelay::agent::RoundLoop;
//! use chatrelay::config::Config;
//! use chatrelay::history::HistoryManager;
//! use chatrelay::metrics::UsageMetrics;
//! use chatrelay::providers;
//! use chatrelay::tools::ToolRegistry;
//!
//! async fn run_round() {
//!     let config = Config::from_env().unwrap();
//!     let provider = providers::from_config(&config).unwrap();
//!     let round_loop = RoundLoop::new(
//!         config,
//!         Arc::new(HistoryManager::new_memory()),
//!         provider,
//!         Arc::new(ToolRegistry::with_builtins()),
//!         Arc::new(UsageMetrics::new()),
//!     );
//!
//!     let mut handle = round_loop.begin_round("alice", "hello").unwrap();
//!     while let Some(segment) = handle.next_segment().await {
//!         print!("{}", segment.content);
//!     }
//!     let outcome = handle.outcome().await.unwrap();
//!     println!("({} tokens)", outcome.token_cost);
//! }
//! ```

mod context;
mod dispatch;
mod guard;
mod r#loop;

pub use context::ContextBuilder;
pub use dispatch::{ToolDispatcher, TripTools};
pub use guard::{ActiveRounds, RoundPermit};
pub use r#loop::{RoundHandle, RoundLoop, RoundOutcome};
