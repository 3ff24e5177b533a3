//! chatrelay: terminal front-end for the round orchestration engine.
//!
//! Subcommands:
//! - `chat`: interactive REPL. Transport segments stream to stdout in
//!   emission order, each rendered as one outbound message.
//! - `ask`: one-shot non-streaming round, prints the final answer.
//! - `history`: prints the stored context window for a user.
//!
//! Configuration comes from the environment (plus `.env` via dotenvy); see
//! [`chatrelay::config::Config`] for the recognized variables.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use tracing::debug;

use chatrelay::config::DEFAULT_HISTORY_LIMIT;
use chatrelay::providers;
use chatrelay::{
    Config, Exchange, HistoryManager, HistoryStore, RoundLoop, ToolRegistry, UsageMetrics,
};

#[derive(Parser)]
#[command(name = "chatrelay", version, about = "Streaming LLM rounds with tool orchestration")]
struct Cli {
    /// User id that rounds and history are keyed by.
    #[arg(long, global = true, default_value = "local")]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat. Each transport segment prints as its own message.
    Chat,
    /// Run a single round and print the answer.
    Ask {
        /// Prompt text (words are joined with spaces).
        #[arg(required = true)]
        prompt: Vec<String>,
    },
    /// Show stored exchanges for the user.
    History {
        /// Most recent exchanges to show.
        #[arg(short = 'n', long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so the chat stream owns stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatrelay=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;

    match cli.command {
        Command::Chat => run_chat(config, &cli.user).await,
        Command::Ask { prompt } => run_ask(config, &cli.user, &prompt.join(" ")).await,
        Command::History { limit } => run_history(config, &cli.user, limit).await,
    }
}

/// Wire up the engine: persistent history, the configured provider, built-in
/// tools, and a fresh metrics sink.
fn build_engine(
    config: Config,
) -> anyhow::Result<(RoundLoop, Arc<HistoryManager>, Arc<UsageMetrics>)> {
    let history = Arc::new(
        HistoryManager::with_path(config.history_path()).context("failed to open history store")?,
    );
    let provider = providers::from_config(&config).context("failed to build provider")?;
    let tools = Arc::new(ToolRegistry::with_builtins());
    let metrics = Arc::new(UsageMetrics::new());
    let relay = RoundLoop::new(
        config,
        Arc::clone(&history) as Arc<dyn HistoryStore>,
        provider,
        tools,
        Arc::clone(&metrics),
    );
    Ok((relay, history, metrics))
}

async fn run_ask(config: Config, user: &str, prompt: &str) -> anyhow::Result<()> {
    let (relay, _history, _metrics) = build_engine(config)?;
    let outcome = relay.ask_once(user, prompt).await?;
    debug!(trips = outcome.trips, tokens = outcome.token_cost, "round finished");
    println!("{}", outcome.answer);
    Ok(())
}

async fn run_history(config: Config, user: &str, limit: usize) -> anyhow::Result<()> {
    let history =
        HistoryManager::with_path(config.history_path()).context("failed to open history store")?;
    let exchanges = history.load_recent_exchanges(user, limit).await?;
    if exchanges.is_empty() {
        println!("no stored history for {user}");
    } else {
        print_exchanges(&exchanges);
    }
    Ok(())
}

async fn run_chat(config: Config, user: &str) -> anyhow::Result<()> {
    let history_limit = config.history_limit;
    let (relay, history, metrics) = build_engine(config)?;

    println!("chatrelay - /help for commands, /quit to leave");
    let mut rl = rustyline::DefaultEditor::new().context("failed to start line editor")?;

    loop {
        let line = match rl.readline("you> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("(interrupted - /quit to leave)");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err).context("terminal input failed"),
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(&line);

        if let Some(rest) = line.strip_prefix('/') {
            let mut parts = rest.splitn(2, char::is_whitespace);
            let name = parts.next().unwrap_or("");
            let arg = parts.next().map(str::trim).filter(|s| !s.is_empty());
            match name {
                "quit" | "exit" => break,
                "help" => print_help(),
                "stats" => println!("{}", metrics.snapshot()),
                "mode" => match arg {
                    None => {
                        let mode = history.get_user_mode(user).await?;
                        println!("mode: {}", mode.as_deref().unwrap_or("default"));
                    }
                    Some("default") => {
                        history.set_user_mode(user, None).await?;
                        println!("mode cleared");
                    }
                    Some(mode) => {
                        history.set_user_mode(user, Some(mode.to_string())).await?;
                        println!("mode set to {mode}");
                    }
                },
                "history" => {
                    let exchanges = history.load_recent_exchanges(user, history_limit).await?;
                    if exchanges.is_empty() {
                        println!("no stored history yet");
                    } else {
                        print_exchanges(&exchanges);
                    }
                }
                other => println!("unknown command /{other} - try /help"),
            }
            continue;
        }

        if let Err(err) = run_round(&relay, user, &line).await {
            eprintln!("error: {err}");
        }
    }

    println!("bye");
    Ok(())
}

/// Drive one streaming round: print each segment as it lands; Ctrl+C cancels
/// the round without leaving the REPL.
async fn run_round(relay: &RoundLoop, user: &str, prompt: &str) -> chatrelay::Result<()> {
    let mut handle = relay.begin_round(user, prompt)?;
    loop {
        tokio::select! {
            segment = handle.next_segment() => match segment {
                Some(segment) => println!("bot> {}", segment.content),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("(cancelling)");
                handle.cancel();
            }
        }
    }
    let outcome = handle.outcome().await?;
    if outcome.token_cost > 0 {
        println!("({} tokens, {} trips)", outcome.token_cost, outcome.trips);
    }
    Ok(())
}

fn print_exchanges(exchanges: &[Exchange]) {
    for exchange in exchanges {
        println!(
            "[{}] you: {}",
            exchange.created_at.format("%Y-%m-%d %H:%M"),
            exchange.question
        );
        if exchange.answer.is_empty() {
            println!("     bot: (tool activity only)");
        } else {
            println!("     bot: {}", exchange.answer);
        }
    }
}

fn print_help() {
    println!("/mode <m>   pick a model mode (/mode default to clear)");
    println!("/stats      aggregate token usage this session");
    println!("/history    stored exchanges for this user");
    println!("/quit       leave");
}
