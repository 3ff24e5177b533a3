//! Configuration for ChatRelay
//!
//! Config is environment-driven: the binary loads `.env` via dotenvy, the
//! library only reads already-set variables. [`Config::default`] yields a
//! usable offline configuration (memory store, no credentials), which is what
//! the tests run against.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{RelayError, Result};

/// Default cap on provider trips per round (first call plus tool-loop
/// re-invocations).
pub const DEFAULT_MAX_TOOL_TRIPS: usize = 5;

/// Default number of past exchanges included in the context window.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Engine configuration.
///
/// # Example
/// ```
/// use chatrelay::config::Config;
///
/// let config = Config::default();
/// assert_eq!(config.provider, "deepseek");
/// assert_eq!(config.max_tool_trips, 5);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Active provider name: `"deepseek"` or `"openrouter"`.
    pub provider: String,
    /// API key for the DeepSeek backend.
    pub deepseek_api_key: Option<String>,
    /// API key for the OpenRouter backend.
    pub openrouter_api_key: Option<String>,
    /// Optional forward proxy URL for all provider traffic.
    pub proxy: Option<String>,
    /// Cap on provider trips per round.
    pub max_tool_trips: usize,
    /// Past exchanges included when building context.
    pub history_limit: usize,
    /// Override for the data directory (history persistence).
    pub data_dir: Option<PathBuf>,
    /// Optional sampling controls forwarded to providers.
    pub sampling: Sampling,
}

/// Sampling controls passed through to the provider request. All optional;
/// unset fields are omitted from the wire body.
#[derive(Debug, Clone, Default)]
pub struct Sampling {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub stop: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            deepseek_api_key: None,
            openrouter_api_key: None,
            proxy: None,
            max_tool_trips: DEFAULT_MAX_TOOL_TRIPS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            data_dir: None,
            sampling: Sampling::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Recognized variables: `CHATRELAY_PROVIDER`, `DEEPSEEK_API_KEY`,
    /// `OPENROUTER_API_KEY`, `CHATRELAY_PROXY`, `CHATRELAY_MAX_TOOL_TRIPS`,
    /// `CHATRELAY_HISTORY_LIMIT`, `CHATRELAY_DATA_DIR`,
    /// `CHATRELAY_MAX_TOKENS`, `CHATRELAY_TEMPERATURE`, `CHATRELAY_TOP_P`,
    /// `CHATRELAY_FREQUENCY_PENALTY`, `CHATRELAY_PRESENCE_PENALTY`,
    /// `CHATRELAY_STOP` (comma-separated).
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when a numeric variable is set but does
    /// not parse.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        Ok(Self {
            provider: env_var("CHATRELAY_PROVIDER").unwrap_or(defaults.provider),
            deepseek_api_key: env_var("DEEPSEEK_API_KEY"),
            openrouter_api_key: env_var("OPENROUTER_API_KEY"),
            proxy: env_var("CHATRELAY_PROXY"),
            max_tool_trips: parse_value("CHATRELAY_MAX_TOOL_TRIPS", env_var("CHATRELAY_MAX_TOOL_TRIPS"))?
                .unwrap_or(defaults.max_tool_trips),
            history_limit: parse_value("CHATRELAY_HISTORY_LIMIT", env_var("CHATRELAY_HISTORY_LIMIT"))?
                .unwrap_or(defaults.history_limit),
            data_dir: env_var("CHATRELAY_DATA_DIR").map(PathBuf::from),
            sampling: Sampling {
                max_tokens: parse_value("CHATRELAY_MAX_TOKENS", env_var("CHATRELAY_MAX_TOKENS"))?,
                temperature: parse_value("CHATRELAY_TEMPERATURE", env_var("CHATRELAY_TEMPERATURE"))?,
                top_p: parse_value("CHATRELAY_TOP_P", env_var("CHATRELAY_TOP_P"))?,
                frequency_penalty: parse_value(
                    "CHATRELAY_FREQUENCY_PENALTY",
                    env_var("CHATRELAY_FREQUENCY_PENALTY"),
                )?,
                presence_penalty: parse_value(
                    "CHATRELAY_PRESENCE_PENALTY",
                    env_var("CHATRELAY_PRESENCE_PENALTY"),
                )?,
                stop: env_var("CHATRELAY_STOP").map(|raw| split_stop_list(&raw)),
            },
        })
    }

    /// Default data directory: `~/.chatrelay` (falls back to the current
    /// directory when no home directory is available).
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chatrelay")
    }

    /// Directory where the default history store persists exchanges, honoring
    /// the `data_dir` override.
    pub fn history_path(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(Config::dir)
            .join("history")
    }

    /// API key for the named provider, if configured.
    pub fn api_key_for(&self, provider: &str) -> Option<&str> {
        match provider {
            "deepseek" => self.deepseek_api_key.as_deref(),
            "openrouter" => self.openrouter_api_key.as_deref(),
            _ => None,
        }
    }
}

/// Read an environment variable, treating empty values as unset.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Parse an optional raw value, naming the variable in the error.
fn parse_value<T: FromStr>(name: &str, raw: Option<String>) -> Result<Option<T>> {
    match raw {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| RelayError::Config(format!("invalid value for {}: {:?}", name, raw))),
    }
}

/// Split a comma-separated stop list, dropping empty entries.
fn split_stop_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.provider, "deepseek");
        assert_eq!(config.max_tool_trips, DEFAULT_MAX_TOOL_TRIPS);
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
        assert!(config.deepseek_api_key.is_none());
        assert!(config.proxy.is_none());
        assert!(config.sampling.max_tokens.is_none());
    }

    #[test]
    fn test_parse_value_valid() {
        let parsed: Option<usize> = parse_value("X", Some("7".to_string())).unwrap();
        assert_eq!(parsed, Some(7));

        let parsed: Option<f32> = parse_value("X", Some(" 0.5 ".to_string())).unwrap();
        assert_eq!(parsed, Some(0.5));
    }

    #[test]
    fn test_parse_value_unset() {
        let parsed: Option<usize> = parse_value("X", None).unwrap();
        assert_eq!(parsed, None);
    }

    #[test]
    fn test_parse_value_invalid_names_variable() {
        let err = parse_value::<usize>("CHATRELAY_MAX_TOOL_TRIPS", Some("many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CHATRELAY_MAX_TOOL_TRIPS"));
    }

    #[test]
    fn test_split_stop_list() {
        assert_eq!(split_stop_list("END"), vec!["END"]);
        assert_eq!(split_stop_list("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_stop_list(" , ").is_empty());
    }

    #[test]
    fn test_api_key_for() {
        let config = Config {
            deepseek_api_key: Some("dk".to_string()),
            ..Config::default()
        };
        assert_eq!(config.api_key_for("deepseek"), Some("dk"));
        assert_eq!(config.api_key_for("openrouter"), None);
        assert_eq!(config.api_key_for("unknown"), None);
    }

    #[test]
    fn test_history_path_honors_override() {
        let config = Config {
            data_dir: Some(PathBuf::from("/tmp/relay-data")),
            ..Config::default()
        };
        assert_eq!(config.history_path(), PathBuf::from("/tmp/relay-data/history"));
    }
}
