use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HiveError, Result};

/// Top-level configuration, loaded from `hive.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

/// Which model client to build and the default request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider name, resolved through the client registry.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_provider() -> String { "scripted".to_string() }
fn default_model_id() -> String { "gpt-3.5-turbo".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_request_timeout() -> u64 { 60 }

/// Turn-loop behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Execute tool calls, or hand them back to the caller unexecuted.
    #[serde(default = "default_true")]
    pub execute_tools: bool,
    /// Allow concurrent tool execution for agents that opt in.
    #[serde(default)]
    pub parallel_tools: bool,
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            execute_tools: true,
            parallel_tools: false,
            tool_timeout_secs: default_tool_timeout(),
        }
    }
}

fn default_max_turns() -> usize { 10 }
fn default_true() -> bool { true }
fn default_tool_timeout() -> u64 { 30 }

/// What to do when the provider reports a rate limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStrategy {
    /// Exponential backoff with jitter, bounded by `max_retries`.
    #[default]
    Retry,
    /// Surface the rate-limit error immediately.
    Fail,
    /// Wait in line: exponential backoff without jitter.
    Queue,
}

/// Retry configuration for model requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub rate_limit_strategy: RateLimitStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff(),
            max_backoff_ms: default_max_backoff(),
            rate_limit_strategy: RateLimitStrategy::default(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Workflow graph limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Visits allowed per node before the run is treated as looping.
    #[serde(default = "default_max_visits")]
    pub max_visits: u32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_visits: default_max_visits(),
        }
    }
}

fn default_max_visits() -> u32 { 10 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound on concurrently running invocations. Unbounded when unset.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_short_term_capacity")]
    pub short_term_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_capacity: default_short_term_capacity(),
        }
    }
}

fn default_short_term_capacity() -> usize { 100 }

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Reading config");
        let content = std::fs::read_to_string(path)
            .map_err(|_| HiveError::ConfigNotFound(path.display().to_string()))?;

        Self::from_toml(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| HiveError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| HiveError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay verbatim
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
