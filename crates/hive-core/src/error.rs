use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a model provider failure should be treated by the retry policy.
///
/// The classification is attached by the model client that produced the
/// error, never inferred from the error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Quota or rate limit hit; retried with exponential backoff.
    RateLimited,
    /// Authentication failure, unknown model, malformed request. Never retried.
    Fatal,
    /// Timeouts, transport failures, 5xx responses. Retried with linear backoff.
    Transient,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::RateLimited => "rate limited",
            Self::Fatal => "fatal",
            Self::Transient => "transient",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum HiveError {
    // Precondition errors
    #[error("agent cannot be nil")]
    NilAgent,

    #[error("model client is not initialized")]
    ClientNotReady,

    #[error("Model provider not supported: {0}")]
    UnsupportedProvider(String),

    // Provider errors
    #[error("{kind} provider error: {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("max retries exceeded after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        source: Box<HiveError>,
    },

    #[error("no choices in response")]
    EmptyResponse,

    #[error("stream ended with unterminated tool calls: {0}")]
    StreamIncomplete(String),

    // Tool errors
    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    // Graph errors
    #[error("no entry point defined")]
    MissingEntryPoint,

    #[error("node {0} not found")]
    UnknownNode(String),

    #[error("graph {0} not found")]
    UnknownGraph(String),

    #[error("potential infinite loop detected at node {node}")]
    InfiniteLoop { node: String, visits: u32 },

    #[error("error processing node {node}: {source}")]
    NodeFailed {
        node: String,
        source: Box<HiveError>,
    },

    #[error("node {0} has no outgoing edges")]
    NoOutgoingEdges(String),

    #[error("no valid transition from node {0}")]
    NoValidTransition(String),

    #[error("cycle from {from} to {to} stopped: {reason}")]
    CycleRejected {
        from: String,
        to: String,
        reason: String,
    },

    // Routing errors
    #[error("no suitable worker found for task type: {0}")]
    NoSuitableWorker(String),

    #[error("dispatch unit {0} panicked")]
    UnitPanicked(String),

    #[error("Cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HiveError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::Provider {
            kind: ProviderErrorKind::RateLimited,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Provider {
            kind: ProviderErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Provider {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Provider classification, if this error came from a model client.
    pub fn provider_kind(&self) -> Option<ProviderErrorKind> {
        match self {
            Self::Provider { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, HiveError>;
