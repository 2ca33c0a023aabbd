use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use hive_core::error::Result;

use super::state::GraphState;

/// Picks a destination node id from the current state.
///
/// An `Err` means "this edge does not match"; the executor moves on to the
/// next edge.
pub type RouterFn = Arc<dyn Fn(&GraphState) -> Result<String> + Send + Sync>;

/// How an edge decides whether it fires.
#[derive(Clone)]
pub enum EdgeKind {
    /// Always traverse this edge.
    Standard,
    /// Traverse to whatever non-empty id the router returns.
    Conditional(RouterFn),
    /// Traverse only when no other outgoing edge matched.
    Fallback,
}

impl fmt::Debug for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => f.write_str("Standard"),
            Self::Conditional(_) => f.write_str("Conditional"),
            Self::Fallback => f.write_str("Fallback"),
        }
    }
}

/// A directed transition between two nodes.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: String,
    /// Target node. For conditional edges this is the declared destination;
    /// the router's answer decides where the run actually goes.
    pub to: String,
    pub kind: EdgeKind,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Edge {
    pub fn standard(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_kind(from, to, EdgeKind::Standard)
    }

    pub fn conditional<F>(from: impl Into<String>, to: impl Into<String>, router: F) -> Self
    where
        F: Fn(&GraphState) -> Result<String> + Send + Sync + 'static,
    {
        Self::with_kind(from, to, EdgeKind::Conditional(Arc::new(router)))
    }

    pub fn fallback(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_kind(from, to, EdgeKind::Fallback)
    }

    pub fn with_kind(from: impl Into<String>, to: impl Into<String>, kind: EdgeKind) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.kind, EdgeKind::Fallback)
    }
}
