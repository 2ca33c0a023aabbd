use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use hive_core::error::Result;
use hive_core::traits::MemoryStore;
use hive_core::types::{ContextVariables, MemoryEntry};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    short_term: VecDeque<MemoryEntry>,
    #[serde(default)]
    long_term: HashMap<String, Vec<MemoryEntry>>,
}

/// Memory held in process: a bounded FIFO of recent entries plus an
/// unbounded long-term log grouped by entry type.
#[derive(Debug)]
pub struct InMemoryStore {
    capacity: usize,
    inner: RwLock<Snapshot>,
}

impl InMemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(Snapshot::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .short_term
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(100)
    }
}

fn matches_filter(context: &ContextVariables, filter: &ContextVariables) -> bool {
    filter
        .iter()
        .all(|(key, want)| context.get(key).is_some_and(|have| have == want))
}

impl MemoryStore for InMemoryStore {
    fn append(&self, entry: MemoryEntry) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .long_term
            .entry(entry.kind.clone())
            .or_default()
            .push(entry.clone());
        inner.short_term.push_back(entry);
        while inner.short_term.len() > self.capacity {
            inner.short_term.pop_front();
        }
    }

    fn recent(&self, n: usize) -> Vec<MemoryEntry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let skip = inner.short_term.len().saturating_sub(n);
        inner.short_term.iter().skip(skip).cloned().collect()
    }

    fn search(&self, kind: &str, filter: Option<&ContextVariables>) -> Vec<MemoryEntry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = inner.long_term.get(kind) else {
            return vec![];
        };
        match filter {
            None => entries.clone(),
            Some(filter) => entries
                .iter()
                .filter(|e| matches_filter(&e.context, filter))
                .cloned()
                .collect(),
        }
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(serde_json::to_vec(&*inner)?)
    }

    fn deserialize(&self, data: &[u8]) -> Result<()> {
        let mut loaded: Snapshot = serde_json::from_slice(data)?;
        while loaded.short_term.len() > self.capacity {
            loaded.short_term.pop_front();
        }
        debug!(
            short_term = loaded.short_term.len(),
            kinds = loaded.long_term.len(),
            "Memory store loaded"
        );
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        Ok(())
    }
}
