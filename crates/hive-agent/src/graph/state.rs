use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use hive_core::error::Result;
use hive_core::types::Message;

/// Key holding the conversation as a JSON array of messages.
pub const MESSAGES_KEY: &str = "messages";

/// Key holding the per-node visit ledger.
pub const VISITS_KEY: &str = "__visits";

/// The value bag threaded through a graph run.
///
/// Cloning is a shallow copy of the bindings; nodes receive a clone and
/// return the state for the next node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphState {
    data: BTreeMap<String, serde_json::Value>,
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(|v| v.as_bool())
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, serde_json::Value::String(value.into()));
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, serde_json::Value::Bool(value));
    }

    /// Builder-style `set`.
    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.set(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Overwrite with every binding from `other`.
    pub fn merge(&mut self, other: &GraphState) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    pub fn data(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.data
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    /// Decode the conversation. A missing key is an empty conversation.
    pub fn messages(&self) -> Result<Vec<Message>> {
        match self.data.get(MESSAGES_KEY) {
            None | Some(serde_json::Value::Null) => Ok(Vec::new()),
            Some(raw) => Ok(serde_json::from_value(raw.clone())?),
        }
    }

    pub fn set_messages(&mut self, messages: &[Message]) -> Result<()> {
        self.data
            .insert(MESSAGES_KEY.to_string(), serde_json::to_value(messages)?);
        Ok(())
    }

    pub fn push_message(&mut self, message: Message) -> Result<()> {
        let mut messages = self.messages()?;
        messages.push(message);
        self.set_messages(&messages)
    }

    /// Content of the last message, lowercased. Empty when there is none.
    pub fn last_content_lower(&self) -> String {
        self.messages()
            .ok()
            .and_then(|m| m.last().map(|m| m.content.to_lowercase()))
            .unwrap_or_default()
    }

    /// Times `node` has been entered during this run.
    pub fn visits(&self, node: &str) -> u32 {
        self.data
            .get(VISITS_KEY)
            .and_then(|v| v.get(node))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }

    pub fn visit_ledger(&self) -> BTreeMap<String, u32> {
        self.data
            .get(VISITS_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Increment and return the visit count for `node`.
    pub fn record_visit(&mut self, node: &str) -> u32 {
        let mut ledger = self.visit_ledger();
        let count = ledger.entry(node.to_string()).or_insert(0);
        *count += 1;
        let visits = *count;
        self.set_ledger(&ledger);
        visits
    }

    pub(crate) fn set_ledger(&mut self, ledger: &BTreeMap<String, u32>) {
        let value = ledger
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::from(*v)))
            .collect::<serde_json::Map<_, _>>();
        self.data
            .insert(VISITS_KEY.to_string(), serde_json::Value::Object(value));
    }
}

impl From<BTreeMap<String, serde_json::Value>> for GraphState {
    fn from(data: BTreeMap<String, serde_json::Value>) -> Self {
        Self { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::types::Role;

    #[test]
    fn test_typed_accessors() {
        let mut state = GraphState::new();
        state.set_str("phase", "creation");
        state.set_bool("force_exit", false);
        state.set("count", serde_json::json!(3));

        assert_eq!(state.get_str("phase"), Some("creation"));
        assert_eq!(state.get_bool("force_exit"), Some(false));
        assert_eq!(state.get_str("count"), None);
        assert!(state.contains("count"));
        assert_eq!(state.remove("count"), Some(serde_json::json!(3)));
        assert!(!state.contains("count"));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut original = GraphState::new();
        original.set_str("k", "v1");
        let mut copy = original.clone();
        copy.set_str("k", "v2");
        assert_eq!(original.get_str("k"), Some("v1"));
    }

    #[test]
    fn test_messages_round_trip_through_json() {
        let mut state = GraphState::new();
        assert!(state.messages().unwrap().is_empty());

        state.push_message(Message::user("Create a task")).unwrap();
        state
            .push_message(Message::tool_result("c1", "create_task", "Task created"))
            .unwrap();

        let messages = state.messages().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Tool);
        assert_eq!(messages[1].name.as_deref(), Some("create_task"));
        assert_eq!(state.last_content_lower(), "task created");
    }

    #[test]
    fn test_bad_messages_value_is_an_error() {
        let mut state = GraphState::new();
        state.set(MESSAGES_KEY, serde_json::json!("not a list"));
        assert!(state.messages().is_err());
    }

    #[test]
    fn test_visit_ledger() {
        let mut state = GraphState::new();
        assert_eq!(state.visits("a"), 0);
        assert_eq!(state.record_visit("a"), 1);
        assert_eq!(state.record_visit("a"), 2);
        assert_eq!(state.record_visit("b"), 1);
        assert_eq!(state.visits("a"), 2);
        assert_eq!(state.visit_ledger().len(), 2);
    }

    #[test]
    fn test_merge_overwrites() {
        let mut base = GraphState::new().with("a", serde_json::json!(1));
        let other = GraphState::new()
            .with("a", serde_json::json!(2))
            .with("b", serde_json::json!(true));
        base.merge(&other);
        assert_eq!(base.get("a"), Some(&serde_json::json!(2)));
        assert_eq!(base.get_bool("b"), Some(true));
    }
}
