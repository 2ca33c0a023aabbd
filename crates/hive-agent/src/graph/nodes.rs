//! Ready-made node shapes: keyword routers, parallel fan-out, and human
//! input prompts.

use std::sync::Arc;

use futures::future::join_all;
use tracing::debug;

use hive_core::error::{HiveError, Result};
use hive_core::types::Message;

use super::edge::RouterFn;
use super::node::{Node, NodeContext};
use super::state::{GraphState, MESSAGES_KEY, VISITS_KEY};

/// State key a router node writes its decision to.
pub fn route_key(node_id: &str) -> String {
    format!("{}_route", node_id)
}

/// Router that follows the destination stored under `key`.
pub fn route_by_key(key: &str) -> RouterFn {
    let key = key.to_string();
    Arc::new(move |state: &GraphState| {
        state
            .get_str(&key)
            .filter(|dest| !dest.is_empty())
            .map(str::to_string)
            .ok_or_else(|| HiveError::Config(format!("no route recorded under {}", key)))
    })
}

/// Node that picks a destination by keyword in the last message.
///
/// Keywords are tried in order; with no match the first route wins. With no
/// messages at all the route key is cleared so no edge matches.
pub fn keyword_router(id: impl Into<String>, routes: &[(&str, &str)]) -> Node {
    let id = id.into();
    let key = route_key(&id);
    let routes: Vec<(String, String)> = routes
        .iter()
        .map(|(keyword, dest)| (keyword.to_lowercase(), dest.to_string()))
        .collect();

    Node::sync(id.clone(), format!("Router-{}", id), move |mut state| {
        if state.messages()?.is_empty() {
            state.remove(&key);
            return Ok(state);
        }
        let content = state.last_content_lower();
        let dest = routes
            .iter()
            .find(|(keyword, _)| content.contains(keyword.as_str()))
            .or_else(|| routes.first())
            .map(|(_, dest)| dest.clone());
        match dest {
            Some(dest) => {
                debug!(router = %key, dest = %dest, "Routing");
                state.set_str(key.clone(), dest);
            }
            None => {
                state.remove(&key);
            }
        }
        Ok(state)
    })
}

/// Node that runs `branches` concurrently, each on its own copy of the state.
///
/// Results are merged in branch order: plain keys overwrite, and each
/// branch's new messages are appended to the conversation. The first
/// failing branch fails the node.
pub fn parallel_node(id: impl Into<String>, branches: Vec<Node>) -> Node {
    let id = id.into();
    let branches = Arc::new(branches);
    Node::new(id.clone(), format!("Parallel-{}", id), move |ctx: NodeContext, state| {
        let branches = Arc::clone(&branches);
        async move {
            let runs = branches.iter().map(|branch| {
                let branch_ctx = NodeContext {
                    node_id: branch.id.clone(),
                    cancel: ctx.cancel.child_token(),
                };
                branch.process(branch_ctx, state.clone())
            });
            let results = join_all(runs).await;

            let base = state.messages()?;
            let mut messages = base.clone();
            let mut merged = state;
            for (branch, result) in branches.iter().zip(results) {
                let out = result.map_err(|e| HiveError::NodeFailed {
                    node: branch.id.clone(),
                    source: Box::new(e),
                })?;
                let produced = out.messages()?;
                let fresh = if produced.starts_with(&base) {
                    &produced[base.len()..]
                } else {
                    &produced[..]
                };
                messages.extend(fresh.iter().cloned());
                for (key, value) in out.data() {
                    if key != MESSAGES_KEY && key != VISITS_KEY {
                        merged.set(key.clone(), value.clone());
                    }
                }
            }
            merged.set_messages(&messages)?;
            Ok(merged)
        }
    })
}

/// Node that appends `prompt` as an assistant message and flags the run as
/// waiting for input.
pub fn human_input_node(id: impl Into<String>, prompt: impl Into<String>) -> Node {
    let id = id.into();
    let prompt = prompt.into();
    Node::sync(id.clone(), format!("HumanInput-{}", id), move |mut state| {
        state.push_message(Message::assistant(prompt.clone()))?;
        state.set_bool("waiting_for_input", true);
        Ok(state)
    })
}
