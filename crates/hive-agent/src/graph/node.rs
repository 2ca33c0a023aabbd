use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use hive_core::agent::Agent;
use hive_core::error::Result;
use hive_core::types::ContextVariables;

use super::state::GraphState;
use crate::swarm::{RunRequest, Swarm};

/// Prefix marking graph-state keys that mirror agent context variables.
pub const VAR_PREFIX: &str = "var_";

/// Handed to every node invocation.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub node_id: String,
    pub cancel: CancellationToken,
}

type ProcessFn =
    dyn Fn(NodeContext, GraphState) -> BoxFuture<'static, Result<GraphState>> + Send + Sync;

/// A unit of work in a graph.
///
/// The process function receives its own copy of the state and returns the
/// state handed to the next node.
#[derive(Clone)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub description: String,
    pub metadata: HashMap<String, serde_json::Value>,
    /// Set for nodes built with [`Node::agent`].
    pub agent: Option<Arc<Agent>>,
    process: Arc<ProcessFn>,
}

impl Node {
    pub fn new<F, Fut>(id: impl Into<String>, name: impl Into<String>, process: F) -> Self
    where
        F: Fn(NodeContext, GraphState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GraphState>> + Send + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            metadata: HashMap::new(),
            agent: None,
            process: Arc::new(move |ctx, state| Box::pin(process(ctx, state))),
        }
    }

    /// Node backed by a synchronous state transform.
    pub fn sync<F>(id: impl Into<String>, name: impl Into<String>, transform: F) -> Self
    where
        F: Fn(GraphState) -> Result<GraphState> + Send + Sync + 'static,
    {
        Self::new(id, name, move |_ctx, state| {
            std::future::ready(transform(state))
        })
    }

    /// Node that runs `agent` for one turn over the conversation in state.
    ///
    /// `var_*` keys are passed in as context variables and the run's
    /// variables are written back under the same prefix. Tool outputs land
    /// in `tool_results` keyed by tool name, and the agent that finished the
    /// turn in `last_agent`.
    pub fn agent(
        id: impl Into<String>,
        name: impl Into<String>,
        agent: Arc<Agent>,
        swarm: Arc<Swarm>,
    ) -> Self {
        let runner = Arc::clone(&agent);
        let mut node = Self::new(id, name, move |ctx, state| {
            let agent = Arc::clone(&runner);
            let swarm = Arc::clone(&swarm);
            async move { run_agent_turn(&swarm, agent, ctx, state).await }
        });
        node.agent = Some(agent);
        node
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn process(&self, ctx: NodeContext, state: GraphState) -> BoxFuture<'static, Result<GraphState>> {
        (self.process)(ctx, state)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("agent", &self.agent.as_ref().map(|a| a.name.as_str()))
            .finish()
    }
}

/// Context variables carried in state under the `var_` prefix.
pub fn context_from_state(state: &GraphState) -> ContextVariables {
    state
        .data()
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(VAR_PREFIX)
                .map(|name| (name.to_string(), value.clone()))
        })
        .collect()
}

async fn run_agent_turn(
    swarm: &Swarm,
    agent: Arc<Agent>,
    ctx: NodeContext,
    mut state: GraphState,
) -> Result<GraphState> {
    let mut messages = state.messages()?;
    let request = RunRequest::new(agent)
        .with_messages(messages.clone())
        .with_context_variables(context_from_state(&state))
        .with_max_turns(1)
        .with_execute_tools(true);

    let response = swarm.run(request, &ctx.cancel).await?;
    debug!(
        node_id = %ctx.node_id,
        new_messages = response.messages.len(),
        tool_calls = response.tool_results.len(),
        "Agent node finished"
    );

    messages.extend(response.messages.iter().cloned());
    state.set_messages(&messages)?;

    if !response.tool_results.is_empty() {
        let results: serde_json::Map<String, serde_json::Value> = response
            .tool_results
            .iter()
            .map(|exec| (exec.tool_name.clone(), exec.result.clone()))
            .collect();
        state.set("tool_results", serde_json::Value::Object(results));
    }
    for (key, value) in response.context_variables {
        state.set(format!("{}{}", VAR_PREFIX, key), value);
    }
    state.set_str("last_agent", response.agent.name.clone());
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::tool::{FunctionTool, ToolResult};
    use hive_core::types::{Message, Role};
    use hive_test_utils::MockModelClient;

    #[tokio::test]
    async fn test_sync_node_transforms_state() {
        let node = Node::sync("intake", "Intake", |mut state| {
            state.set_str("phase", "creation");
            Ok(state)
        })
        .with_description("Seeds the workflow")
        .with_metadata("stage", serde_json::json!(1));

        let ctx = NodeContext {
            node_id: "intake".into(),
            cancel: CancellationToken::new(),
        };
        let out = node.process(ctx, GraphState::new()).await.unwrap();
        assert_eq!(out.get_str("phase"), Some("creation"));
        assert_eq!(node.description, "Seeds the workflow");
        assert!(node.agent.is_none());
    }

    #[test]
    fn test_context_from_state_strips_prefix() {
        let mut state = GraphState::new();
        state.set("var_user", serde_json::json!("ada"));
        state.set("phase", serde_json::json!("x"));
        let vars = context_from_state(&state);
        assert_eq!(vars.len(), 1);
        assert_eq!(vars["user"], serde_json::json!("ada"));
    }

    #[tokio::test]
    async fn test_agent_node_threads_messages_and_variables() {
        let client = Arc::new(MockModelClient::new());
        client
            .push_tool_call("c1", "create_task", serde_json::json!({"title": "Homepage"}))
            .push_text("Task created.");
        let swarm = Arc::new(Swarm::new(client.clone()));
        let agent = Arc::new(Agent::new("TaskCreator").with_tool(FunctionTool::new(
            "create_task",
            "Create a task",
            |args, ctx| {
                let owner = ctx.get_str("owner").unwrap_or("nobody").to_string();
                ctx.delta.set(
                    "current_task",
                    serde_json::json!({"title": args["title"], "owner": owner}),
                );
                ToolResult::success("Task created: Homepage")
            },
        )));

        let node = Node::agent("creator", "Task Creator", agent, swarm);
        let mut state = GraphState::new();
        state.set("var_owner", serde_json::json!("ada"));
        state.push_message(Message::user("Redesign the homepage")).unwrap();

        let ctx = NodeContext {
            node_id: "creator".into(),
            cancel: CancellationToken::new(),
        };
        let out = node.process(ctx, state).await.unwrap();

        let messages = out.messages().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].role, Role::Tool);
        assert_eq!(out.get("tool_results").unwrap()["create_task"], "Task created: Homepage");
        assert_eq!(out.get("var_current_task").unwrap()["owner"], "ada");
        assert_eq!(out.get_str("last_agent"), Some("TaskCreator"));
    }
}
