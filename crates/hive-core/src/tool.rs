use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::traits::Tool;
use crate::types::ContextVariables;

/// Outcome of a tool invocation.
#[derive(Clone)]
pub enum ToolResult {
    Success(serde_json::Value),
    Failure(String),
    /// Hand the conversation to `agent` from the next turn on.
    Handoff {
        agent: Arc<Agent>,
        data: serde_json::Value,
    },
}

impl ToolResult {
    pub fn success(data: impl Into<serde_json::Value>) -> Self {
        Self::Success(data.into())
    }

    pub fn failure(error: impl fmt::Display) -> Self {
        Self::Failure(error.to_string())
    }

    pub fn handoff(agent: Arc<Agent>) -> Self {
        let data = serde_json::Value::String(format!("Transferring to {}", agent.name));
        Self::Handoff { agent, data }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn next_agent(&self) -> Option<&Arc<Agent>> {
        match self {
            Self::Handoff { agent, .. } => Some(agent),
            _ => None,
        }
    }

    /// Payload as a JSON value. Failures yield their error text.
    pub fn data(&self) -> serde_json::Value {
        match self {
            Self::Success(data) | Self::Handoff { data, .. } => data.clone(),
            Self::Failure(err) => serde_json::Value::String(err.clone()),
        }
    }

    /// Text placed in the tool-role message shown to the model.
    pub fn content(&self) -> String {
        match self {
            Self::Success(data) | Self::Handoff { data, .. } => value_to_content(data),
            Self::Failure(err) => format!("Error: {}", err),
        }
    }
}

impl fmt::Debug for ToolResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(data) => f.debug_tuple("Success").field(data).finish(),
            Self::Failure(err) => f.debug_tuple("Failure").field(err).finish(),
            Self::Handoff { agent, data } => f
                .debug_struct("Handoff")
                .field("agent", &agent.name)
                .field("data", data)
                .finish(),
        }
    }
}

/// Strings are passed through verbatim; everything else is JSON-encoded.
pub fn value_to_content(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Context-variable writes made by a tool, merged by the caller after the call.
#[derive(Debug, Clone, Default)]
pub struct ContextDelta(Arc<Mutex<ContextVariables>>);

impl ContextDelta {
    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    /// Drain all recorded writes.
    pub fn take(&self) -> ContextVariables {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

/// Execution context passed to every tool call.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub agent_name: String,
    /// Snapshot of the run's context variables at call time.
    pub variables: Arc<ContextVariables>,
    pub delta: ContextDelta,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(agent_name: impl Into<String>, variables: ContextVariables) -> Self {
        Self {
            agent_name: agent_name.into(),
            variables: Arc::new(variables),
            delta: ContextDelta::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.variables.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.variables.get(key).and_then(|v| v.as_str())
    }
}

type Handler = dyn Fn(serde_json::Value, &ToolContext) -> ToolResult + Send + Sync;

/// A tool backed by a plain closure.
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: serde_json::Value,
    timeout_secs: u64,
    handler: Arc<Handler>,
}

impl FunctionTool {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(serde_json::Value, &ToolContext) -> ToolResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
            timeout_secs: 30,
            handler: Arc::new(handler),
        }
    }

    pub fn with_parameters(mut self, schema: serde_json::Value) -> Self {
        self.parameters = schema;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        self.parameters.clone()
    }

    fn call(&self, args: serde_json::Value, ctx: ToolContext) -> BoxFuture<'_, ToolResult> {
        Box::pin(async move { (self.handler)(args, &ctx) })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}

impl fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_formatting() {
        assert_eq!(ToolResult::success("sunny").content(), "sunny");
        assert_eq!(
            ToolResult::success(serde_json::json!({"temp": 21})).content(),
            r#"{"temp":21}"#
        );
        assert_eq!(ToolResult::failure("boom").content(), "Error: boom");
        assert!(ToolResult::failure("boom").is_error());
    }

    #[test]
    fn test_handoff_carries_agent() {
        let next = Arc::new(Agent::new("billing"));
        let result = ToolResult::handoff(next);
        assert_eq!(result.next_agent().map(|a| a.name.as_str()), Some("billing"));
        assert_eq!(result.content(), "Transferring to billing");
    }

    #[test]
    fn test_context_delta_take_drains() {
        let delta = ContextDelta::default();
        let shared = delta.clone();
        shared.set("user_id", serde_json::json!(7));
        assert!(!delta.is_empty());

        let taken = delta.take();
        assert_eq!(taken.get("user_id"), Some(&serde_json::json!(7)));
        assert!(delta.is_empty());
    }

    #[tokio::test]
    async fn test_function_tool_call() {
        let tool = FunctionTool::new("greet", "Greets a user", |args, ctx| {
            ctx.delta.set("greeted", serde_json::json!(true));
            let who = args["name"].as_str().unwrap_or("stranger").to_string();
            ToolResult::success(format!("hello {}", who))
        });

        let ctx = ToolContext::new("greeter", ContextVariables::new());
        let result = tool.call(serde_json::json!({"name": "Ada"}), ctx.clone()).await;
        assert_eq!(result.content(), "hello Ada");
        assert_eq!(ctx.delta.take().get("greeted"), Some(&serde_json::json!(true)));
        assert_eq!(tool.definition().name, "greet");
    }
}
