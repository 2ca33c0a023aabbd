use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use hive_core::agent::Agent;
use hive_core::error::HiveError;
use hive_core::event::EventBus;
use hive_core::tool::{ContextDelta, ToolContext, ToolResult};
use hive_core::types::{AgentEvent, ContextVariables, MemoryEntry, Message, ToolCall, ToolExecution};

/// What a single tool call produced.
#[derive(Debug)]
pub(crate) struct CallOutcome {
    /// Tool-role message to append to history.
    pub message: Message,
    /// `None` when the call never reached a tool (unknown name, bad arguments).
    pub execution: Option<ToolExecution>,
    pub updates: ContextVariables,
    pub next_agent: Option<Arc<Agent>>,
}

impl CallOutcome {
    fn rejected(call: &ToolCall, content: String) -> Self {
        Self {
            message: Message::tool_result(&call.id, &call.name, content),
            execution: None,
            updates: ContextVariables::new(),
            next_agent: None,
        }
    }
}

/// Everything produced by one batch of tool calls.
#[derive(Debug, Default)]
pub(crate) struct ToolRound {
    pub messages: Vec<Message>,
    pub executions: Vec<ToolExecution>,
    pub updates: ContextVariables,
    /// First handoff observed; later ones are ignored.
    pub next_agent: Option<Arc<Agent>>,
}

impl ToolRound {
    fn absorb(&mut self, outcome: CallOutcome) {
        self.messages.push(outcome.message);
        self.executions.extend(outcome.execution);
        self.updates.extend(outcome.updates);
        if self.next_agent.is_none() {
            self.next_agent = outcome.next_agent;
        }
    }
}

/// Resolves and runs tool calls against an agent's tool table.
pub(crate) struct ToolRunner<'a> {
    pub agent: &'a Agent,
    pub event_bus: &'a EventBus,
    pub cancel: &'a CancellationToken,
    pub max_timeout: Duration,
}

impl ToolRunner<'_> {
    pub async fn run_call(&self, call: &ToolCall, variables: &ContextVariables) -> CallOutcome {
        let Some(tool) = self.agent.find_tool(&call.name) else {
            warn!(agent = %self.agent.name, tool = %call.name, "Tool not found");
            return CallOutcome::rejected(call, format!("Error: Tool {} not found", call.name));
        };

        let args = match call.parse_arguments() {
            Ok(args) => args,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Invalid tool call arguments");
                return CallOutcome::rejected(
                    call,
                    format!("Error parsing tool call arguments: {}", e),
                );
            }
        };

        self.event_bus.publish(AgentEvent::ToolStart {
            name: call.name.clone(),
            input: args.clone(),
        });

        let ctx = ToolContext {
            agent_name: self.agent.name.clone(),
            variables: Arc::new(variables.clone()),
            delta: ContextDelta::default(),
            cancel: self.cancel.child_token(),
        };
        let limit = Duration::from_secs(tool.timeout_secs()).min(self.max_timeout);
        let invocation = AssertUnwindSafe(tool.call(args.clone(), ctx.clone())).catch_unwind();

        let result = tokio::select! {
            outcome = tokio::time::timeout(limit, invocation) => match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => {
                    error!(tool = %call.name, "Tool panicked");
                    ToolResult::failure(format!("tool {} panicked", call.name))
                }
                Err(_) => ToolResult::failure(HiveError::ToolTimeout {
                    tool: call.name.clone(),
                    timeout_secs: limit.as_secs(),
                }),
            },
            _ = self.cancel.cancelled() => ToolResult::failure(HiveError::Cancelled),
        };

        let is_error = result.is_error();
        debug!(tool = %call.name, is_error, "Tool call finished");
        self.event_bus.publish(AgentEvent::ToolEnd {
            name: call.name.clone(),
            is_error,
        });

        self.agent.remember(
            MemoryEntry::new("tool_call", format!("Called {}: {}", call.name, result.content()))
                .with_context("tool", serde_json::Value::String(call.name.clone()))
                .with_context("success", serde_json::Value::Bool(!is_error))
                .with_importance(0.7),
        );

        CallOutcome {
            message: Message::tool_result(&call.id, &call.name, result.content()),
            execution: Some(ToolExecution {
                tool_name: call.name.clone(),
                arguments: args,
                result: result.data(),
                is_error,
            }),
            updates: ctx.delta.take(),
            next_agent: result.next_agent().cloned(),
        }
    }

    /// Run calls one after another in emission order. Each call sees the
    /// context updates of the calls before it.
    pub async fn run_serial(&self, calls: &[ToolCall], variables: &ContextVariables) -> ToolRound {
        let mut round = ToolRound::default();
        let mut running = variables.clone();
        for call in calls {
            let outcome = self.run_call(call, &running).await;
            running.extend(outcome.updates.clone());
            round.absorb(outcome);
        }
        round
    }

    /// Run calls concurrently; results are folded in completion order.
    pub async fn run_parallel(&self, calls: &[ToolCall], variables: &ContextVariables) -> ToolRound {
        let mut round = ToolRound::default();
        let mut pending: FuturesUnordered<_> =
            calls.iter().map(|call| self.run_call(call, variables)).collect();
        while let Some(outcome) = pending.next().await {
            round.absorb(outcome);
        }
        round
    }
}
