use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_core::agent::Agent;
use hive_core::config::AppConfig;
use hive_core::error::{HiveError, Result};
use hive_core::event::EventBus;
use hive_core::traits::ModelClient;
use hive_core::types::*;
use hive_llm::{ClientRegistry, RetryPolicy};

use crate::tools::{ToolRound, ToolRunner};

/// One invocation of the turn executor.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub agent: Option<Arc<Agent>>,
    pub messages: Vec<Message>,
    pub context_variables: ContextVariables,
    /// Takes precedence over both the agent's and the configured model.
    pub model_override: Option<String>,
    /// Defaults to `agent.max_turns` from the config.
    pub max_turns: Option<usize>,
    /// Defaults to `agent.execute_tools` from the config.
    pub execute_tools: Option<bool>,
}

impl RunRequest {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self {
            agent: Some(agent),
            ..Default::default()
        }
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context_variables.insert(key.into(), value);
        self
    }

    pub fn with_context_variables(mut self, variables: ContextVariables) -> Self {
        self.context_variables = variables;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn with_execute_tools(mut self, execute: bool) -> Self {
        self.execute_tools = Some(execute);
        self
    }
}

/// Outcome of a run.
#[derive(Debug, Clone)]
pub struct Response {
    /// Messages produced during this run only, in order.
    pub messages: Vec<Message>,
    /// Agent active when the run ended.
    pub agent: Arc<Agent>,
    pub context_variables: ContextVariables,
    pub tool_results: Vec<ToolExecution>,
    pub usage: Usage,
    pub turns: usize,
}

impl Response {
    /// Content of the last message with any text in it.
    pub fn last_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| !m.content.is_empty())
            .map(|m| m.content.as_str())
    }
}

/// The turn executor: drives agents against a [`ModelClient`].
#[derive(Clone)]
pub struct Swarm {
    client: Arc<dyn ModelClient>,
    config: AppConfig,
    retry: RetryPolicy,
    event_bus: Arc<EventBus>,
}

impl Swarm {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        let config = AppConfig::default();
        let event_bus = Arc::new(EventBus::default());
        Self {
            client,
            retry: RetryPolicy::new(config.retry.clone()).with_event_bus((*event_bus).clone()),
            config,
            event_bus,
        }
    }

    pub fn builder() -> SwarmBuilder {
        SwarmBuilder::default()
    }

    /// Build the client named by `config.model.provider` from `registry`.
    pub fn from_registry(registry: &ClientRegistry, config: AppConfig) -> Result<Self> {
        let client = registry.create(&config.model)?;
        Ok(Self::new(client).with_config(config))
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.retry = RetryPolicy::new(config.retry.clone()).with_event_bus((*self.event_bus).clone());
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.retry = RetryPolicy::new(self.config.retry.clone()).with_event_bus((*event_bus).clone());
        self.event_bus = event_bus;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn ModelClient> {
        &self.client
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Run an agent until it answers without tool calls or the turn budget
    /// is spent.
    pub async fn run(&self, request: RunRequest, cancel: &CancellationToken) -> Result<Response> {
        let mut active = request.agent.clone().ok_or(HiveError::NilAgent)?;
        let max_turns = self.turn_budget(&request);
        let execute_tools = request
            .execute_tools
            .unwrap_or(self.config.agent.execute_tools);
        let mut variables = request.context_variables.clone();
        let mut history = request.messages.clone();
        let start = history.len();
        let mut tool_results = Vec::new();
        let mut usage = Usage::default();
        let mut turns = 0;
        let mut finished = false;

        self.event_bus.publish(AgentEvent::RunStarted {
            agent: active.name.clone(),
        });
        info!(agent = %active.name, max_turns, "Starting run");

        while turns < max_turns {
            if cancel.is_cancelled() {
                return Err(HiveError::Cancelled);
            }
            turns += 1;
            debug!(agent = %active.name, turn = turns, "Starting turn");

            let completion = self.build_request(&active, &history, &variables, &request, true);
            let (message, turn_usage) = self.complete(completion, cancel).await?;
            usage.add(&turn_usage);
            let message = message.with_name(active.name.clone());
            history.push(message.clone());

            if !message.has_tool_calls() || !execute_tools {
                finished = true;
                self.event_bus.publish(AgentEvent::TurnComplete { turn: turns });
                break;
            }

            let round = self
                .run_tools(&active, &message.tool_calls, &variables, cancel)
                .await;
            history.extend(round.messages);
            tool_results.extend(round.executions);
            variables.extend(round.updates);
            if let Some(next) = round.next_agent {
                info!(from = %active.name, to = %next.name, "Agent handoff");
                self.event_bus.publish(AgentEvent::Handoff {
                    from: active.name.clone(),
                    to: next.name.clone(),
                });
                active = next;
            }

            // Tools are left out of the follow-up so the model answers in prose.
            let follow_up = self.build_request(&active, &history, &variables, &request, false);
            match self.complete(follow_up, cancel).await {
                Ok((reply, reply_usage)) => {
                    usage.add(&reply_usage);
                    if !reply.content.is_empty() {
                        history.push(Message::assistant(reply.content).with_name(active.name.clone()));
                    }
                }
                Err(HiveError::Cancelled) => return Err(HiveError::Cancelled),
                Err(e) => warn!(agent = %active.name, error = %e, "Follow-up request failed"),
            }

            self.event_bus.publish(AgentEvent::TurnComplete { turn: turns });
        }

        if !finished {
            warn!(agent = %active.name, max_turns, "Turn budget exhausted");
        }
        info!(
            agent = %active.name,
            turns,
            total_tokens = usage.total_tokens,
            "Run complete"
        );
        self.event_bus.publish(AgentEvent::RunComplete {
            agent: active.name.clone(),
            turns,
            usage,
        });

        Ok(Response {
            messages: history.split_off(start),
            agent: active,
            context_variables: variables,
            tool_results,
            usage,
            turns,
        })
    }

    pub(crate) fn turn_budget(&self, request: &RunRequest) -> usize {
        request
            .max_turns
            .unwrap_or(self.config.agent.max_turns)
            .max(1)
    }

    pub(crate) fn resolve_model(&self, agent: &Agent, request: &RunRequest) -> String {
        if let Some(model) = &request.model_override {
            return model.clone();
        }
        if !agent.model.is_empty() {
            return agent.model.clone();
        }
        self.config.model.model_id.clone()
    }

    /// System instructions, then history, then (optionally) tool declarations.
    pub(crate) fn build_request(
        &self,
        agent: &Agent,
        history: &[Message],
        variables: &ContextVariables,
        request: &RunRequest,
        with_tools: bool,
    ) -> CompletionRequest {
        let mut messages = Vec::with_capacity(history.len() + 1);
        let instructions = agent.instructions.resolve(variables);
        if !instructions.is_empty() {
            messages.push(Message::system(instructions));
        }
        messages.extend_from_slice(history);

        let tools = if with_tools {
            agent.tool_definitions()
        } else {
            Vec::new()
        };
        let has_tools = !tools.is_empty();

        CompletionRequest {
            model: self.resolve_model(agent, request),
            messages,
            tools,
            tool_choice: agent.tool_choice.clone().filter(|_| has_tools),
            parallel_tool_calls: has_tools.then_some(agent.parallel_tool_calls),
            temperature: self.config.model.temperature,
            max_tokens: Some(self.config.model.max_tokens),
            ..Default::default()
        }
    }

    /// One model call under the retry policy, each attempt bounded by the
    /// request timeout.
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<(Message, Usage)> {
        let timeout = Duration::from_secs(self.config.model.request_timeout_secs);
        let response = self
            .retry
            .execute(cancel, |_attempt| {
                let request = request.clone();
                async move {
                    match tokio::time::timeout(timeout, self.client.create_completion(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(HiveError::transient(format!(
                            "model request timed out after {}s",
                            timeout.as_secs()
                        ))),
                    }
                }
            })
            .await?;
        let usage = response.usage;
        let message = response
            .into_first_message()
            .ok_or(HiveError::EmptyResponse)?;
        Ok((message, usage))
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub(crate) async fn run_tools(
        &self,
        agent: &Agent,
        calls: &[ToolCall],
        variables: &ContextVariables,
        cancel: &CancellationToken,
    ) -> ToolRound {
        let runner = ToolRunner {
            agent,
            event_bus: &self.event_bus,
            cancel,
            max_timeout: Duration::from_secs(self.config.agent.tool_timeout_secs),
        };
        if self.config.agent.parallel_tools && agent.parallel_tool_calls {
            runner.run_parallel(calls, variables).await
        } else {
            runner.run_serial(calls, variables).await
        }
    }

    pub(crate) async fn run_tool_call(
        &self,
        agent: &Agent,
        call: &ToolCall,
        variables: &ContextVariables,
        cancel: &CancellationToken,
    ) -> ToolRound {
        self.run_tools(agent, std::slice::from_ref(call), variables, cancel)
            .await
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("model", &self.config.model.model_id)
            .field("max_turns", &self.config.agent.max_turns)
            .finish()
    }
}

/// Builder for [`Swarm`]; `build` fails without a client.
#[derive(Default)]
pub struct SwarmBuilder {
    client: Option<Arc<dyn ModelClient>>,
    config: AppConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl SwarmBuilder {
    pub fn client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn build(self) -> Result<Swarm> {
        let client = self.client.ok_or(HiveError::ClientNotReady)?;
        let mut swarm = Swarm::new(client);
        if let Some(bus) = self.event_bus {
            swarm = swarm.with_event_bus(bus);
        }
        Ok(swarm.with_config(self.config))
    }
}
