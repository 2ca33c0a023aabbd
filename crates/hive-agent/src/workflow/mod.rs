//! Multi-agent workflows compiled onto the graph engine.
//!
//! Each agent becomes a graph node with a single conditional edge. The edge
//! applies the workflow's routing strategy (see [`routing`]) to decide which
//! agent acts next, or sends the run to the terminal node when routing
//! ends. Cycles are governed by the graph's visit limit.

pub mod definition;
pub mod routing;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hive_core::agent::Agent;
use hive_core::error::{HiveError, Result};
use hive_core::types::{ContextVariables, Message};

use crate::graph::{
    context_from_state, CycleCallback, CyclePolicy, GraphBuilder, GraphEvent, GraphState, Node,
    NodeContext, VAR_PREFIX,
};
use crate::swarm::{RunRequest, Swarm};

pub use definition::{AgentDefinition, DataFlow, WorkflowDefinition, WorkflowPlanner};
pub use routing::{message_id, ProcessedLedger, RoutingTable};

/// Id of the terminal node every workflow graph ends in.
pub const END_NODE: &str = "__end__";

/// Ids of messages each agent has taken as input.
const PROCESSED_KEY: &str = "__processed";

/// Per-agent context variables for workflows that do not share context.
const AGENT_VARS_KEY: &str = "__agent_vars";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    /// Peers pass work around until everyone has seen it.
    #[default]
    Collaborative,
    /// A leader classifies work and hands it to team leads.
    Supervisor,
    /// Work flows down to specialists and results back up to team leads.
    Hierarchical,
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Collaborative => "collaborative",
            Self::Supervisor => "supervisor",
            Self::Hierarchical => "hierarchical",
        };
        f.write_str(label)
    }
}

impl FromStr for WorkflowType {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "collaborative" => Ok(Self::Collaborative),
            "supervisor" => Ok(Self::Supervisor),
            "hierarchical" => Ok(Self::Hierarchical),
            other => Err(HiveError::Config(format!("unknown workflow type: {}", other))),
        }
    }
}

/// Teams, in the order the supervisor strategy checks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamType {
    Research,
    Document,
    Supervisor,
    Analysis,
    Developer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CycleHandling {
    /// End the run with the output so far once an agent hits the visit limit.
    #[default]
    StopOnCycle,
    /// Ask the cycle callback; without one the run fails as an infinite loop.
    ContinueOnCycle,
}

/// Lifecycle notifications for a workflow run. All methods default to no-ops.
pub trait WorkflowObserver: Send + Sync {
    fn on_workflow_start(&self, _workflow_id: &str, _start_agent: &str) {}
    fn on_agent_start(&self, _agent: &str, _step: usize) {}
    fn on_agent_complete(&self, _agent: &str, _step: usize, _duration: Duration) {}
    fn on_message_sent(&self, _from: &str, _to: &str, _content: &str) {}
    fn on_cycle_detected(&self, _from: &str, _to: &str, _count: u32) {}
    fn on_workflow_end(&self, _result: &WorkflowResult) {}
}

/// One agent activation within a workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub agent_name: String,
    pub input: Vec<Message>,
    pub output: Vec<Message>,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// `None` when routing ended after this step.
    pub next_agent: Option<String>,
    pub step_number: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub steps: Vec<StepResult>,
    /// The whole conversation at the end of the run.
    pub final_output: Vec<Message>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Set when a cycle callback rejected the run; the steps and output
    /// are what was gathered before the rejection.
    pub error: Option<String>,
}

impl WorkflowResult {
    pub fn last_content(&self) -> Option<&str> {
        self.final_output.last().map(|m| m.content.as_str())
    }
}

/// A set of agents plus the strategy that moves work between them.
pub struct Workflow {
    id: String,
    swarm: Arc<Swarm>,
    agents: Vec<Arc<Agent>>,
    routes: RoutingTable,
    cycle_handling: CycleHandling,
    cycle_callback: Option<CycleCallback>,
    observers: Vec<Arc<dyn WorkflowObserver>>,
}

impl Workflow {
    pub fn new(swarm: Arc<Swarm>, workflow_type: WorkflowType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            swarm,
            agents: Vec::new(),
            routes: RoutingTable::new(workflow_type),
            cycle_handling: CycleHandling::default(),
            cycle_callback: None,
            observers: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workflow_type(&self) -> WorkflowType {
        self.routes.workflow_type
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn agent(&self, name: &str) -> Option<&Arc<Agent>> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn agents(&self) -> &[Arc<Agent>] {
        &self.agents
    }

    /// Add an agent, replacing any earlier agent with the same name.
    pub fn add_agent(&mut self, agent: Arc<Agent>) {
        match self.agents.iter_mut().find(|a| a.name == agent.name) {
            Some(slot) => *slot = agent,
            None => {
                self.routes.agents.push(agent.name.clone());
                self.agents.push(agent);
            }
        }
    }

    pub fn add_agent_to_team(&mut self, agent: Arc<Agent>, team: TeamType) {
        let name = agent.name.clone();
        self.add_agent(agent);
        self.routes.teams.entry(team).or_default().push(name);
    }

    /// Put an already added agent on a team.
    pub fn set_team(&mut self, agent: &str, team: TeamType) -> Result<()> {
        self.require(agent)?;
        let members = self.routes.teams.entry(team).or_default();
        if !members.iter().any(|m| m == agent) {
            members.push(agent.to_string());
        }
        Ok(())
    }

    pub fn set_team_leader(&mut self, agent: &str, team: TeamType) -> Result<()> {
        self.require(agent)?;
        self.routes.leaders.insert(team, agent.to_string());
        Ok(())
    }

    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        self.require(from)?;
        self.require(to)?;
        self.routes
            .connections
            .entry(from.to_string())
            .or_default()
            .push(to.to_string());
        Ok(())
    }

    pub fn set_cycle_handling(&mut self, handling: CycleHandling) {
        self.cycle_handling = handling;
    }

    /// Consulted when [`CycleHandling::ContinueOnCycle`] is set.
    pub fn set_cycle_callback<F>(&mut self, callback: F)
    where
        F: Fn(&str, &str) -> Result<bool> + Send + Sync + 'static,
    {
        self.cycle_callback = Some(Arc::new(callback));
    }

    pub fn add_observer(&mut self, observer: Arc<dyn WorkflowObserver>) {
        self.observers.push(observer);
    }

    fn require(&self, agent: &str) -> Result<()> {
        if self.routes.is_known(agent) {
            Ok(())
        } else {
            Err(HiveError::UnknownNode(agent.to_string()))
        }
    }

    fn cycle_policy(&self) -> CyclePolicy {
        match (self.cycle_handling, &self.cycle_callback) {
            (CycleHandling::StopOnCycle, _) => CyclePolicy::Stop,
            (CycleHandling::ContinueOnCycle, Some(callback)) => CyclePolicy::Ask(Arc::clone(callback)),
            (CycleHandling::ContinueOnCycle, None) => CyclePolicy::Fail,
        }
    }

    /// Run the workflow on `request`, starting with `start_agent`.
    pub async fn execute(
        &self,
        start_agent: &str,
        request: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult> {
        self.require(start_agent)?;
        let start_time = Utc::now();
        info!(
            workflow_id = %self.id,
            workflow_type = %self.routes.workflow_type,
            start_agent,
            "Workflow started"
        );
        for observer in &self.observers {
            observer.on_workflow_start(&self.id, start_agent);
        }

        let steps = Arc::new(Mutex::new(Vec::new()));
        let step = Arc::new(StepRunner {
            swarm: Arc::clone(&self.swarm),
            routes: self.routes.clone(),
            steps: Arc::clone(&steps),
            observers: self.observers.clone(),
            shared_context: self.routes.workflow_type == WorkflowType::Collaborative,
        });

        let mut builder = GraphBuilder::new(
            format!("workflow-{}", self.id),
            self.routes.workflow_type.to_string(),
        )
        .with_config(&self.swarm.config().graph)
        .cycle_policy(self.cycle_policy())
        .node(Node::sync(END_NODE, "End", Ok))
        .entry_point(start_agent)
        .exit_point(END_NODE);

        for agent in &self.agents {
            let runner = Arc::clone(&step);
            let member = Arc::clone(agent);
            builder = builder.node(
                Node::new(agent.name.clone(), agent.name.clone(), move |ctx, state| {
                    let runner = Arc::clone(&runner);
                    let member = Arc::clone(&member);
                    async move { runner.run(member, ctx, state).await }
                })
                .with_description(format!("{} workflow agent", self.routes.workflow_type)),
            );

            let router = Arc::clone(&step);
            let current = agent.name.clone();
            builder = builder.conditional_edge(agent.name.clone(), END_NODE, move |state| {
                router.route(&current, state)
            });
        }

        let observers = self.observers.clone();
        let builder = builder.on(move |event, _state| {
            if let GraphEvent::CycleDetected { from, to, visits } = event {
                for observer in &observers {
                    observer.on_cycle_detected(from, to, *visits);
                }
            }
        });

        let graph = builder.build()?;
        let mut state = GraphState::new();
        state.push_message(Message::user(request))?;

        let outcome = graph.execute(state, cancel).await;
        let steps = std::mem::take(&mut *steps.lock().unwrap_or_else(|e| e.into_inner()));
        let (state, error) = match outcome {
            Ok(state) => (state, None),
            Err(failure) if matches!(failure.error, HiveError::CycleRejected { .. }) => {
                warn!(workflow_id = %self.id, error = %failure.error, "Cycle callback stopped the workflow");
                (failure.state, Some(failure.error.to_string()))
            }
            Err(failure) => {
                error!(workflow_id = %self.id, error = %failure.error, "Workflow failed");
                return Err(failure.error);
            }
        };

        let result = WorkflowResult {
            workflow_id: self.id.clone(),
            steps,
            final_output: state.messages()?,
            start_time,
            end_time: Utc::now(),
            error,
        };
        info!(workflow_id = %self.id, steps = result.steps.len(), "Workflow complete");
        for observer in &self.observers {
            observer.on_workflow_end(&result);
        }
        Ok(result)
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("routes", &self.routes)
            .field("cycle_handling", &self.cycle_handling)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Shared by every agent node of one workflow run.
struct StepRunner {
    swarm: Arc<Swarm>,
    routes: RoutingTable,
    steps: Arc<Mutex<Vec<StepResult>>>,
    observers: Vec<Arc<dyn WorkflowObserver>>,
    shared_context: bool,
}

impl StepRunner {
    fn record(&self, step: StepResult) {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(step);
    }

    fn next_step_number(&self) -> usize {
        self.steps.lock().unwrap_or_else(|e| e.into_inner()).len() + 1
    }

    fn route(&self, current: &str, state: &GraphState) -> Result<String> {
        let messages = state.messages()?;
        Ok(self
            .routes
            .next_agent(current, &messages, &processed_ledger(state))
            .unwrap_or_else(|| END_NODE.to_string()))
    }

    fn context_for(&self, state: &GraphState, agent: &str) -> ContextVariables {
        if self.shared_context {
            return context_from_state(state);
        }
        state
            .get(AGENT_VARS_KEY)
            .and_then(|all| all.get(agent))
            .and_then(|vars| vars.as_object())
            .map(|vars| vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    fn store_context(&self, state: &mut GraphState, agent: &str, variables: ContextVariables) {
        if self.shared_context {
            for (key, value) in variables {
                state.set(format!("{}{}", VAR_PREFIX, key), value);
            }
            return;
        }
        let mut all = state
            .get(AGENT_VARS_KEY)
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        all.insert(
            agent.to_string(),
            serde_json::Value::Object(variables.into_iter().collect()),
        );
        state.set(AGENT_VARS_KEY, serde_json::Value::Object(all));
    }

    async fn run(&self, agent: Arc<Agent>, ctx: NodeContext, mut state: GraphState) -> Result<GraphState> {
        let name = agent.name.clone();
        let input = state.messages()?;
        if let Some(last) = input.last() {
            mark_processed(&mut state, &name, message_id(last));
        }

        let step_number = self.next_step_number();
        for observer in &self.observers {
            observer.on_agent_start(&name, step_number);
        }
        info!(agent = %name, step = step_number, "Workflow step started");

        let request = RunRequest::new(agent)
            .with_messages(input.clone())
            .with_context_variables(self.context_for(&state, &name));
        let start_time = Utc::now();
        let timer = Instant::now();
        let outcome = self.swarm.run(request, &ctx.cancel).await;
        let end_time = Utc::now();
        for observer in &self.observers {
            observer.on_agent_complete(&name, step_number, timer.elapsed());
        }

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                self.record(StepResult {
                    agent_name: name,
                    input,
                    output: Vec::new(),
                    error: Some(e.to_string()),
                    start_time,
                    end_time,
                    next_agent: None,
                    step_number,
                });
                return Err(e);
            }
        };

        let mut messages = input.clone();
        messages.extend(response.messages.iter().cloned());
        state.set_messages(&messages)?;
        self.store_context(&mut state, &name, response.context_variables);

        let next_agent = self
            .routes
            .next_agent(&name, &messages, &processed_ledger(&state));
        if let Some(last) = response.messages.last() {
            let to = next_agent.as_deref().unwrap_or(END_NODE);
            for observer in &self.observers {
                observer.on_message_sent(&name, to, &last.content);
            }
        }

        self.record(StepResult {
            agent_name: name,
            input,
            output: response.messages,
            error: None,
            start_time,
            end_time,
            next_agent,
            step_number,
        });
        Ok(state)
    }
}

fn processed_ledger(state: &GraphState) -> ProcessedLedger {
    state
        .get(PROCESSED_KEY)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn mark_processed(state: &mut GraphState, agent: &str, id: String) {
    let mut ledger = processed_ledger(state);
    let seen = ledger.entry(agent.to_string()).or_default();
    if !seen.contains(&id) {
        seen.push(id);
    }
    if let Ok(value) = serde_json::to_value(&ledger) {
        state.set(PROCESSED_KEY, value);
    }
}
