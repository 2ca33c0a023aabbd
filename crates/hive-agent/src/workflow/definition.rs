//! Declarative workflow definitions and the planner that asks a model to
//! write one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use hive_core::agent::Agent;
use hive_core::error::{HiveError, Result};
use hive_core::types::Message;

use super::{Workflow, WorkflowResult, WorkflowType};
use crate::swarm::{RunRequest, Swarm};

const ANALYZER_INSTRUCTIONS: &str = r#"You are a specialized agent that analyzes user tasks and determines the optimal workflow structure.
Your job is to:
1. Identify the main goal of the user's task
2. Break down the task into logical sub-tasks
3. Determine which agent types would be needed (research, writing, analysis, coding, etc.)
4. Suggest a workflow structure (collaborative, hierarchical, or supervisor-based)
5. Define the agent relationships and data flow

Output your analysis in the following JSON format:
{
  "mainGoal": "Brief description of the overall goal",
  "workflowType": "collaborative|hierarchical|supervisor",
  "agents": [
    {
      "name": "AgentName",
      "role": "Brief description of agent role",
      "instructions": "Detailed instructions for this agent",
      "model": "Recommended model",
      "connections": ["AgentName1", "AgentName2"]
    }
  ],
  "dataFlow": [
    {"from": "AgentName1", "to": "AgentName2", "description": "What data/results are passed"}
  ],
  "entryPoint": "Name of the agent that should start the workflow"
}"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub main_goal: String,
    /// `collaborative`, `hierarchical` or `supervisor`, any case.
    #[serde(default)]
    pub workflow_type: String,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub data_flow: Vec<DataFlow>,
    #[serde(default)]
    pub entry_point: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub connections: Vec<String>,
}

/// Informational edge describing what one agent hands to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFlow {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub description: String,
}

fn invalid(reason: impl Into<String>) -> HiveError {
    HiveError::Config(format!("invalid workflow definition: {}", reason.into()))
}

impl WorkflowDefinition {
    /// Parse the first `{` through the last `}` of free text.
    pub fn extract(text: &str) -> Result<Self> {
        let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
            return Err(invalid("could not find valid JSON in the response"));
        };
        if end <= start {
            return Err(invalid("could not find valid JSON in the response"));
        }
        Ok(serde_json::from_str(&text[start..=end])?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.main_goal.trim().is_empty() {
            return Err(invalid("main goal is required"));
        }
        if self.workflow_type.trim().is_empty() {
            return Err(invalid("workflow type is required"));
        }
        if self.agents.is_empty() {
            return Err(invalid("at least one agent is required"));
        }
        if self.entry_point.is_empty() {
            return Err(invalid("entry point agent is required"));
        }

        let mut names = HashSet::new();
        for agent in &self.agents {
            if agent.name.is_empty() {
                return Err(invalid("agent name cannot be empty"));
            }
            names.insert(agent.name.as_str());
        }
        if !names.contains(self.entry_point.as_str()) {
            return Err(invalid("entry point agent does not exist in the agent list"));
        }
        for agent in &self.agents {
            if let Some(missing) = agent.connections.iter().find(|c| !names.contains(c.as_str())) {
                return Err(invalid(format!(
                    "agent {} has connection to non-existent agent {}",
                    agent.name, missing
                )));
            }
        }
        Ok(())
    }

    pub fn workflow_type(&self) -> Result<WorkflowType> {
        self.workflow_type.parse()
    }

    /// Build a workflow. Agents named after a registered template inherit
    /// its tools, and its model when the definition leaves it empty.
    pub fn build(&self, swarm: Arc<Swarm>, templates: &HashMap<String, Arc<Agent>>) -> Result<Workflow> {
        self.validate()?;
        let mut workflow = Workflow::new(swarm, self.workflow_type()?);

        for def in &self.agents {
            let mut agent = Agent::new(&def.name)
                .with_instructions(&def.instructions)
                .with_model(&def.model);
            if let Some(template) = templates.get(&def.name) {
                agent.tools = template.tools.clone();
                agent.memory = template.memory.clone();
                if agent.model.is_empty() {
                    agent.model = template.model.clone();
                }
            }
            workflow.add_agent(Arc::new(agent));
        }

        for def in &self.agents {
            for target in &def.connections {
                workflow.connect(&def.name, target).map_err(|e| {
                    HiveError::Config(format!(
                        "error creating connection from {} to {}: {}",
                        def.name, target, e
                    ))
                })?;
            }
        }
        Ok(workflow)
    }
}

/// Asks a planning agent to design a workflow for a task, then runs it.
pub struct WorkflowPlanner {
    swarm: Arc<Swarm>,
    analyzer: Arc<Agent>,
    templates: HashMap<String, Arc<Agent>>,
}

impl WorkflowPlanner {
    pub fn new(swarm: Arc<Swarm>) -> Self {
        Self {
            swarm,
            analyzer: Arc::new(Agent::new("TaskAnalyzer").with_instructions(ANALYZER_INSTRUCTIONS)),
            templates: HashMap::new(),
        }
    }

    /// Model used by the planning agent.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let mut analyzer = (*self.analyzer).clone();
        analyzer.model = model.into();
        self.analyzer = Arc::new(analyzer);
        self
    }

    pub fn register_template(&mut self, name: impl Into<String>, agent: Arc<Agent>) {
        self.templates.insert(name.into(), agent);
    }

    pub async fn plan(&self, task: &str, cancel: &CancellationToken) -> Result<WorkflowDefinition> {
        let request = RunRequest::new(Arc::clone(&self.analyzer))
            .with_message(Message::user(format!(
                "Analyze the following task and design an optimal workflow: {}",
                task
            )))
            .with_max_turns(1)
            .with_execute_tools(false);
        let response = self.swarm.run(request, cancel).await?;
        let text = response.last_content().ok_or(HiveError::EmptyResponse)?;
        debug!(chars = text.len(), "Planner replied");

        let definition = WorkflowDefinition::extract(text)?;
        definition.validate()?;
        info!(
            goal = %definition.main_goal,
            workflow_type = %definition.workflow_type,
            agents = definition.agents.len(),
            "Workflow planned"
        );
        Ok(definition)
    }

    pub fn build(&self, definition: &WorkflowDefinition) -> Result<Workflow> {
        definition.build(Arc::clone(&self.swarm), &self.templates)
    }

    pub async fn plan_and_execute(&self, task: &str, cancel: &CancellationToken) -> Result<WorkflowResult> {
        let definition = self.plan(task, cancel).await?;
        let workflow = self.build(&definition)?;
        workflow.execute(&definition.entry_point, task, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_test_utils::{echo_tool, MockModelClient};

    const PLAN: &str = r#"Here is the plan:
{
  "mainGoal": "Write a blog post",
  "workflowType": "Collaborative",
  "agents": [
    {"name": "Researcher", "role": "finds facts", "instructions": "Research.", "model": "", "connections": ["Writer"]},
    {"name": "Writer", "role": "writes", "instructions": "Write.", "model": "small-model"}
  ],
  "dataFlow": [{"from": "Researcher", "to": "Writer", "description": "notes"}],
  "entryPoint": "Researcher"
}
Good luck!"#;

    #[test]
    fn test_extract_and_validate() {
        let def = WorkflowDefinition::extract(PLAN).unwrap();
        assert_eq!(def.main_goal, "Write a blog post");
        assert_eq!(def.workflow_type().unwrap(), WorkflowType::Collaborative);
        assert_eq!(def.agents[0].connections, vec!["Writer"]);
        assert!(def.agents[1].connections.is_empty());
        assert_eq!(def.data_flow[0].description, "notes");
        def.validate().unwrap();

        assert!(WorkflowDefinition::extract("no json here").is_err());
        assert!(WorkflowDefinition::extract("} backwards {").is_err());
    }

    #[test]
    fn test_validation_errors() {
        let base = WorkflowDefinition::extract(PLAN).unwrap();

        let mut def = base.clone();
        def.main_goal.clear();
        assert!(def.validate().unwrap_err().to_string().contains("main goal is required"));

        let mut def = base.clone();
        def.entry_point = "Editor".into();
        assert!(def
            .validate()
            .unwrap_err()
            .to_string()
            .contains("entry point agent does not exist"));

        let mut def = base;
        def.agents[1].connections.push("Ghost".into());
        assert!(def
            .validate()
            .unwrap_err()
            .to_string()
            .contains("agent Writer has connection to non-existent agent Ghost"));
    }

    #[test]
    fn test_build_applies_templates() {
        let client = Arc::new(MockModelClient::new());
        let swarm = Arc::new(Swarm::new(client));
        let mut templates = HashMap::new();
        templates.insert(
            "Researcher".to_string(),
            Arc::new(Agent::new("base").with_model("research-model").with_tool(echo_tool("search"))),
        );

        let def = WorkflowDefinition::extract(PLAN).unwrap();
        let workflow = def.build(swarm, &templates).unwrap();

        let researcher = workflow.agent("Researcher").unwrap();
        assert_eq!(researcher.model, "research-model");
        assert!(researcher.find_tool("search").is_some());
        assert_eq!(workflow.agent("Writer").unwrap().model, "small-model");
        assert_eq!(workflow.routes().connections["Researcher"], vec!["Writer"]);
    }

    #[tokio::test]
    async fn test_plan_and_execute() {
        let client = Arc::new(MockModelClient::new());
        client
            .push_text(PLAN)
            .push_text("Facts: rust is fast.")
            .push_text("Final answer: Rust is fast, here is why.");
        let swarm = Arc::new(Swarm::new(client.clone()));
        let planner = WorkflowPlanner::new(swarm).with_model("planner-model");

        let result = planner
            .plan_and_execute("Blog about rust speed", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(client.requests()[0].model, "planner-model");
        assert!(client.requests()[0].tools.is_empty());
        let agents: Vec<&str> = result.steps.iter().map(|s| s.agent_name.as_str()).collect();
        assert_eq!(agents, vec!["Researcher", "Writer"]);
        assert_eq!(result.last_content(), Some("Final answer: Rust is fast, here is why."));
    }

    #[tokio::test]
    async fn test_plan_rejects_prose() {
        let client = Arc::new(MockModelClient::new());
        client.push_text("I would use three agents.");
        let planner = WorkflowPlanner::new(Arc::new(Swarm::new(client)));
        let err = planner
            .plan("anything", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("could not find valid JSON"));
    }
}
