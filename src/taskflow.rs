//! Task-management workflow.
//!
//! `intake` seeds the conversation, then a router walks one task through
//! creation, assignment and tracking, sending control to the matching agent
//! until a report exists and the run can exit.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use hive_agent::graph::{route_by_key, route_key, Graph, GraphBuilder, GraphState, Node};
use hive_agent::Swarm;
use hive_core::agent::Agent;
use hive_core::config::GraphConfig;
use hive_core::error::Result;
use hive_core::tool::{FunctionTool, ToolContext, ToolResult};
use hive_core::types::Message;
use hive_llm::ScriptedClient;

pub const DEFAULT_PROMPT: &str =
    "I need to create a new task for redesigning our website homepage.";

pub const PHASE_KEY: &str = "workflow_phase";
pub const COMPLETE_KEY: &str = "workflow_complete";
pub const FORCE_EXIT_KEY: &str = "force_exit";
pub const TASK_KEY: &str = "var_current_task";
pub const REPORT_KEY: &str = "var_task_report";

const ROUTER: &str = "router";
const DESTINATIONS: &[&str] = &["creator", "assigner", "tracker", "exit"];

/// Router visits allowed before the run is forced to exit.
const ROUTER_VISIT_LIMIT: u32 = 6;
/// Agent visits allowed per phase before the router moves on regardless.
const PHASE_VISIT_LIMIT: u32 = 2;

const COMPLETION_MESSAGE: &str =
    "Your task has been created, assigned, and tracked successfully. The workflow is now complete.";

const TEAM: &[(&str, &str, &str)] = &[
    ("TM001", "Alice Smith", "frontend, design, javascript"),
    ("TM002", "Bob Johnson", "backend, database, python"),
    ("TM003", "Carol Williams", "project management, testing, documentation"),
];

/// Unbuilt graph, so callers can attach hooks or tweak limits.
pub fn graph_builder(swarm: Arc<Swarm>, prompt: impl Into<String>, config: &GraphConfig) -> GraphBuilder {
    let mut builder = GraphBuilder::new(
        "Task Management Workflow",
        "Simple workflow to handle task creation and assignment",
    )
    .with_config(config)
    .node(intake_node(prompt.into()))
    .agent_node("creator", "Task Creator", Arc::new(creator_agent()), Arc::clone(&swarm))
    .agent_node("assigner", "Task Assigner", Arc::new(assigner_agent()), Arc::clone(&swarm))
    .agent_node("tracker", "Task Tracker", Arc::new(tracker_agent()), swarm)
    .node(Node::sync(ROUTER, "Task Router", route_tasks))
    .node(exit_node())
    .edge("intake", ROUTER)
    .edge("creator", ROUTER)
    .edge("assigner", ROUTER)
    .edge("tracker", ROUTER)
    .entry_point("intake")
    .exit_point("exit");

    let key = route_key(ROUTER);
    for dest in DESTINATIONS {
        let router = route_by_key(&key);
        builder = builder.conditional_edge(ROUTER, *dest, move |state: &GraphState| router(state));
    }
    builder
}

pub fn build_graph(swarm: Arc<Swarm>, prompt: impl Into<String>, config: &GraphConfig) -> Result<Graph> {
    graph_builder(swarm, prompt, config).build()
}

/// Queue the replies that walk the offline client through one full task.
pub fn script_demo(client: &ScriptedClient) {
    client.push_tool_call(
        "create_task",
        json!({
            "title": "Redesign homepage",
            "description": "Refresh the layout and hero section of the website homepage",
            "priority": "high",
            "deadline": "2025-07-01"
        }),
    );
    client.push_text("Created the homepage redesign task with high priority.");
    client.push_tool_call(
        "assign_task",
        json!({"team_member_id": "TM001", "notes": "Frontend and design work"}),
    );
    client.push_text("Assigned the task to Alice Smith.");
    client.push_tool_call("generate_report", json!({}));
    client.push_text("The status report is ready.");
}

fn intake_node(prompt: String) -> Node {
    Node::sync("intake", "Task Intake", move |mut state| {
        state.set_messages(&[Message::user(prompt.clone())])?;
        state.set_str(PHASE_KEY, "creation");
        Ok(state)
    })
}

fn exit_node() -> Node {
    Node::sync("exit", "Task Completion", |mut state| {
        state.push_message(Message::assistant(COMPLETION_MESSAGE))?;
        state.set_bool(COMPLETE_KEY, true);
        Ok(state)
    })
}

/// Decide the next agent from the phase and what earlier agents left in
/// state, and record the decision under the router's route key.
pub fn route_tasks(mut state: GraphState) -> Result<GraphState> {
    let phase = state.get_str(PHASE_KEY).unwrap_or("creation").to_string();
    let task = state.get(TASK_KEY);
    let has_task = task.is_some();
    let assigned = task
        .and_then(|t| t.get("assigned_to"))
        .and_then(Value::as_str)
        .is_some_and(|who| !who.is_empty());
    let has_report = state.contains(REPORT_KEY);

    let (next_phase, mut dest) = match phase.as_str() {
        "creation" if has_task => ("assignment", "assigner"),
        "creation" => ("creation", "creator"),
        "assignment" if assigned || state.visits("assigner") >= PHASE_VISIT_LIMIT => {
            ("tracking", "tracker")
        }
        "assignment" => ("assignment", "assigner"),
        "tracking" if has_report || state.visits("tracker") >= PHASE_VISIT_LIMIT => {
            ("tracking", "exit")
        }
        "tracking" => ("tracking", "tracker"),
        _ => ("creation", "creator"),
    };

    let visits = state.visits(ROUTER);
    if dest != "exit" && visits > ROUTER_VISIT_LIMIT {
        warn!(visits, "Router loop detected, forcing exit");
        state.set_bool(FORCE_EXIT_KEY, true);
        dest = "exit";
    }

    info!(phase = next_phase, next = dest, "Routing task workflow");
    state.set_str(PHASE_KEY, next_phase);
    state.set_str(route_key(ROUTER), dest);
    Ok(state)
}

fn creator_agent() -> Agent {
    Agent::new("TaskCreator")
        .with_instructions(
            "You are a task creation specialist. Help users define clear, specific tasks \
             with proper descriptions and priorities, and suggest deadlines based on priority.",
        )
        .with_tool(
            FunctionTool::new("create_task", "Create a new task", create_task).with_parameters(json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string", "description": "Task title"},
                    "description": {"type": "string", "description": "Task description"},
                    "priority": {"type": "string", "description": "Task priority (high, medium, low)"},
                    "deadline": {"type": "string", "description": "Task deadline (YYYY-MM-DD)"}
                },
                "required": ["title", "description", "priority"]
            })),
        )
}

fn assigner_agent() -> Agent {
    Agent::new("TaskAssigner")
        .with_instructions(
            "You are a task assignment specialist. Match tasks to team members by skill, \
             balance workload, and update the task after assignment.",
        )
        .with_tool(FunctionTool::new(
            "list_team_members",
            "List available team members",
            list_team_members,
        ))
        .with_tool(
            FunctionTool::new("assign_task", "Assign a task to a team member", assign_task)
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "task_id": {"type": "string", "description": "Task ID"},
                        "team_member_id": {"type": "string", "description": "Team member ID"},
                        "notes": {"type": "string", "description": "Assignment notes"}
                    },
                    "required": ["team_member_id"]
                })),
        )
}

fn tracker_agent() -> Agent {
    Agent::new("TaskTracker")
        .with_instructions(
            "You are a task tracking specialist. Record status updates and progress, \
             and generate status reports.",
        )
        .with_tool(
            FunctionTool::new("update_task_status", "Update the status of a task", update_task_status)
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "task_id": {"type": "string", "description": "Task ID"},
                        "status": {"type": "string", "description": "New status (in_progress, blocked, completed)"},
                        "notes": {"type": "string", "description": "Status update notes"}
                    },
                    "required": ["status"]
                })),
        )
        .with_tool(
            FunctionTool::new("generate_report", "Generate a status report for a task", generate_report)
                .with_parameters(json!({
                    "type": "object",
                    "properties": {"task_id": {"type": "string", "description": "Task ID"}}
                })),
        )
}

fn arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn current_task(ctx: &ToolContext) -> Option<serde_json::Map<String, Value>> {
    ctx.get("current_task").and_then(Value::as_object).cloned()
}

fn field<'a>(task: &'a serde_json::Map<String, Value>, key: &str) -> &'a str {
    task.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn create_task(args: Value, ctx: &ToolContext) -> ToolResult {
    let (Some(title), Some(description), Some(priority)) =
        (arg(&args, "title"), arg(&args, "description"), arg(&args, "priority"))
    else {
        return ToolResult::failure("title, description and priority are required");
    };

    let now = Utc::now();
    let id = format!("TASK-{}", now.timestamp());
    let mut task = json!({
        "id": id,
        "title": title,
        "description": description,
        "priority": priority,
        "status": "created",
        "created_at": now.to_rfc3339(),
    });
    if let Some(deadline) = arg(&args, "deadline") {
        task["deadline"] = json!(deadline);
    }
    ctx.delta.set("current_task", task);
    ToolResult::success(format!("Task created: {} (ID: {})", title, id))
}

fn list_team_members(_args: Value, ctx: &ToolContext) -> ToolResult {
    let members: Vec<Value> = TEAM
        .iter()
        .map(|(id, name, skills)| json!({"id": id, "name": name, "skills": skills}))
        .collect();
    let count = members.len();
    ctx.delta.set("team_members", Value::Array(members));
    ToolResult::success(format!("Retrieved {} team members", count))
}

fn assign_task(args: Value, ctx: &ToolContext) -> ToolResult {
    let Some(member_id) = arg(&args, "team_member_id") else {
        return ToolResult::failure("team_member_id is required");
    };
    let Some(mut task) = current_task(ctx) else {
        return ToolResult::failure("no task to assign");
    };
    let member = TEAM
        .iter()
        .find(|(id, _, _)| *id == member_id)
        .map_or("Unknown", |(_, name, _)| *name);

    task.insert("status".into(), json!("assigned"));
    task.insert("assigned_to".into(), json!(member_id));
    task.insert("assignment_notes".into(), json!(arg(&args, "notes").unwrap_or_default()));
    task.insert("assigned_at".into(), json!(Utc::now().to_rfc3339()));

    let task_id = arg(&args, "task_id").unwrap_or(field(&task, "id")).to_string();
    let message = format!("Task '{}' (ID: {}) assigned to {}", field(&task, "title"), task_id, member);
    ctx.delta.set("current_task", Value::Object(task));
    ToolResult::success(message)
}

fn update_task_status(args: Value, ctx: &ToolContext) -> ToolResult {
    let Some(status) = arg(&args, "status") else {
        return ToolResult::failure("status is required");
    };
    let Some(mut task) = current_task(ctx) else {
        return ToolResult::failure("no task to update");
    };
    let notes = arg(&args, "notes").unwrap_or_default();
    let now = Utc::now().to_rfc3339();
    let previous = task.get("status").cloned().unwrap_or(Value::Null);

    let mut history = task
        .get("status_history")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    history.push(json!({"from": previous, "to": status, "timestamp": now, "notes": notes}));

    task.insert("status".into(), json!(status));
    task.insert("status_notes".into(), json!(notes));
    task.insert("last_updated".into(), json!(now));
    task.insert("status_history".into(), Value::Array(history));

    let task_id = arg(&args, "task_id").unwrap_or(field(&task, "id")).to_string();
    let message = format!(
        "Task '{}' (ID: {}) status updated to: {}",
        field(&task, "title"),
        task_id,
        status
    );
    ctx.delta.set("current_task", Value::Object(task));
    ToolResult::success(message)
}

fn generate_report(args: Value, ctx: &ToolContext) -> ToolResult {
    let Some(task) = current_task(ctx) else {
        return ToolResult::failure("no task to report on");
    };
    let task_id = arg(&args, "task_id").unwrap_or(field(&task, "id"));

    let mut report = format!(
        "TASK REPORT\n===========\nID: {}\nTitle: {}\nDescription: {}\nStatus: {}\nPriority: {}\nCreated: {}\n",
        task_id,
        field(&task, "title"),
        field(&task, "description"),
        field(&task, "status").to_uppercase(),
        field(&task, "priority").to_uppercase(),
        field(&task, "created_at"),
    );
    if let Some(who) = task.get("assigned_to").and_then(Value::as_str) {
        report.push_str(&format!("Assigned To: {}\n", who));
    }
    if let Some(deadline) = task.get("deadline").and_then(Value::as_str) {
        report.push_str(&format!("Deadline: {}\n", deadline));
    }

    ctx.delta.set("task_report", json!(report));
    ToolResult::success(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routed(state: GraphState) -> (String, String) {
        let out = route_tasks(state).unwrap();
        (
            out.get_str(PHASE_KEY).unwrap().to_string(),
            out.get_str(&route_key(ROUTER)).unwrap().to_string(),
        )
    }

    #[test]
    fn test_router_walks_phases() {
        let state = GraphState::new().with(PHASE_KEY, json!("creation"));
        assert_eq!(routed(state.clone()), ("creation".into(), "creator".into()));

        let state = state.with(TASK_KEY, json!({"id": "TASK-1"}));
        assert_eq!(routed(state.clone()), ("assignment".into(), "assigner".into()));

        let state = state
            .with(PHASE_KEY, json!("assignment"))
            .with(TASK_KEY, json!({"id": "TASK-1", "assigned_to": "TM002"}));
        assert_eq!(routed(state.clone()), ("tracking".into(), "tracker".into()));

        let state = state
            .with(PHASE_KEY, json!("tracking"))
            .with(REPORT_KEY, json!("TASK REPORT"));
        assert_eq!(routed(state), ("tracking".into(), "exit".into()));
    }

    #[test]
    fn test_router_defaults_unknown_phase_to_creation() {
        let state = GraphState::new().with(PHASE_KEY, json!("archived"));
        assert_eq!(routed(state), ("creation".into(), "creator".into()));
    }

    #[test]
    fn test_tools_update_task() {
        let ctx = ToolContext::new("TaskCreator", Default::default());
        let created = create_task(
            json!({"title": "Homepage", "description": "Redo it", "priority": "low"}),
            &ctx,
        );
        assert!(created.content().starts_with("Task created: Homepage"));
        let vars = ctx.delta.take();

        let ctx = ToolContext::new("TaskAssigner", vars);
        let assigned = assign_task(json!({"team_member_id": "TM003"}), &ctx);
        assert!(assigned.content().ends_with("assigned to Carol Williams"));
        let vars = ctx.delta.take();
        assert_eq!(vars["current_task"]["status"], json!("assigned"));

        let ctx = ToolContext::new("TaskTracker", vars);
        let report = generate_report(json!({}), &ctx).content();
        assert!(report.contains("Status: ASSIGNED"));
        assert!(report.contains("Assigned To: TM003"));
        assert!(!report.contains("Deadline"));
    }

    #[test]
    fn test_tools_reject_missing_input() {
        let ctx = ToolContext::new("TaskCreator", Default::default());
        assert!(create_task(json!({"title": "x"}), &ctx).is_error());
        assert!(assign_task(json!({"team_member_id": "TM001"}), &ctx).is_error());
        assert!(generate_report(json!({}), &ctx).is_error());
    }
}
