use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use hive::taskflow::{self, COMPLETE_KEY, FORCE_EXIT_KEY, PHASE_KEY, REPORT_KEY, TASK_KEY};
use hive_agent::graph::{GraphEvent, GraphRunner, GraphState};
use hive_agent::Swarm;
use hive_core::config::GraphConfig;
use hive_core::types::Role;
use hive_llm::ScriptedClient;

#[tokio::test]
async fn test_task_walks_through_every_phase() {
    let client = Arc::new(ScriptedClient::new());
    taskflow::script_demo(&client);
    let swarm = Arc::new(Swarm::new(client.clone()));

    let entered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&entered);
    let graph = taskflow::graph_builder(swarm, taskflow::DEFAULT_PROMPT, &GraphConfig::default())
        .on(move |event, _| {
            if let GraphEvent::NodeEnter { node, .. } = event {
                sink.lock().unwrap().push(node.clone());
            }
        })
        .build()
        .unwrap();

    let runner = GraphRunner::new();
    let id = runner.register(graph);
    let state = runner
        .run(&id, GraphState::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        *entered.lock().unwrap(),
        vec![
            "intake", "router", "creator", "router", "assigner", "router", "tracker", "router",
            "exit"
        ]
    );
    assert_eq!(client.remaining(), 0);

    assert_eq!(state.get_bool(COMPLETE_KEY), Some(true));
    assert_eq!(state.get_bool(FORCE_EXIT_KEY), None);
    assert_eq!(state.get_str(PHASE_KEY), Some("tracking"));
    assert_eq!(state.visits("router"), 4);

    let task = state.get(TASK_KEY).unwrap();
    assert_eq!(task["title"], json!("Redesign homepage"));
    assert_eq!(task["assigned_to"], json!("TM001"));
    assert_eq!(task["deadline"], json!("2025-07-01"));
    let report = state.get_str(REPORT_KEY).unwrap();
    assert!(report.starts_with("TASK REPORT"));
    assert!(report.contains("Priority: HIGH"));

    let messages = state.messages().unwrap();
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, taskflow::DEFAULT_PROMPT);
    let tools: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.name.as_deref())
        .collect();
    assert_eq!(tools, vec!["create_task", "assign_task", "generate_report"]);
    assert!(messages
        .last()
        .unwrap()
        .content
        .contains("The workflow is now complete"));
}

#[tokio::test]
async fn test_stalled_creator_forces_exit() {
    // No scripted replies: the creator only ever echoes and never makes a task.
    let swarm = Arc::new(Swarm::new(Arc::new(ScriptedClient::new())));
    let graph =
        taskflow::build_graph(swarm, "make me a task", &GraphConfig::default()).unwrap();

    let state = graph
        .execute(GraphState::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(state.get_bool(COMPLETE_KEY), Some(true));
    assert_eq!(state.get_bool(FORCE_EXIT_KEY), Some(true));
    assert_eq!(state.get_str(PHASE_KEY), Some("creation"));
    assert!(state.get(TASK_KEY).is_none());
    assert_eq!(state.visits("router"), 7);
    assert_eq!(state.visits("creator"), 6);
}

#[tokio::test]
async fn test_low_visit_limit_stops_the_loop() {
    let swarm = Arc::new(Swarm::new(Arc::new(ScriptedClient::new())));
    let graph = taskflow::build_graph(swarm, "make me a task", &GraphConfig { max_visits: 3 }).unwrap();

    let failure = graph
        .execute(GraphState::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(failure.error.to_string().contains("router"));
    assert_eq!(failure.state.get_bool(COMPLETE_KEY), None);
    assert_eq!(failure.state.visits("creator"), 3);
}
