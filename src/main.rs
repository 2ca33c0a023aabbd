use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hive::taskflow;
use hive_agent::graph::{GraphEvent, GraphRunner, GraphState};
use hive_agent::Swarm;
use hive_core::config::AppConfig;
use hive_core::types::Role;
use hive_llm::ScriptedClient;

#[derive(Parser)]
#[command(name = "hive", version, about = "Agent orchestration runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "hive.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved configuration
    Config,
    /// Run the task-management workflow against the offline client
    Demo {
        /// Request handed to the intake node
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hive=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", config.to_toml()?);
        }
        Commands::Demo { prompt } => {
            let prompt = if prompt.is_empty() {
                taskflow::DEFAULT_PROMPT.to_string()
            } else {
                prompt.join(" ")
            };
            run_demo(config, prompt).await?;
        }
    }
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        debug!(path = %path.display(), "No config file, using defaults");
        Ok(AppConfig::default())
    }
}

async fn run_demo(config: AppConfig, prompt: String) -> anyhow::Result<()> {
    let client = Arc::new(ScriptedClient::new());
    taskflow::script_demo(&client);
    let graph_config = config.graph.clone();
    let swarm = Arc::new(Swarm::new(client).with_config(config));

    let graph = taskflow::graph_builder(swarm, prompt, &graph_config)
        .on(|event, _state| match event {
            GraphEvent::NodeEnter { node, visits } => info!(node = %node, visits, "Entering node"),
            GraphEvent::NodeError { node, error } => warn!(node = %node, error = %error, "Node failed"),
            GraphEvent::CycleDetected { from, to, visits } => {
                warn!(from = %from, to = %to, visits, "Cycle detected")
            }
            _ => {}
        })
        .build()?;

    let runner = GraphRunner::new();
    let graph_id = runner.register(graph);

    println!("Starting Task Management Workflow simulation...");
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    match runner.run(&graph_id, GraphState::new(), &cancel).await {
        Ok(state) => {
            println!("\nWorkflow completed successfully!");
            print_state(&state);
            Ok(())
        }
        Err(failure) => {
            error!(error = %failure.error, "Workflow failed");
            print_state(&failure.state);
            Err(failure.error.into())
        }
    }
}

fn print_state(state: &GraphState) {
    if let Ok(messages) = state.messages() {
        println!("\nConversation history:");
        for (i, msg) in messages.iter().enumerate() {
            match msg.role {
                Role::User => println!("{}. User: {}", i + 1, msg.content),
                Role::Assistant if !msg.content.is_empty() => {
                    println!("{}. Assistant: {}", i + 1, msg.content)
                }
                Role::Tool => println!(
                    "{}. System: [{}] {}",
                    i + 1,
                    msg.name.as_deref().unwrap_or("tool"),
                    msg.content
                ),
                _ => {}
            }
        }
    }

    if let Some(task) = state.get(taskflow::TASK_KEY) {
        println!("\nFinal Task:");
        println!(
            "{}",
            serde_json::to_string_pretty(task).unwrap_or_else(|_| task.to_string())
        );
    }
    if let Some(report) = state.get_str(taskflow::REPORT_KEY) {
        println!("\nTask Report:\n{}", report);
    }
    println!("\nVisits: {:?}", state.visit_ledger());
}
