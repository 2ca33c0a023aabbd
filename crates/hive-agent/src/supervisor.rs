use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_core::agent::Agent;
use hive_core::error::{HiveError, Result};
use hive_core::traits::MemoryStore;
use hive_core::types::{MemoryEntry, Message};
use hive_memory::InMemoryStore;

use crate::swarm::{RunRequest, Swarm};

/// Turn budget for a worker handling one task.
const WORKER_MAX_TURNS: usize = 5;

/// Keyword table for task classification. Order breaks ties.
const TASK_TYPES: &[(&str, &[&str])] = &[
    (
        "research",
        &["research", "investigate", "analyze", "study", "find", "search"],
    ),
    (
        "coding",
        &["code", "program", "function", "algorithm", "implement", "write a program"],
    ),
    ("writing", &["write", "compose", "create", "draft", "author"]),
    ("analysis", &["analyze", "evaluate", "assess", "review"]),
];

/// Describes something a worker is good at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub keywords: Vec<String>,
    /// Weight applied when any keyword matches a task.
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_priority() -> u32 {
    1
}

impl WorkerCapability {
    pub fn new<I, S>(name: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            description: String::new(),
            keywords: keywords.into_iter().map(Into::into).collect(),
            priority: default_priority(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Case-insensitive substring match of any keyword.
    pub fn matches(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.keywords
            .iter()
            .any(|k| text.contains(&k.to_lowercase()))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerPerformance {
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub average_time: Duration,
    pub success_rate: f64,
    pub last_update: Option<DateTime<Utc>>,
}

impl WorkerPerformance {
    pub fn total_tasks(&self) -> u32 {
        self.tasks_completed + self.tasks_failed
    }
}

/// An agent registered with a supervisor.
#[derive(Debug, Clone)]
pub struct Worker {
    pub agent: Arc<Agent>,
    /// Compared against the inferred task type during scoring.
    pub role: String,
    pub capabilities: Vec<WorkerCapability>,
    pub available: bool,
    pub performance: WorkerPerformance,
}

impl Worker {
    pub fn new(agent: Arc<Agent>, role: impl Into<String>) -> Self {
        Self {
            agent,
            role: role.into(),
            capabilities: vec![],
            available: true,
            performance: WorkerPerformance::default(),
        }
    }

    pub fn with_capability(mut self, capability: WorkerCapability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn name(&self) -> &str {
        &self.agent.name
    }

    /// Fold one finished task into the rolling metrics and record it in
    /// the worker's memory.
    pub fn update_performance(&mut self, task: &Task, duration: Duration) {
        let success = task.status == TaskStatus::Completed;
        let perf = &mut self.performance;
        if success {
            perf.tasks_completed += 1;
        } else {
            perf.tasks_failed += 1;
        }
        let total = perf.total_tasks();

        perf.average_time = if perf.average_time.is_zero() {
            duration
        } else {
            (perf.average_time * (total - 1) + duration) / total
        };
        perf.success_rate = f64::from(perf.tasks_completed) / f64::from(total);
        perf.last_update = Some(Utc::now());

        self.agent.remember(
            MemoryEntry::new(
                "performance_metric",
                format!(
                    "Task completed: {}, Duration: {:?}, Success: {}",
                    task.description, duration, success
                ),
            )
            .with_importance(0.6)
            .with_context("task_id", json!(task.id))
            .with_context("duration_ms", json!(duration.as_millis() as u64))
            .with_context("success", json!(success))
            .with_context("total_tasks", json!(total)),
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub description: String,
    /// Inferred when the task is routed.
    pub task_type: String,
    pub assigned_to: Option<String>,
    pub status: TaskStatus,
    pub messages: Vec<Message>,
    pub result: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub priority: i32,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            id: id.into(),
            messages: vec![Message::user(description.clone())],
            description,
            task_type: String::new(),
            assigned_to: None,
            status: TaskStatus::Pending,
            result: String::new(),
            created_at: Utc::now(),
            completed_at: None,
            attempts: 0,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Classify a task description by counting keyword hits per category.
/// Returns `"general"` when nothing matches.
pub fn analyze_task_type(description: &str) -> &'static str {
    let description = description.to_lowercase();
    let mut best = ("general", 0);
    for (task_type, keywords) in TASK_TYPES {
        let hits = keywords
            .iter()
            .filter(|k| description.contains(*k))
            .count();
        if hits > best.1 {
            best = (*task_type, hits);
        }
    }
    best.0
}

/// Suitability of `worker` for `task`; `task.task_type` must already be set.
pub fn score_worker(worker: &Worker, task: &Task) -> f64 {
    let mut score: f64 = worker
        .capabilities
        .iter()
        .filter(|c| c.matches(&task.description))
        .map(|c| f64::from(c.priority) * 0.3)
        .sum();

    if worker.performance.tasks_completed > 0 {
        let perf = &worker.performance;
        score += f64::from(perf.tasks_completed) / f64::from(perf.total_tasks()) * 0.2;
    }
    if worker.available {
        score += 0.2;
    }
    if worker.role == task.task_type {
        score += 0.3;
    }
    score
}

/// Routes tasks to the best-scoring worker and tracks how they do.
pub struct Supervisor {
    swarm: Arc<Swarm>,
    agent: Arc<Agent>,
    workers: Vec<Worker>,
    history: Vec<Task>,
}

impl Supervisor {
    /// Agents without memory get an in-memory store sized from the swarm
    /// config, here and in [`Supervisor::add_worker`].
    pub fn new(swarm: Arc<Swarm>, agent: Arc<Agent>) -> Self {
        let agent = with_default_memory(agent, &swarm);
        Self {
            swarm,
            agent,
            workers: vec![],
            history: vec![],
        }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Register a worker, replacing any with the same agent name.
    pub fn add_worker(&mut self, mut worker: Worker) {
        worker.agent = with_default_memory(worker.agent, &self.swarm);
        match self.workers.iter_mut().find(|w| w.name() == worker.name()) {
            Some(existing) => *existing = worker,
            None => self.workers.push(worker),
        }
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn worker(&self, name: &str) -> Option<&Worker> {
        self.workers.iter().find(|w| w.name() == name)
    }

    pub fn set_available(&mut self, name: &str, available: bool) -> Result<()> {
        let worker = self
            .workers
            .iter_mut()
            .find(|w| w.name() == name)
            .ok_or_else(|| HiveError::UnknownNode(name.to_string()))?;
        worker.available = available;
        Ok(())
    }

    /// Every task coordinated so far, failed ones included.
    pub fn history(&self) -> &[Task] {
        &self.history
    }

    /// Infer the task's type and pick the highest-scoring available worker.
    /// Ties go to the worker registered first.
    pub fn route_task(&self, task: &mut Task) -> Result<&Worker> {
        let index = self.select(task)?;
        Ok(&self.workers[index])
    }

    fn select(&self, task: &mut Task) -> Result<usize> {
        task.task_type = analyze_task_type(&task.description).to_string();

        let mut best: Option<(usize, f64)> = None;
        for (i, worker) in self.workers.iter().enumerate() {
            if !worker.available {
                continue;
            }
            let score = score_worker(worker, task);
            debug!(worker = %worker.name(), task_type = %task.task_type, score, "Scored worker");
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((i, score));
            }
        }

        match best {
            Some((i, score)) if score > 0.0 => Ok(i),
            _ => Err(HiveError::NoSuitableWorker(task.task_type.clone())),
        }
    }

    /// Route `request` to a worker, run it, and return the worker's final
    /// reply.
    pub async fn coordinate(&mut self, request: &str, cancel: &CancellationToken) -> Result<String> {
        let mut task = Task::new(format!("task_{}", self.history.len()), request);
        let index = self.select(&mut task)?;

        let worker = &mut self.workers[index];
        task.assigned_to = Some(worker.name().to_string());
        task.status = TaskStatus::Assigned;
        info!(task_id = %task.id, task_type = %task.task_type, worker = %worker.name(), "Task assigned");

        let outcome = process_task(&self.swarm, worker, &mut task, cancel).await;
        let result = match outcome {
            Ok(()) => {
                self.agent.remember(
                    MemoryEntry::new(
                        "task_completion",
                        format!("Task completed successfully: {}", task.description),
                    )
                    .with_importance(0.7)
                    .with_context("task_id", json!(task.id)),
                );
                Ok(task.result.clone())
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Task failed");
                self.agent.remember(
                    MemoryEntry::new(
                        "task_error",
                        format!("Task failed: {}, Error: {}", task.description, e),
                    )
                    .with_importance(0.8)
                    .with_context("task_id", json!(task.id))
                    .with_context("error", json!(e.to_string())),
                );
                Err(e)
            }
        };
        self.history.push(task);
        result
    }
}

async fn process_task(
    swarm: &Swarm,
    worker: &mut Worker,
    task: &mut Task,
    cancel: &CancellationToken,
) -> Result<()> {
    let started = Instant::now();
    task.status = TaskStatus::InProgress;
    task.attempts += 1;

    let request = RunRequest::new(Arc::clone(&worker.agent))
        .with_messages(task.messages.clone())
        .with_max_turns(WORKER_MAX_TURNS)
        .with_execute_tools(true);
    let outcome = swarm.run(request, cancel).await;

    let outcome = match outcome {
        Ok(response) => {
            task.result = response.last_content().unwrap_or_default().to_string();
            task.messages.extend(response.messages);
            task.status = TaskStatus::Completed;
            Ok(())
        }
        Err(e) => {
            task.status = TaskStatus::Failed;
            Err(e)
        }
    };
    task.completed_at = Some(Utc::now());
    worker.update_performance(task, started.elapsed());
    outcome
}

fn with_default_memory(agent: Arc<Agent>, swarm: &Swarm) -> Arc<Agent> {
    if agent.memory.is_some() {
        return agent;
    }
    let capacity = swarm.config().memory.short_term_capacity;
    let store: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new(capacity));
    Arc::new((*agent).clone().with_memory(store))
}
