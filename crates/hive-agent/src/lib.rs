//! Agent orchestration runtime: the turn executor, streaming, workflow
//! graphs, the supervisor/worker router, and the concurrent dispatcher.

pub mod dispatch;
pub mod graph;
pub mod stream;
pub mod supervisor;
pub mod swarm;
mod tools;
pub mod workflow;

pub use dispatch::{DispatchResult, Dispatcher};
pub use graph::{
    Edge, EdgeKind, Graph, GraphBuilder, GraphEvent, GraphFailure, GraphRunner, GraphState, Node,
    NodeContext,
};
pub use stream::{StreamHandler, ToolCallAssembler};
pub use supervisor::{
    analyze_task_type, score_worker, Supervisor, Task, TaskStatus, Worker, WorkerCapability,
    WorkerPerformance,
};
pub use swarm::{Response, RunRequest, Swarm, SwarmBuilder};
pub use workflow::{
    CycleHandling, StepResult, TeamType, Workflow, WorkflowDefinition, WorkflowObserver,
    WorkflowPlanner, WorkflowResult, WorkflowType,
};
