//! Workflow graph engine.
//!
//! A graph is a set of [`Node`]s joined by [`Edge`]s. A run threads a
//! [`GraphState`] from the entry point through one node at a time: each node
//! gets a clone of the state and returns the next one, and the outgoing
//! edges of the node pick where to go. The run ends when an exit node
//! completes, a structural error occurs, or a node exceeds its visit limit.

pub mod builder;
pub mod edge;
pub mod executor;
pub mod node;
pub mod nodes;
pub mod runner;
pub mod state;

pub use builder::GraphBuilder;
pub use edge::{Edge, EdgeKind, RouterFn};
pub use executor::{CycleCallback, CyclePolicy, Graph, GraphEvent, GraphFailure, GraphHook};
pub use node::{context_from_state, Node, NodeContext, VAR_PREFIX};
pub use nodes::{human_input_node, keyword_router, parallel_node, route_by_key, route_key};
pub use runner::GraphRunner;
pub use state::{GraphState, MESSAGES_KEY, VISITS_KEY};
