use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;

use hive_core::error::HiveError;

use super::executor::{Graph, GraphFailure};
use super::state::GraphState;

/// Registry of built graphs, addressed by graph id.
#[derive(Debug, Default, Clone)]
pub struct GraphRunner {
    graphs: Arc<RwLock<HashMap<String, Arc<Graph>>>>,
}

impl GraphRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a graph and return its id.
    pub fn register(&self, graph: Graph) -> String {
        let id = graph.id().to_string();
        self.graphs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), Arc::new(graph));
        id
    }

    pub fn get(&self, graph_id: &str) -> Option<Arc<Graph>> {
        self.graphs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(graph_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.graphs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn run(
        &self,
        graph_id: &str,
        state: GraphState,
        cancel: &CancellationToken,
    ) -> Result<GraphState, GraphFailure> {
        let Some(graph) = self.get(graph_id) else {
            return Err(GraphFailure::new(
                HiveError::UnknownGraph(graph_id.to_string()),
                state,
            ));
        };
        graph.execute(state, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, Node};

    #[tokio::test]
    async fn test_register_and_run() {
        let runner = GraphRunner::new();
        assert!(runner.is_empty());

        let graph = GraphBuilder::new("greeter", "")
            .node(Node::sync("hello", "hello", |s| Ok(s.with("greeted", true.into()))))
            .entry_point("hello")
            .exit_point("hello")
            .build()
            .unwrap();
        let id = runner.register(graph);
        assert_eq!(runner.len(), 1);
        assert_eq!(runner.get(&id).unwrap().name(), "greeter");

        let out = runner
            .run(&id, GraphState::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.get_bool("greeted"), Some(true));
    }

    #[tokio::test]
    async fn test_unknown_graph() {
        let runner = GraphRunner::new();
        let failure = runner
            .run("nope", GraphState::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.error.to_string(), "graph nope not found");
    }
}
