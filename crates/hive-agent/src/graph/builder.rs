use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hive_core::agent::Agent;
use hive_core::config::GraphConfig;
use hive_core::error::{HiveError, Result};

use super::edge::{Edge, EdgeKind};
use super::executor::{CyclePolicy, Graph, GraphEvent, GraphHook};
use super::node::Node;
use super::nodes::{keyword_router, route_by_key, route_key};
use super::state::GraphState;
use crate::swarm::Swarm;

/// Fluent construction of a [`Graph`].
///
/// Nothing is checked until [`GraphBuilder::build`], which rejects graphs
/// without an entry point or with references to undeclared nodes.
pub struct GraphBuilder {
    name: String,
    description: String,
    nodes: HashMap<String, Node>,
    edges: Vec<Edge>,
    entry: Option<String>,
    exits: Vec<String>,
    hooks: Vec<GraphHook>,
    cycle_policy: CyclePolicy,
    max_visits: u32,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            nodes: HashMap::new(),
            edges: Vec::new(),
            entry: None,
            exits: Vec::new(),
            hooks: Vec::new(),
            cycle_policy: CyclePolicy::default(),
            max_visits: GraphConfig::default().max_visits,
        }
    }

    /// Take the visit limit from configuration.
    pub fn with_config(mut self, config: &GraphConfig) -> Self {
        self.max_visits = config.max_visits;
        self
    }

    /// Add a node, replacing any earlier node with the same id.
    pub fn node(mut self, node: Node) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn agent_node(
        self,
        id: impl Into<String>,
        name: impl Into<String>,
        agent: Arc<Agent>,
        swarm: Arc<Swarm>,
    ) -> Self {
        self.node(Node::agent(id, name, agent, swarm))
    }

    /// Add a keyword router node plus one conditional edge per destination.
    ///
    /// The node matches the last message (case-insensitive) against the
    /// keywords in order and writes the chosen destination to
    /// `"{id}_route"`; the first route is the default.
    pub fn router_node(mut self, id: impl Into<String>, routes: &[(&str, &str)]) -> Self {
        let id = id.into();
        let key = route_key(&id);
        let mut seen = HashSet::new();
        for (_, dest) in routes {
            if seen.insert(*dest) {
                self.edges.push(Edge::with_kind(
                    id.clone(),
                    *dest,
                    EdgeKind::Conditional(route_by_key(&key)),
                ));
            }
        }
        self.node(keyword_router(id, routes))
    }

    pub fn add_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.add_edge(Edge::standard(from, to))
    }

    pub fn conditional_edge<F>(self, from: impl Into<String>, to: impl Into<String>, router: F) -> Self
    where
        F: Fn(&GraphState) -> Result<String> + Send + Sync + 'static,
    {
        self.add_edge(Edge::conditional(from, to, router))
    }

    pub fn fallback_edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.add_edge(Edge::fallback(from, to))
    }

    pub fn entry_point(mut self, id: impl Into<String>) -> Self {
        self.entry = Some(id.into());
        self
    }

    pub fn exit_point(mut self, id: impl Into<String>) -> Self {
        self.exits.push(id.into());
        self
    }

    /// Register an observer for [`GraphEvent`]s.
    pub fn on<F>(mut self, hook: F) -> Self
    where
        F: Fn(&GraphEvent, &GraphState) + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn cycle_policy(mut self, policy: CyclePolicy) -> Self {
        self.cycle_policy = policy;
        self
    }

    pub fn max_visits(mut self, max_visits: u32) -> Self {
        self.max_visits = max_visits;
        self
    }

    pub fn build(self) -> Result<Graph> {
        let entry = self.entry.ok_or(HiveError::MissingEntryPoint)?;

        let known = |id: &str| -> Result<()> {
            if self.nodes.contains_key(id) {
                Ok(())
            } else {
                Err(HiveError::UnknownNode(id.to_string()))
            }
        };
        known(&entry)?;
        for exit in &self.exits {
            known(exit)?;
        }
        for edge in &self.edges {
            known(&edge.from)?;
            known(&edge.to)?;
        }

        let mut edges: HashMap<String, Vec<Edge>> = HashMap::new();
        for edge in self.edges {
            edges.entry(edge.from.clone()).or_default().push(edge);
        }

        Ok(Graph {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name,
            description: self.description,
            nodes: self.nodes,
            edges,
            entry,
            exits: self.exits.into_iter().collect(),
            hooks: self.hooks,
            cycle_policy: self.cycle_policy,
            max_visits: self.max_visits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::types::Message;
    use tokio_util::sync::CancellationToken;

    fn passthrough(id: &str) -> Node {
        Node::sync(id, id, Ok)
    }

    #[test]
    fn test_build_requires_entry_point() {
        let err = GraphBuilder::new("g", "").node(passthrough("a")).build().unwrap_err();
        assert!(matches!(err, HiveError::MissingEntryPoint));
    }

    #[test]
    fn test_build_rejects_undeclared_references() {
        let err = GraphBuilder::new("g", "")
            .node(passthrough("a"))
            .entry_point("missing")
            .build()
            .unwrap_err();
        assert!(matches!(err, HiveError::UnknownNode(ref id) if id == "missing"));

        let err = GraphBuilder::new("g", "")
            .node(passthrough("a"))
            .edge("a", "ghost")
            .entry_point("a")
            .build()
            .unwrap_err();
        assert!(matches!(err, HiveError::UnknownNode(ref id) if id == "ghost"));

        let err = GraphBuilder::new("g", "")
            .node(passthrough("a"))
            .entry_point("a")
            .exit_point("end")
            .build()
            .unwrap_err();
        assert!(matches!(err, HiveError::UnknownNode(ref id) if id == "end"));
    }

    #[test]
    fn test_graph_ids_are_unique_and_edges_keep_order() {
        let build = || {
            GraphBuilder::new("g", "two edges")
                .node(passthrough("a"))
                .node(passthrough("b"))
                .node(passthrough("c"))
                .edge("a", "c")
                .fallback_edge("a", "b")
                .entry_point("a")
                .with_config(&GraphConfig { max_visits: 4 })
                .build()
                .unwrap()
        };
        let first = build();
        let second = build();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.max_visits(), 4);
        assert_eq!(first.description(), "two edges");
        let targets: Vec<&str> = first.edges_from("a").iter().map(|e| e.to.as_str()).collect();
        assert_eq!(targets, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_router_node_routes_by_keyword() {
        let graph = GraphBuilder::new("support", "")
            .router_node("triage", &[("refund", "billing"), ("bug", "engineering")])
            .node(Node::sync("billing", "billing", |s| Ok(s.with("handled_by", "billing".into()))))
            .node(Node::sync("engineering", "engineering", |s| {
                Ok(s.with("handled_by", "engineering".into()))
            }))
            .entry_point("triage")
            .exit_point("billing")
            .exit_point("engineering")
            .build()
            .unwrap();
        let cancel = CancellationToken::new();

        let mut state = GraphState::new();
        state.push_message(Message::user("I found a BUG in checkout")).unwrap();
        let out = graph.execute(state, &cancel).await.unwrap();
        assert_eq!(out.get_str("handled_by"), Some("engineering"));
        assert_eq!(out.get_str("triage_route"), Some("engineering"));

        let mut state = GraphState::new();
        state.push_message(Message::user("hello there")).unwrap();
        let out = graph.execute(state, &cancel).await.unwrap();
        assert_eq!(out.get_str("handled_by"), Some("billing"));

        let failure = graph.execute(GraphState::new(), &cancel).await.unwrap_err();
        assert_eq!(failure.error.to_string(), "no valid transition from node triage");
    }
}
