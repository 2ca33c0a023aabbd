use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hive_core::error::{HiveError, Result};

use super::edge::{Edge, EdgeKind};
use super::node::{Node, NodeContext};
use super::state::GraphState;

/// Lifecycle notifications delivered to graph hooks.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    GraphStart { graph: String },
    NodeEnter { node: String, visits: u32 },
    NodeExit { node: String, elapsed: Duration },
    NodeError { node: String, error: String },
    CycleDetected { from: String, to: String, visits: u32 },
    GraphComplete { graph: String, steps: usize },
}

/// Observer callback. Hooks see the state but cannot change it.
pub type GraphHook = Arc<dyn Fn(&GraphEvent, &GraphState) + Send + Sync>;

/// Decides whether a detected cycle from `from` into `to` may continue.
pub type CycleCallback = Arc<dyn Fn(&str, &str) -> Result<bool> + Send + Sync>;

/// What happens when a node is entered more often than the visit limit.
#[derive(Clone, Default)]
pub enum CyclePolicy {
    /// Abort with an infinite-loop error.
    #[default]
    Fail,
    /// End the run successfully with the state accumulated so far.
    Stop,
    /// Ask the callback: `Ok(true)` continues, `Ok(false)` stops like
    /// [`CyclePolicy::Stop`], `Err` aborts with [`HiveError::CycleRejected`].
    Ask(CycleCallback),
}

impl fmt::Debug for CyclePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => f.write_str("Fail"),
            Self::Stop => f.write_str("Stop"),
            Self::Ask(_) => f.write_str("Ask"),
        }
    }
}

/// A failed run together with the state as it was before the failing step.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct GraphFailure {
    pub error: HiveError,
    pub state: GraphState,
}

impl GraphFailure {
    pub fn new(error: HiveError, state: GraphState) -> Self {
        Self { error, state }
    }
}

impl From<GraphFailure> for HiveError {
    fn from(failure: GraphFailure) -> Self {
        failure.error
    }
}

/// A validated workflow graph. Built with [`super::GraphBuilder`].
#[derive(Clone)]
pub struct Graph {
    pub(super) id: String,
    pub(super) name: String,
    pub(super) description: String,
    pub(super) nodes: HashMap<String, Node>,
    /// Outgoing edges per source node, in declaration order.
    pub(super) edges: HashMap<String, Vec<Edge>>,
    pub(super) entry: String,
    pub(super) exits: HashSet<String>,
    pub(super) hooks: Vec<GraphHook>,
    pub(super) cycle_policy: CyclePolicy,
    pub(super) max_visits: u32,
}

impl Graph {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn entry_point(&self) -> &str {
        &self.entry
    }

    pub fn is_exit(&self, node: &str) -> bool {
        self.exits.contains(node)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges_from(&self, id: &str) -> &[Edge] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn max_visits(&self) -> u32 {
        self.max_visits
    }

    /// Walk the graph from the entry point until an exit node completes.
    ///
    /// Nodes run strictly one after another, each on a clone of the current
    /// state. Cancellation is checked before every node and raced against
    /// the running node.
    pub async fn execute(
        &self,
        initial: GraphState,
        cancel: &CancellationToken,
    ) -> std::result::Result<GraphState, GraphFailure> {
        let mut state = initial;
        let mut current = self.entry.clone();
        let mut previous: Option<String> = None;
        let mut steps = 0usize;

        info!(graph = %self.name, graph_id = %self.id, entry = %current, "Graph run started");
        self.fire(
            &GraphEvent::GraphStart {
                graph: self.name.clone(),
            },
            &state,
        );

        loop {
            if cancel.is_cancelled() {
                return Err(GraphFailure::new(HiveError::Cancelled, state));
            }

            let visits = state.record_visit(&current);
            if visits > self.max_visits {
                let from = previous.clone().unwrap_or_else(|| current.clone());
                warn!(from = %from, to = %current, visits, "Cycle detected");
                self.fire(
                    &GraphEvent::CycleDetected {
                        from: from.clone(),
                        to: current.clone(),
                        visits,
                    },
                    &state,
                );
                match &self.cycle_policy {
                    CyclePolicy::Fail => {
                        let error = HiveError::InfiniteLoop {
                            node: current,
                            visits,
                        };
                        return Err(GraphFailure::new(error, state));
                    }
                    CyclePolicy::Stop => {
                        info!(node = %current, "Stopping run on cycle");
                        return Ok(state);
                    }
                    CyclePolicy::Ask(callback) => match callback(&from, &current) {
                        Ok(true) => debug!(node = %current, "Cycle callback allowed another visit"),
                        Ok(false) => {
                            info!(node = %current, "Cycle callback stopped the run");
                            return Ok(state);
                        }
                        Err(e) => {
                            let error = HiveError::CycleRejected {
                                from,
                                to: current,
                                reason: e.to_string(),
                            };
                            return Err(GraphFailure::new(error, state));
                        }
                    },
                }
            }

            let Some(node) = self.nodes.get(&current) else {
                return Err(GraphFailure::new(HiveError::UnknownNode(current), state));
            };

            debug!(node = %current, visits, "Entering node");
            self.fire(
                &GraphEvent::NodeEnter {
                    node: current.clone(),
                    visits,
                },
                &state,
            );

            let ledger = state.visit_ledger();
            let ctx = NodeContext {
                node_id: current.clone(),
                cancel: cancel.clone(),
            };
            let started = Instant::now();
            let outcome = tokio::select! {
                result = node.process(ctx, state.clone()) => result,
                _ = cancel.cancelled() => Err(HiveError::Cancelled),
            };

            match outcome {
                Ok(mut next) => {
                    next.set_ledger(&ledger);
                    state = next;
                }
                Err(HiveError::Cancelled) => {
                    return Err(GraphFailure::new(HiveError::Cancelled, state));
                }
                Err(e) => {
                    error!(node = %current, error = %e, "Graph node failed");
                    self.fire(
                        &GraphEvent::NodeError {
                            node: current.clone(),
                            error: e.to_string(),
                        },
                        &state,
                    );
                    let error = HiveError::NodeFailed {
                        node: current,
                        source: Box::new(e),
                    };
                    return Err(GraphFailure::new(error, state));
                }
            }

            steps += 1;
            self.fire(
                &GraphEvent::NodeExit {
                    node: current.clone(),
                    elapsed: started.elapsed(),
                },
                &state,
            );

            if self.exits.contains(&current) {
                info!(graph = %self.name, steps, "Graph run complete");
                self.fire(
                    &GraphEvent::GraphComplete {
                        graph: self.name.clone(),
                        steps,
                    },
                    &state,
                );
                return Ok(state);
            }

            let next = match self.next_node(&current, &state) {
                Ok(next) => next,
                Err(e) => return Err(GraphFailure::new(e, state)),
            };
            debug!(from = %current, to = %next, "Transition");
            previous = Some(std::mem::replace(&mut current, next));
        }
    }

    /// Resolve the transition out of `from`.
    ///
    /// Edges are tried in declaration order. A router error counts as "no
    /// match". The first fallback edge is taken only when nothing else
    /// matched.
    pub fn next_node(&self, from: &str, state: &GraphState) -> Result<String> {
        let edges = self.edges_from(from);
        if edges.is_empty() {
            return Err(HiveError::NoOutgoingEdges(from.to_string()));
        }

        let mut fallback: Option<&str> = None;
        for edge in edges {
            match &edge.kind {
                EdgeKind::Standard => return Ok(edge.to.clone()),
                EdgeKind::Conditional(router) => match router(state) {
                    Ok(dest) if !dest.is_empty() => return Ok(dest),
                    Ok(_) => {}
                    Err(e) => debug!(from, to = %edge.to, error = %e, "Router did not match"),
                },
                EdgeKind::Fallback => {
                    fallback.get_or_insert(edge.to.as_str());
                }
            }
        }

        fallback
            .map(str::to_string)
            .ok_or_else(|| HiveError::NoValidTransition(from.to_string()))
    }

    fn fire(&self, event: &GraphEvent, state: &GraphState) {
        for hook in &self.hooks {
            hook(event, state);
        }
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("nodes", &self.nodes.len())
            .field("cycle_policy", &self.cycle_policy)
            .field("max_visits", &self.max_visits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn counting_node(id: &str, counter: Arc<AtomicUsize>) -> Node {
        Node::sync(id, id, move |state| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(state)
        })
    }

    fn passthrough(id: &str) -> Node {
        Node::sync(id, id, Ok)
    }

    fn ping_pong(max_visits: u32, policy: CyclePolicy) -> (Graph, Arc<AtomicUsize>) {
        let a_runs = Arc::new(AtomicUsize::new(0));
        let graph = GraphBuilder::new("ping-pong", "A and B forever")
            .node(counting_node("a", a_runs.clone()))
            .node(passthrough("b"))
            .edge("a", "b")
            .edge("b", "a")
            .entry_point("a")
            .max_visits(max_visits)
            .cycle_policy(policy)
            .build()
            .unwrap();
        (graph, a_runs)
    }

    #[tokio::test]
    async fn test_cycle_fails_after_threshold_not_before() {
        let (graph, a_runs) = ping_pong(10, CyclePolicy::Fail);
        let failure = graph
            .execute(GraphState::new(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            failure.error,
            HiveError::InfiniteLoop { ref node, visits: 11 } if node == "a"
        ));
        assert_eq!(a_runs.load(Ordering::SeqCst), 10);
        assert_eq!(failure.state.visits("b"), 10);
        assert_eq!(failure.error.to_string(), "potential infinite loop detected at node a");
    }

    #[tokio::test]
    async fn test_stop_policy_returns_state() {
        let (graph, a_runs) = ping_pong(2, CyclePolicy::Stop);
        let state = graph
            .execute(GraphState::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(a_runs.load(Ordering::SeqCst), 2);
        assert_eq!(state.visits("a"), 3);
    }

    #[tokio::test]
    async fn test_cycle_callback_decides() {
        let asked = Arc::new(Mutex::new(Vec::new()));
        let seen = asked.clone();
        let callback: CycleCallback = Arc::new(move |from, to| {
            let mut seen = seen.lock().unwrap();
            seen.push(format!("{from}->{to}"));
            Ok(seen.len() == 1)
        });
        let (graph, a_runs) = ping_pong(1, CyclePolicy::Ask(callback));
        graph
            .execute(GraphState::new(), &CancellationToken::new())
            .await
            .unwrap();
        // a is allowed a second visit, then the re-entry into b is refused.
        assert_eq!(*asked.lock().unwrap(), vec!["b->a", "a->b"]);
        assert_eq!(a_runs.load(Ordering::SeqCst), 2);

        let rejecting: CycleCallback =
            Arc::new(|_, _| Err(HiveError::Config("operator said no".into())));
        let (graph, _) = ping_pong(1, CyclePolicy::Ask(rejecting));
        let failure = graph
            .execute(GraphState::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(failure.error.to_string().contains("operator said no"));
    }

    #[tokio::test]
    async fn test_router_error_falls_through_to_fallback() {
        let graph = GraphBuilder::new("fallback", "")
            .node(passthrough("start"))
            .node(Node::sync("picked", "picked", |state| Ok(state.with("via", "picked".into()))))
            .node(Node::sync("rescue", "rescue", |state| Ok(state.with("via", "rescue".into()))))
            .fallback_edge("start", "rescue")
            .conditional_edge("start", "picked", |state| match state.get_str("route") {
                Some(route) => Ok(route.to_string()),
                None => Err(HiveError::NoValidTransition("start".into())),
            })
            .entry_point("start")
            .exit_point("picked")
            .exit_point("rescue")
            .build()
            .unwrap();
        let cancel = CancellationToken::new();

        let out = graph.execute(GraphState::new(), &cancel).await.unwrap();
        assert_eq!(out.get_str("via"), Some("rescue"));

        let routed = GraphState::new().with("route", "picked".into());
        let out = graph.execute(routed, &cancel).await.unwrap();
        assert_eq!(out.get_str("via"), Some("picked"));
    }

    #[tokio::test]
    async fn test_structural_errors() {
        let cancel = CancellationToken::new();

        let dead_end = GraphBuilder::new("dead-end", "")
            .node(passthrough("a"))
            .entry_point("a")
            .build()
            .unwrap();
        let failure = dead_end.execute(GraphState::new(), &cancel).await.unwrap_err();
        assert_eq!(failure.error.to_string(), "node a has no outgoing edges");

        let unmatched = GraphBuilder::new("unmatched", "")
            .node(passthrough("a"))
            .node(passthrough("b"))
            .conditional_edge("a", "b", |_| Err(HiveError::NoValidTransition("a".into())))
            .entry_point("a")
            .build()
            .unwrap();
        let failure = unmatched.execute(GraphState::new(), &cancel).await.unwrap_err();
        assert_eq!(failure.error.to_string(), "no valid transition from node a");

        let stray = GraphBuilder::new("stray", "")
            .node(passthrough("a"))
            .conditional_edge("a", "a", |_| Ok("nowhere".to_string()))
            .entry_point("a")
            .build()
            .unwrap();
        let failure = stray.execute(GraphState::new(), &cancel).await.unwrap_err();
        assert!(matches!(failure.error, HiveError::UnknownNode(ref id) if id == "nowhere"));
    }

    #[tokio::test]
    async fn test_node_failure_keeps_prior_state() {
        let graph = GraphBuilder::new("failing", "")
            .node(Node::sync("seed", "seed", |state| Ok(state.with("seeded", true.into()))))
            .node(Node::sync("boom", "boom", |_| Err(HiveError::Config("bad input".into()))))
            .edge("seed", "boom")
            .entry_point("seed")
            .exit_point("boom")
            .build()
            .unwrap();

        let failure = graph
            .execute(GraphState::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.error.to_string(), "error processing node boom: Config error: bad input");
        assert_eq!(failure.state.get_bool("seeded"), Some(true));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_node() {
        let runs = Arc::new(AtomicUsize::new(0));
        let graph = GraphBuilder::new("cancelled", "")
            .node(counting_node("a", runs.clone()))
            .entry_point("a")
            .exit_point("a")
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let failure = graph.execute(GraphState::new(), &cancel).await.unwrap_err();
        assert!(failure.error.is_cancelled());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hooks_observe_lifecycle_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let graph = GraphBuilder::new("observed", "")
            .node(passthrough("a"))
            .node(passthrough("b"))
            .edge("a", "b")
            .entry_point("a")
            .exit_point("b")
            .on(move |event, _state| {
                let label = match event {
                    GraphEvent::GraphStart { .. } => "start".to_string(),
                    GraphEvent::NodeEnter { node, .. } => format!("enter:{node}"),
                    GraphEvent::NodeExit { node, .. } => format!("exit:{node}"),
                    GraphEvent::GraphComplete { steps, .. } => format!("complete:{steps}"),
                    other => format!("{other:?}"),
                };
                sink.lock().unwrap().push(label);
            })
            .build()
            .unwrap();

        graph
            .execute(GraphState::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start", "enter:a", "exit:a", "enter:b", "exit:b", "complete:2"]
        );
    }

    #[tokio::test]
    async fn test_node_cannot_reset_visit_ledger() {
        let graph = GraphBuilder::new("ledger", "")
            .node(Node::sync("a", "a", |mut state| {
                state.remove(crate::graph::VISITS_KEY);
                Ok(state)
            }))
            .node(passthrough("b"))
            .edge("a", "b")
            .entry_point("a")
            .exit_point("b")
            .build()
            .unwrap();
        let out = graph
            .execute(GraphState::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.visits("a"), 1);
        assert_eq!(out.visits("b"), 1);
    }
}
