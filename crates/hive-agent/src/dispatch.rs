use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_core::error::{HiveError, Result};

use crate::swarm::{Response, RunRequest, Swarm};

/// Outcome of one named unit of a concurrent dispatch.
#[derive(Debug)]
pub struct DispatchResult {
    pub name: String,
    pub response: Option<Response>,
    pub error: Option<HiveError>,
    pub elapsed: Duration,
}

impl DispatchResult {
    fn new(name: String, outcome: Result<Response>, elapsed: Duration) -> Self {
        let (response, error) = match outcome {
            Ok(response) => (Some(response), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            name,
            response,
            error,
            elapsed,
        }
    }

    fn cancelled(name: String) -> Self {
        Self::new(name, Err(HiveError::Cancelled), Duration::ZERO)
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn last_content(&self) -> Option<&str> {
        self.response.as_ref().and_then(Response::last_content)
    }
}

/// Runs independent agent invocations side by side on one swarm.
///
/// Every unit is its own tokio task with a child of the caller's
/// cancellation token. A failing unit never affects its siblings.
#[derive(Clone)]
pub struct Dispatcher {
    swarm: Arc<Swarm>,
    max_concurrency: Option<usize>,
}

impl Dispatcher {
    pub fn new(swarm: Arc<Swarm>) -> Self {
        let max_concurrency = swarm.config().dispatch.max_concurrency;
        Self {
            swarm,
            max_concurrency,
        }
    }

    /// Cap on units running at once. Zero is treated as one.
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    /// Run every request and return results in completion order.
    ///
    /// If `cancel` fires first, the outstanding units are aborted and only
    /// the results gathered so far are returned.
    pub async fn run_concurrent(
        &self,
        requests: HashMap<String, RunRequest>,
        cancel: &CancellationToken,
    ) -> Vec<DispatchResult> {
        self.dispatch(requests.into_iter().collect(), cancel)
            .await
            .into_iter()
            .map(|(_, result)| result)
            .collect()
    }

    /// Like [`Dispatcher::run_concurrent`], but results come back in input
    /// order. Units that never finished are reported as cancelled.
    pub async fn run_concurrent_ordered(
        &self,
        requests: Vec<(String, RunRequest)>,
        cancel: &CancellationToken,
    ) -> Vec<DispatchResult> {
        let names: Vec<String> = requests.iter().map(|(name, _)| name.clone()).collect();
        let mut slots: Vec<Option<DispatchResult>> = names.iter().map(|_| None).collect();
        for (index, result) in self.dispatch(requests, cancel).await {
            slots[index] = Some(result);
        }
        slots
            .into_iter()
            .zip(names)
            .map(|(slot, name)| slot.unwrap_or_else(|| DispatchResult::cancelled(name)))
            .collect()
    }

    async fn dispatch(
        &self,
        requests: Vec<(String, RunRequest)>,
        cancel: &CancellationToken,
    ) -> Vec<(usize, DispatchResult)> {
        let total = requests.len();
        let limit = self.max_concurrency.unwrap_or(total).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        info!(units = total, limit, "Dispatching concurrent runs");

        let mut units = JoinSet::new();
        for (index, (name, request)) in requests.into_iter().enumerate() {
            let swarm = Arc::clone(&self.swarm);
            let semaphore = Arc::clone(&semaphore);
            let token = cancel.child_token();
            units.spawn(async move {
                let started = Instant::now();
                let run = async {
                    tokio::select! {
                        permit = semaphore.acquire_owned() => match permit {
                            Ok(_permit) => swarm.run(request, &token).await,
                            Err(_) => Err(HiveError::Cancelled),
                        },
                        _ = token.cancelled() => Err(HiveError::Cancelled),
                    }
                };
                let outcome = match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(HiveError::UnitPanicked(name.clone())),
                };
                (index, DispatchResult::new(name, outcome, started.elapsed()))
            });
        }

        let mut results = Vec::with_capacity(total);
        loop {
            tokio::select! {
                joined = units.join_next() => match joined {
                    Some(joined) => collect(joined, &mut results),
                    None => break,
                },
                _ = cancel.cancelled() => {
                    drain_finished(&mut units, &mut results);
                    units.abort_all();
                    warn!(completed = results.len(), total, "Dispatch cancelled, returning partial results");
                    break;
                }
            }
        }
        results
    }
}

type UnitOutput = (usize, DispatchResult);

fn collect(joined: std::result::Result<UnitOutput, JoinError>, results: &mut Vec<UnitOutput>) {
    match joined {
        Ok((index, result)) => {
            match &result.error {
                Some(e) => warn!(unit = %result.name, error = %e, "Dispatch unit failed"),
                None => debug!(unit = %result.name, elapsed_ms = result.elapsed.as_millis() as u64, "Dispatch unit finished"),
            }
            results.push((index, result));
        }
        Err(e) => warn!(error = %e, "Dispatch unit aborted"),
    }
}

/// Keep units that finished but were not yet joined when the run was cancelled.
fn drain_finished(units: &mut JoinSet<UnitOutput>, results: &mut Vec<UnitOutput>) {
    while let Some(joined) = units.try_join_next() {
        collect(joined, results);
    }
}
