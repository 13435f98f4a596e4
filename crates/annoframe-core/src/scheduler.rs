//! Running a [`FrozenGraph`].
//!
//! The [`Scheduler`] trait is the seam for execution engines. The core ships
//! [`LocalScheduler`], which runs nodes on tokio's blocking thread pool with a
//! bounded number of worker slots.
//!
//! Failure isolation: when a node fails, every node that transitively depends
//! on it is reported as skipped and never runs. Nodes on unrelated branches
//! keep running.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use log::{debug, info};
use snafu::prelude::*;
use tokio::task::JoinSet;

use crate::{
    config::SessionConfig,
    error::{EngineError, EngineResult, UnknownReferenceSnafu, WorkerSnafu},
    graph::{FrozenGraph, NodeId, NodeRun},
    handle::Handle,
};

/// Outcome of one node in a run.
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    /// The node executed successfully.
    Succeeded {
        /// The result was read from the cache instead of computed.
        from_cache: bool,
    },
    /// The node had already succeeded in an earlier run.
    AlreadyDone,
    /// The node failed.
    Failed(Arc<EngineError>),
    /// The node did not run because an upstream node failed.
    Skipped {
        /// The failed node.
        upstream: NodeId,
    },
}

impl NodeOutcome {
    /// Returns true for succeeded and already-done nodes.
    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Succeeded { .. } | NodeOutcome::AlreadyDone)
    }
}

/// Per-node outcomes of a scheduler run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    outcomes: BTreeMap<NodeId, NodeOutcome>,
    order: Vec<NodeId>,
}

impl RunReport {
    fn record(&mut self, id: NodeId, outcome: NodeOutcome) {
        if !matches!(outcome, NodeOutcome::Skipped { .. }) {
            self.order.push(id);
        }
        self.outcomes.insert(id, outcome);
    }

    /// Outcome of a node, if it was part of the run.
    pub fn outcome(&self, id: NodeId) -> Option<&NodeOutcome> {
        self.outcomes.get(&id)
    }

    /// All outcomes by node id.
    pub fn outcomes(&self) -> impl Iterator<Item = (NodeId, &NodeOutcome)> {
        self.outcomes.iter().map(|(id, outcome)| (*id, outcome))
    }

    /// Nodes in the order they finished executing (skipped nodes excluded).
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Returns true if every node of the run succeeded.
    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(NodeOutcome::is_success)
    }

    /// Failed nodes and their errors.
    pub fn failures(&self) -> impl Iterator<Item = (NodeId, &Arc<EngineError>)> {
        self.outcomes.iter().filter_map(|(id, outcome)| match outcome {
            NodeOutcome::Failed(err) => Some((*id, err)),
            _ => None,
        })
    }

    /// Nodes skipped because of an upstream failure.
    pub fn skipped(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.outcomes.iter().filter_map(|(id, outcome)| {
            matches!(outcome, NodeOutcome::Skipped { .. }).then_some(*id)
        })
    }

    /// Number of nodes computed in this run (not from the cache).
    pub fn computed(&self) -> usize {
        self.count(|o| matches!(o, NodeOutcome::Succeeded { from_cache: false }))
    }

    /// Number of nodes satisfied from the cache.
    pub fn from_cache(&self) -> usize {
        self.count(|o| matches!(o, NodeOutcome::Succeeded { from_cache: true }))
    }

    fn count(&self, pred: impl Fn(&NodeOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| pred(o)).count()
    }
}

/// An execution engine for frozen graphs.
#[async_trait::async_trait]
pub trait Scheduler: Send + Sync {
    /// Run `targets` and all of their ancestors, dependencies first.
    async fn run_nodes(&self, graph: &FrozenGraph, targets: &[NodeId]) -> EngineResult<RunReport>;

    /// Run what the handles need. [`Handle::Done`] needs nothing.
    async fn run_targets(
        &self,
        graph: &FrozenGraph,
        targets: &[Handle],
    ) -> EngineResult<RunReport> {
        let mut nodes = Vec::with_capacity(targets.len());
        for handle in targets.iter().filter(|h| !h.is_done()) {
            let node = graph.resolve(handle).with_context(|| UnknownReferenceSnafu {
                table: "<graph>",
                detail: format!("{handle} is not a node of this graph"),
            })?;
            nodes.push(node);
        }
        self.run_nodes(graph, &nodes).await
    }

    /// Run the whole graph.
    async fn run(&self, graph: &FrozenGraph) -> EngineResult<RunReport> {
        let all = graph.topological_order().to_vec();
        self.run_nodes(graph, &all).await
    }
}

/// Runs nodes on the local blocking thread pool.
///
/// At most `max_workers` slots are in use at once; a node occupies as many
/// slots as its annotator's `cores_needed` (capped at `max_workers`).
#[derive(Debug, Clone)]
pub struct LocalScheduler {
    max_workers: usize,
}

impl LocalScheduler {
    /// Scheduler with `max_workers` slots (at least one).
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    /// Scheduler sized from the session configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.max_workers)
    }

    /// Number of worker slots.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

#[async_trait::async_trait]
impl Scheduler for LocalScheduler {
    async fn run_nodes(&self, graph: &FrozenGraph, targets: &[NodeId]) -> EngineResult<RunReport> {
        let wanted = graph.ancestors(targets);
        let slot_of: HashMap<NodeId, usize> =
            wanted.iter().enumerate().map(|(slot, id)| (*id, slot)).collect();
        let mut waiting = vec![0usize; wanted.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); wanted.len()];
        for (slot, id) in wanted.iter().enumerate() {
            if let Some(node) = graph.node(*id) {
                for dep in &node.dependencies {
                    if let Some(&dep_slot) = slot_of.get(dep) {
                        waiting[slot] += 1;
                        dependents[dep_slot].push(slot);
                    }
                }
            }
        }
        info!(
            "running {} nodes with {} workers",
            wanted.len(),
            self.max_workers
        );

        let mut ready: BTreeSet<usize> = (0..wanted.len()).filter(|&s| waiting[s] == 0).collect();
        let mut skipped = vec![false; wanted.len()];
        let mut report = RunReport::default();
        let mut running = JoinSet::new();
        let mut free = self.max_workers;

        loop {
            while let Some(&slot) = ready.first() {
                let id = wanted[slot];
                let cores = graph
                    .node(id)
                    .map_or(1, |n| n.cores)
                    .clamp(1, self.max_workers);
                if cores > free {
                    break;
                }
                ready.pop_first();
                free -= cores;
                let graph = graph.clone();
                running.spawn_blocking(move || (slot, cores, graph.execute(id)));
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (slot, cores, result) = joined.context(WorkerSnafu)?;
            free += cores;
            let id = wanted[slot];
            match result {
                Ok(run) => {
                    let outcome = match run {
                        NodeRun::Computed => NodeOutcome::Succeeded { from_cache: false },
                        NodeRun::FromCache => NodeOutcome::Succeeded { from_cache: true },
                        NodeRun::AlreadyDone => NodeOutcome::AlreadyDone,
                    };
                    report.record(id, outcome);
                    for &dependent in &dependents[slot] {
                        waiting[dependent] -= 1;
                        if waiting[dependent] == 0 && !skipped[dependent] {
                            ready.insert(dependent);
                        }
                    }
                }
                Err(err) => {
                    report.record(id, NodeOutcome::Failed(err));
                    let mut stack = dependents[slot].clone();
                    while let Some(dependent) = stack.pop() {
                        if skipped[dependent] {
                            continue;
                        }
                        skipped[dependent] = true;
                        debug!("skipping {} after failure of {id}", wanted[dependent]);
                        report.record(wanted[dependent], NodeOutcome::Skipped { upstream: id });
                        stack.extend(dependents[dependent].iter().copied());
                    }
                }
            }
        }

        info!(
            "run finished: {} computed, {} from cache, {} failed, {} skipped",
            report.computed(),
            report.from_cache(),
            report.failures().count(),
            report.skipped().count()
        );
        Ok(report)
    }
}
