//! Executing a single node.
//!
//! A node runs at most once. Its state mutex is held for the whole run, so a
//! second caller blocks until the first finishes and then observes the
//! terminal state. Panics in user callbacks are caught and recorded as
//! computation failures of the node.
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, PoisonError},
};

use log::{debug, info, warn};
use snafu::prelude::*;

use super::{FrozenGraph, GraphInner, GraphTable, Node, NodeAction, NodeId, NodeRun, NodeState};
use crate::{
    annotator::{self, AnnotatorRef, TableView},
    cache::{CacheKey, LOAD_ENTRY},
    combine,
    error::{
        CacheSnafu, ComputationSnafu, EngineError, EngineResult, NotLoadedSnafu, OutputSnafu,
        UnknownReferenceSnafu,
    },
    frame::Frame,
    table::Upstream,
};

impl FrozenGraph {
    /// Run node `id` on the calling thread.
    ///
    /// Its dependencies must have succeeded already. A node that succeeded
    /// before is not run again; a node that failed returns the same error.
    pub fn execute(&self, id: NodeId) -> Result<NodeRun, Arc<EngineError>> {
        let inner = &self.inner;
        let node = inner.nodes.get(id.0).ok_or_else(|| {
            Arc::new(
                UnknownReferenceSnafu {
                    table: "<graph>",
                    detail: format!("no node {id}"),
                }
                .build(),
            )
        })?;
        let mut state = node.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            NodeState::Succeeded { .. } => return Ok(NodeRun::AlreadyDone),
            NodeState::Failed(err) => return Err(Arc::clone(err)),
            NodeState::Pending => {}
        }
        for dep in &node.info.dependencies {
            if !matches!(self.state(*dep), Some(NodeState::Succeeded { .. })) {
                return Err(Arc::new(
                    UnknownReferenceSnafu {
                        table: inner.table(node).name.clone(),
                        detail: format!("{} ran before its dependency {dep}", node.info.label),
                    }
                    .build(),
                ));
            }
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| inner.run(node)))
            .unwrap_or_else(|payload| Err(inner.panicked(node, payload)));
        match result {
            Ok(run) => {
                debug!("{} succeeded ({run:?})", node.info.label);
                *state = NodeState::Succeeded {
                    from_cache: run == NodeRun::FromCache,
                };
                Ok(run)
            }
            Err(err) => {
                warn!("{} failed: {err}", node.info.label);
                let err = Arc::new(err);
                *state = NodeState::Failed(Arc::clone(&err));
                Err(err)
            }
        }
    }
}

impl GraphInner {
    fn table(&self, node: &Node) -> &GraphTable {
        &self.tables[node.info.table.0]
    }

    fn run(&self, node: &Node) -> EngineResult<NodeRun> {
        let table = self.table(node);
        match &node.action {
            NodeAction::Load => self.run_load(node, table),
            NodeAction::Compute(annotator) => self.run_compute(node, table, annotator),
            NodeAction::Forward { from, annotator } => {
                let parent = &self.tables[from.0];
                let parent_frame = snapshot(parent)?;
                let child_frame = snapshot(table)?;
                let block = combine::forward(
                    &table.name,
                    annotator.cache_name(),
                    &parent_frame,
                    annotator.columns(),
                    child_frame.index(),
                )?;
                merge(table, annotator.cache_name(), block)?;
                Ok(NodeRun::Computed)
            }
            NodeAction::Annotate => Ok(NodeRun::Computed),
            NodeAction::File { path, action } => {
                let frame = snapshot(table)?;
                action
                    .run(&frame, path)
                    .context(OutputSnafu { table: &table.name })?;
                info!("{} {} -> {}", action.kind(), table.name, path.display());
                Ok(NodeRun::Computed)
            }
        }
    }

    fn run_load(&self, node: &Node, table: &GraphTable) -> EngineResult<NodeRun> {
        let key = &node.info.key;
        if let Some(frame) = self.cached(table, LOAD_ENTRY, key) {
            install(table, frame);
            return Ok(NodeRun::FromCache);
        }
        let frame = match table.source.upstream_table() {
            Some(up) => {
                let up = &self.tables[up.0];
                let up_frame = snapshot(up)?;
                let non_annotator = up
                    .non_annotator
                    .get()
                    .context(NotLoadedSnafu { table: &up.name })?;
                table.source.produce(
                    &table.name,
                    Some(Upstream {
                        name: &up.name,
                        frame: &up_frame,
                        non_annotator_columns: non_annotator,
                    }),
                )?
            }
            None => table.source.produce(&table.name, None)?,
        };
        self.store(table, LOAD_ENTRY, key, &frame)?;
        info!(
            "loaded table {} ({} rows, {} columns)",
            table.name,
            frame.num_rows(),
            frame.num_columns()
        );
        install(table, frame);
        Ok(NodeRun::Computed)
    }

    fn run_compute(
        &self,
        node: &Node,
        table: &GraphTable,
        annotator: &AnnotatorRef,
    ) -> EngineResult<NodeRun> {
        let cache_name = annotator.cache_name();
        let key = &node.info.key;
        if let Some(block) = self.cached(table, cache_name, key) {
            merge(table, cache_name, block)?;
            return Ok(NodeRun::FromCache);
        }
        let current = snapshot(table)?;
        let computed = annotator
            .compute(&TableView::new(&table.name, &current))
            .context(ComputationSnafu {
                table: &table.name,
                annotator: cache_name,
            })?;
        let block = annotator::into_block(&table.name, annotator.as_ref(), computed)?;
        let block = combine::align(&table.name, cache_name, &current, block)?;
        self.store(table, cache_name, key, &block)?;
        merge(table, cache_name, block)?;
        Ok(NodeRun::Computed)
    }

    fn cached(&self, table: &GraphTable, entry: &str, key: &CacheKey) -> Option<Frame> {
        let cache = self.cache.as_ref()?;
        match cache.get(&table.name, entry, key) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("ignoring unreadable cache entry {}/{entry}: {err}", table.name);
                None
            }
        }
    }

    fn store(
        &self,
        table: &GraphTable,
        entry: &str,
        key: &CacheKey,
        frame: &Frame,
    ) -> EngineResult<()> {
        if let Some(cache) = &self.cache {
            cache
                .set(&table.name, entry, key, frame)
                .context(CacheSnafu { table: &table.name })?;
        }
        Ok(())
    }

    fn panicked(&self, node: &Node, payload: Box<dyn Any + Send>) -> EngineError {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        EngineError::Computation {
            table: self.table(node).name.clone(),
            annotator: node
                .info
                .annotator
                .clone()
                .unwrap_or_else(|| node.info.label.clone()),
            source: format!("panicked: {message}").into(),
        }
    }
}

/// Clone of the table's current store.
fn snapshot(table: &GraphTable) -> EngineResult<Frame> {
    let store = table.store.read().unwrap_or_else(PoisonError::into_inner);
    store
        .clone()
        .context(NotLoadedSnafu { table: &table.name })
}

fn install(table: &GraphTable, frame: Frame) {
    table
        .non_annotator
        .get_or_init(|| frame.column_names().map(str::to_string).collect());
    let mut store = table.store.write().unwrap_or_else(PoisonError::into_inner);
    *store = Some(frame);
}

/// Merge `block` into the table's store under the write lock.
fn merge(table: &GraphTable, annotator: &str, block: Frame) -> EngineResult<()> {
    let mut store = table.store.write().unwrap_or_else(PoisonError::into_inner);
    let current = store
        .as_ref()
        .context(NotLoadedSnafu { table: &table.name })?;
    let merged = combine::combine(&table.name, annotator, current, block)?;
    *store = Some(merged);
    Ok(())
}
