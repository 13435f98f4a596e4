//! The frozen computation graph of a deferred session.
//!
//! [`crate::Session::build_graph`] consumes the session, runs tree-fix
//! (annotator propagation across the table tree) and produces a
//! [`FrozenGraph`]: an immutable set of nodes with dependency edges, cache
//! keys and a topological order. The graph exposes no way to change its
//! topology; the only state that changes is per-node execution state and the
//! tables' column stores, both behind locks so a scheduler can run
//! independent nodes concurrently.
//!
//! Node kinds:
//!
//! - **Load**: materialize a table's load-time columns (cached under `__load`).
//! - **Compute**: run one annotator on one table (cached under its cache name).
//! - **Forward**: copy an annotator's columns from the parent table onto a
//!   child's rows instead of recomputing them.
//! - **Annotate**: barrier over every annotator of a table.
//! - **File**: write a table, a plot or a custom file. Always re-executed.
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock, PoisonError, RwLock},
};

use crate::{
    annotator::{AnnotatorRef, QcEntry},
    cache::{CacheKey, CacheStore},
    config::SessionConfig,
    error::{EngineError, EngineResult},
    frame::Frame,
    handle::Handle,
    output::FileAction,
    session::Session,
    table::{LoadSource, TableId},
};

mod node;
mod tree_fix;

/// Index of a node in a [`FrozenGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Position in the graph's node list.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// What a node does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Load a table.
    Load,
    /// Compute an annotator on a table.
    Compute,
    /// Copy an annotator's columns from the parent table.
    Forward {
        /// Table the columns come from.
        from: TableId,
    },
    /// Wait for every annotator of a table.
    Annotate,
    /// Produce a file.
    File {
        /// Output path.
        path: PathBuf,
    },
}

/// Static description of a node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Node id.
    pub id: NodeId,
    /// Node kind.
    pub kind: NodeKind,
    /// Table the node works on.
    pub table: TableId,
    /// Annotator cache name, for compute and forward nodes.
    pub annotator: Option<String>,
    /// Human-readable label, e.g. `compute:genes/double`.
    pub label: String,
    /// Nodes that must succeed first.
    pub dependencies: Vec<NodeId>,
    /// Content key, chained through the keys of the dependencies.
    pub key: CacheKey,
    /// Scheduler slot weight.
    pub cores: usize,
}

/// Execution state of a node.
#[derive(Debug, Clone)]
pub enum NodeState {
    /// Not executed yet.
    Pending,
    /// Executed successfully.
    Succeeded {
        /// The result came from the cache.
        from_cache: bool,
    },
    /// Executed and failed. Terminal.
    Failed(Arc<EngineError>),
}

/// Result of executing one node with [`FrozenGraph::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRun {
    /// The node ran its action.
    Computed,
    /// The node's result was read from the cache.
    FromCache,
    /// The node had already succeeded; nothing ran.
    AlreadyDone,
}

#[derive(Debug)]
pub(crate) enum NodeAction {
    Load,
    Compute(AnnotatorRef),
    Forward { from: TableId, annotator: AnnotatorRef },
    Annotate,
    File { path: PathBuf, action: FileAction },
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) info: NodeInfo,
    pub(crate) action: NodeAction,
    pub(crate) state: Mutex<NodeState>,
}

/// A table as seen by graph execution.
#[derive(Debug)]
pub(crate) struct GraphTable {
    pub(crate) name: String,
    pub(crate) source: LoadSource,
    pub(crate) store: RwLock<Option<Frame>>,
    pub(crate) non_annotator: OnceLock<Vec<String>>,
}

#[derive(Debug)]
pub(crate) struct GraphInner {
    pub(crate) config: SessionConfig,
    pub(crate) cache: Option<CacheStore>,
    pub(crate) tables: Vec<GraphTable>,
    pub(crate) names: HashMap<String, TableId>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) handles: HashMap<Handle, NodeId>,
    pub(crate) order: Vec<NodeId>,
    pub(crate) qc: Vec<QcEntry>,
}

/// Immutable computation graph, ready for a scheduler.
///
/// Cloning is cheap and shares execution state.
#[derive(Debug, Clone)]
pub struct FrozenGraph {
    pub(crate) inner: Arc<GraphInner>,
}

pub(crate) fn build(session: Session) -> EngineResult<FrozenGraph> {
    tree_fix::build(session)
}

impl FrozenGraph {
    /// Session settings the graph was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.inner.nodes.is_empty()
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.inner.nodes.iter().map(|n| &n.info)
    }

    /// A node by id.
    pub fn node(&self, id: NodeId) -> Option<&NodeInfo> {
        self.inner.nodes.get(id.0).map(|n| &n.info)
    }

    /// Node a handle refers to. [`Handle::Done`] resolves to nothing.
    pub fn resolve(&self, handle: &Handle) -> Option<NodeId> {
        self.inner.handles.get(handle).copied()
    }

    /// Every node, dependencies before dependents.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.inner.order
    }

    /// `targets` and everything they transitively depend on, in topological
    /// order.
    pub fn ancestors(&self, targets: &[NodeId]) -> Vec<NodeId> {
        let mut needed = BTreeSet::new();
        let mut stack: Vec<NodeId> = targets.to_vec();
        while let Some(id) = stack.pop() {
            if let Some(node) = self.inner.nodes.get(id.0) {
                if needed.insert(id) {
                    stack.extend(node.info.dependencies.iter().copied());
                }
            }
        }
        self.inner
            .order
            .iter()
            .copied()
            .filter(|id| needed.contains(id))
            .collect()
    }

    /// Current execution state of a node.
    pub fn state(&self, id: NodeId) -> Option<NodeState> {
        let node = self.inner.nodes.get(id.0)?;
        let state = node.state.lock().unwrap_or_else(PoisonError::into_inner);
        Some(state.clone())
    }

    /// Id of the table called `name`.
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.inner.names.get(name).copied()
    }

    /// Name of a table.
    pub fn table_name(&self, id: TableId) -> Option<&str> {
        self.inner.tables.get(id.0).map(|t| t.name.as_str())
    }

    /// Snapshot of a table's columns, once its load node has run.
    pub fn frame(&self, id: TableId) -> Option<Frame> {
        let table = self.inner.tables.get(id.0)?;
        let store = table.store.read().unwrap_or_else(PoisonError::into_inner);
        store.clone()
    }

    /// Quality-control artifacts registered while building the graph.
    pub fn qc_entries(&self) -> &[QcEntry] {
        &self.inner.qc
    }
}
