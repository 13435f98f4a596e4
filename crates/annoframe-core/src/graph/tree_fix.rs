//! Tree-fix and node construction.
//!
//! Runs once per session, when the graph is built:
//!
//! 1. Every table's annotator set is closed over prerequisites and pushed
//!    down to all descendants (idempotent; attach already does most of it).
//! 2. Per table: a load node; per (table, annotator): a forward node if the
//!    parent carries the same annotator, else a compute node; a barrier for
//!    `annotate()`; one node per recorded file.
//! 3. Handles are resolved into edges, the nodes are sorted topologically
//!    (rejecting cycles), and cache keys are chained along the edges.
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, OnceLock, RwLock},
};

use log::info;
use snafu::prelude::*;

use super::{
    FrozenGraph, GraphInner, GraphTable, Node, NodeAction, NodeId, NodeInfo, NodeKind, NodeState,
};
use crate::{
    annotator::{self, AnnotatorIdentity, AnnotatorRef},
    cache::{CacheKey, CacheStore, KeyBuilder},
    config::ExecutionMode,
    error::{CacheSnafu, DependencyCycleSnafu, EngineResult, UnknownReferenceSnafu},
    handle::Handle,
    session::Session,
    table::TableId,
};

/// A node before its edges are resolved.
struct Draft {
    kind: NodeKind,
    table: TableId,
    annotator: Option<String>,
    label: String,
    wants: Vec<Handle>,
    action: NodeAction,
    cores: usize,
}

pub(super) fn build(mut session: Session) -> EngineResult<FrozenGraph> {
    session.ensure_mode(ExecutionMode::Deferred, "build_graph")?;
    fix_tree(&mut session)?;

    let mut drafts: Vec<Draft> = Vec::new();
    let mut handles: HashMap<Handle, NodeId> = HashMap::new();

    for table in &session.tables {
        let mut wants: Vec<Handle> = Vec::new();
        if let Some(up) = table.source.upstream_table() {
            wants.push(Handle::Load(up));
        }
        wants.extend(table.dependencies.iter().cloned());
        handles.insert(Handle::Load(table.id), NodeId(drafts.len()));
        drafts.push(Draft {
            kind: NodeKind::Load,
            table: table.id,
            annotator: None,
            label: format!("load:{}", table.name),
            wants,
            action: NodeAction::Load,
            cores: 1,
        });
    }

    for table in &session.tables {
        let mut barrier = vec![Handle::Load(table.id)];
        for annotator in &table.annotators {
            let cache_name = annotator.cache_name().to_string();
            let handle = Handle::Annotator {
                table: table.id,
                cache_name: cache_name.clone(),
            };
            let forward_from = table
                .parent
                .filter(|p| session.tables[p.0].has_annotator(&cache_name));
            let draft = match forward_from {
                Some(parent) => Draft {
                    kind: NodeKind::Forward { from: parent },
                    table: table.id,
                    annotator: Some(cache_name.clone()),
                    label: format!(
                        "forward:{}/{cache_name}<-{}",
                        table.name, session.tables[parent.0].name
                    ),
                    wants: vec![
                        Handle::Load(table.id),
                        Handle::Annotator {
                            table: parent,
                            cache_name: cache_name.clone(),
                        },
                    ],
                    action: NodeAction::Forward {
                        from: parent,
                        annotator: Arc::clone(annotator),
                    },
                    cores: 1,
                },
                None => {
                    let mut wants = vec![Handle::Load(table.id)];
                    for prerequisite in annotator.dependent_annotators().into_iter().flatten() {
                        wants.push(Handle::Annotator {
                            table: table.id,
                            cache_name: prerequisite.cache_name().to_string(),
                        });
                    }
                    wants.extend(annotator.preconditions(&table.name));
                    Draft {
                        kind: NodeKind::Compute,
                        table: table.id,
                        annotator: Some(cache_name.clone()),
                        label: format!("compute:{}/{cache_name}", table.name),
                        wants,
                        action: NodeAction::Compute(Arc::clone(annotator)),
                        cores: annotator.cores_needed().max(1),
                    }
                }
            };
            handles.insert(handle.clone(), NodeId(drafts.len()));
            drafts.push(draft);
            barrier.push(handle);
        }
        handles.insert(Handle::Annotate(table.id), NodeId(drafts.len()));
        drafts.push(Draft {
            kind: NodeKind::Annotate,
            table: table.id,
            annotator: None,
            label: format!("annotate:{}", table.name),
            wants: barrier,
            action: NodeAction::Annotate,
            cores: 1,
        });
    }

    for file in &session.files {
        handles.insert(Handle::File(file.path.clone()), NodeId(drafts.len()));
        drafts.push(Draft {
            kind: NodeKind::File {
                path: file.path.clone(),
            },
            table: file.table,
            annotator: None,
            label: format!("{}:{}", file.action.kind(), file.path.display()),
            wants: file.dependencies.clone(),
            action: NodeAction::File {
                path: file.path.clone(),
                action: file.action.clone(),
            },
            cores: 1,
        });
    }

    let mut edges: Vec<Vec<NodeId>> = Vec::with_capacity(drafts.len());
    for draft in &drafts {
        let mut deps: Vec<NodeId> = Vec::new();
        for handle in draft.wants.iter().filter(|h| !h.is_done()) {
            let dep = handles.get(handle).copied().with_context(|| UnknownReferenceSnafu {
                table: session.tables[draft.table.0].name.clone(),
                detail: format!(
                    "{} depends on {handle}, which is not part of this session",
                    draft.label
                ),
            })?;
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        edges.push(deps);
    }

    let order = topological_order(&session, &drafts, &edges)?;
    let keys = chain_keys(&session, &drafts, &edges, &order)?;

    let nodes: Vec<Node> = drafts
        .into_iter()
        .zip(edges)
        .zip(keys)
        .enumerate()
        .map(|(i, ((draft, dependencies), key))| Node {
            info: NodeInfo {
                id: NodeId(i),
                kind: draft.kind,
                table: draft.table,
                annotator: draft.annotator,
                label: draft.label,
                dependencies,
                key,
                cores: draft.cores,
            },
            action: draft.action,
            state: Mutex::new(NodeState::Pending),
        })
        .collect();

    let cache = session
        .config
        .use_cache
        .then(|| CacheStore::new(session.config.cache_dir.clone()));
    let tables = session
        .tables
        .iter()
        .map(|t| GraphTable {
            name: t.name.clone(),
            source: t.source.clone(),
            store: RwLock::new(None),
            non_annotator: OnceLock::new(),
        })
        .collect();
    info!(
        "built graph with {} nodes over {} tables",
        nodes.len(),
        session.tables.len()
    );
    Ok(FrozenGraph {
        inner: Arc::new(GraphInner {
            config: session.config,
            cache,
            tables,
            names: session.names,
            nodes,
            handles,
            order,
            qc: session.qc,
        }),
    })
}

/// Close annotator sets over prerequisites and descendants, then run the
/// quality-control hooks once per (table, annotator).
fn fix_tree(session: &mut Session) -> EngineResult<()> {
    for index in 0..session.tables.len() {
        let id = session.tables[index].id;
        let attached: Vec<AnnotatorRef> = session.tables[index].annotators.clone();
        for annotator in &attached {
            for member in annotator::closure(&session.tables[index].name, annotator)? {
                session.register_deferred(id, &member)?;
            }
        }
        let parent_annotators: Vec<AnnotatorRef> = match session.tables[index].parent {
            Some(parent) => session.tables[parent.0].annotators.clone(),
            None => Vec::new(),
        };
        for annotator in &parent_annotators {
            session.register_deferred(id, annotator)?;
        }
    }
    for index in 0..session.tables.len() {
        let id = session.tables[index].id;
        let attached: Vec<AnnotatorRef> = session.tables[index].annotators.clone();
        for annotator in &attached {
            session.register_qc(id, annotator);
        }
    }
    Ok(())
}

/// Kahn's algorithm, lowest node id first among ready nodes.
fn topological_order(
    session: &Session,
    drafts: &[Draft],
    edges: &[Vec<NodeId>],
) -> EngineResult<Vec<NodeId>> {
    let mut pending: Vec<usize> = edges.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); edges.len()];
    for (node, deps) in edges.iter().enumerate() {
        for dep in deps {
            dependents[dep.0].push(node);
        }
    }
    let mut ready: BTreeSet<usize> = (0..edges.len()).filter(|&n| pending[n] == 0).collect();
    let mut order = Vec::with_capacity(edges.len());
    while let Some(next) = ready.pop_first() {
        order.push(NodeId(next));
        for &dependent in &dependents[next] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }
    if order.len() == edges.len() {
        return Ok(order);
    }

    // Every unsorted node still waits on an unsorted dependency, so walking
    // those edges must revisit a node.
    let Some(start) = (0..edges.len()).find(|&n| pending[n] > 0) else {
        return Ok(order);
    };
    let mut path: Vec<usize> = vec![start];
    let cycle_start = loop {
        let current = path[path.len() - 1];
        let Some(next) = edges[current].iter().map(|d| d.0).find(|&d| pending[d] > 0) else {
            break 0;
        };
        if let Some(pos) = path.iter().position(|&n| n == next) {
            break pos;
        }
        path.push(next);
    };
    let mut cycle: Vec<String> = path[cycle_start..]
        .iter()
        .map(|&n| drafts[n].label.clone())
        .collect();
    cycle.push(drafts[path[cycle_start]].label.clone());
    DependencyCycleSnafu {
        table: session.tables[drafts[start].table.0].name.clone(),
        cycle,
    }
    .fail()
}

/// Cache keys in topological order, each chained through its dependencies.
fn chain_keys(
    session: &Session,
    drafts: &[Draft],
    edges: &[Vec<NodeId>],
    order: &[NodeId],
) -> EngineResult<Vec<CacheKey>> {
    let mut keys: Vec<Option<CacheKey>> = vec![None; drafts.len()];
    for id in order {
        let draft = &drafts[id.0];
        let table = &session.tables[draft.table.0];
        let builder = match &draft.action {
            NodeAction::Load => {
                let fingerprint = table
                    .source
                    .fingerprint()
                    .context(CacheSnafu { table: &table.name })?;
                KeyBuilder::new("load")
                    .field(&table.name)
                    .field(fingerprint)
            }
            NodeAction::Compute(annotator) => {
                let identity = AnnotatorIdentity::of(annotator.as_ref());
                KeyBuilder::new("compute")
                    .field(&table.name)
                    .field(identity.kind)
                    .field(&identity.cache_name)
                    .field(identity.columns.join("\0"))
                    .field(&identity.fingerprint)
            }
            NodeAction::Forward { annotator, .. } => KeyBuilder::new("forward")
                .field(&table.name)
                .field(annotator.cache_name()),
            NodeAction::Annotate => KeyBuilder::new("annotate").field(&table.name),
            NodeAction::File { path, action } => KeyBuilder::new("file")
                .field(action.kind())
                .field(path.to_string_lossy().as_bytes()),
        };
        let mut builder = builder;
        for dep in &edges[id.0] {
            if let Some(key) = &keys[dep.0] {
                builder = builder.upstream(key);
            }
        }
        keys[id.0] = Some(builder.finish());
    }
    Ok(keys.into_iter().flatten().collect())
}
