//! The session: every table of one run, and the execution mode they share.
//!
//! A [`Session`] owns the table arena. Its operations behave according to
//! the configured [`ExecutionMode`]:
//!
//! - **Immediate**: tables load when created, annotators compute as soon as
//!   they are attached, files are written on the calling thread. Every
//!   operation returns [`Handle::Done`].
//! - **Deferred**: operations only record what should happen and return
//!   handles naming graph nodes. [`Session::build_graph`] consumes the session
//!   and produces a [`FrozenGraph`] for a scheduler to run.
//!
//! Mutating operations are transactional: if one fails, every table is left
//! exactly as it was before the call.
//!
//! Mode-specific behavior lives in the `immediate` and `deferred`
//! submodules; file outputs in `outputs`.
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

use log::{debug, info};
use snafu::prelude::*;

use crate::{
    annotator::{self, AnnotatorIdentity, AnnotatorRef, QcContext, QcEntry},
    config::{ExecutionMode, SessionConfig},
    error::{
        DuplicateTableSnafu, EngineResult, UnknownColumnSnafu, UnknownReferenceSnafu,
        WrongModeSnafu,
    },
    filter::{self, FilterOptions, Predicate, ResolveScope, RowFilter},
    frame::Frame,
    graph::FrozenGraph,
    handle::Handle,
    output::FileAction,
    table::{LoadSource, Table, TableId},
};

mod deferred;
mod immediate;
mod outputs;

/// A file recorded for generation in deferred mode.
#[derive(Debug, Clone)]
pub(crate) struct FileSpec {
    pub(crate) table: TableId,
    pub(crate) path: PathBuf,
    pub(crate) action: FileAction,
    pub(crate) dependencies: Vec<Handle>,
}

/// Tables, annotators and outputs of one run.
#[derive(Debug)]
pub struct Session {
    pub(crate) config: SessionConfig,
    pub(crate) tables: Vec<Table>,
    pub(crate) names: HashMap<String, TableId>,
    /// Every annotator attached anywhere, by produced column.
    pub(crate) known: HashMap<String, Vec<AnnotatorRef>>,
    pub(crate) files: Vec<FileSpec>,
    pub(crate) qc: Vec<QcEntry>,
    pub(crate) qc_done: HashSet<(TableId, String)>,
}

/// State restored when a mutating operation fails.
struct Snapshot {
    tables: Vec<Table>,
    names: HashMap<String, TableId>,
    known: HashMap<String, Vec<AnnotatorRef>>,
    files: Vec<FileSpec>,
    qc: Vec<QcEntry>,
    qc_done: HashSet<(TableId, String)>,
}

impl Session {
    /// Open a session.
    pub fn new(config: SessionConfig) -> Self {
        info!(
            "opening {} session (results: {}, cache: {})",
            config.mode,
            config.result_dir.display(),
            config.cache_dir.display()
        );
        Self {
            config,
            tables: Vec::new(),
            names: HashMap::new(),
            known: HashMap::new(),
            files: Vec::new(),
            qc: Vec::new(),
            qc_done: HashSet::new(),
        }
    }

    /// Open an immediate-mode session with default settings.
    pub fn immediate() -> Self {
        Self::new(SessionConfig::new(ExecutionMode::Immediate))
    }

    /// Open a deferred-mode session with default settings.
    pub fn deferred() -> Self {
        Self::new(SessionConfig::new(ExecutionMode::Deferred))
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.config.mode
    }

    /// A table by id.
    pub fn table(&self, id: TableId) -> EngineResult<&Table> {
        self.tables.get(id.0).with_context(|| UnknownReferenceSnafu {
            table: id.to_string(),
            detail: "no such table in this session".to_string(),
        })
    }

    /// Id of the most recently created table with this name.
    pub fn table_by_name(&self, name: &str) -> Option<TableId> {
        self.names.get(name).copied()
    }

    /// All tables in creation order.
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter()
    }

    /// Current columns of a table (immediate mode, or once loaded).
    pub fn frame(&self, id: TableId) -> EngineResult<Option<&Frame>> {
        Ok(self.table(id)?.frame())
    }

    /// Quality-control artifacts registered so far.
    pub fn qc_entries(&self) -> &[QcEntry] {
        &self.qc
    }

    /// Create a root table.
    ///
    /// The name must be usable as a directory name. In deferred mode it must
    /// also be unique within the session. In immediate mode the table is
    /// loaded before this returns.
    pub fn create_table(
        &mut self,
        name: &str,
        source: impl Into<LoadSource>,
        dependencies: Vec<Handle>,
    ) -> EngineResult<TableId> {
        let source = source.into();
        let result_dir = self.config.result_dir.join(name);
        self.transaction(|s| s.insert_table(name, source, dependencies, result_dir))
    }

    /// Load a table's columns. Repeated calls are no-ops.
    pub fn load(&mut self, id: TableId) -> EngineResult<Handle> {
        self.table(id)?;
        match self.mode() {
            ExecutionMode::Immediate => {
                self.transaction(|s| s.load_now(id))?;
                Ok(Handle::Done)
            }
            ExecutionMode::Deferred => Ok(Handle::Load(id)),
        }
    }

    /// Attach an annotator to a table (and to every descendant).
    ///
    /// Attaching an identical annotator again is a no-op. Prerequisites are
    /// attached first.
    pub fn attach(&mut self, id: TableId, annotator: AnnotatorRef) -> EngineResult<Handle> {
        self.table(id)?;
        self.transaction(|s| s.attach_inner(id, &annotator))
    }

    /// Handle on all annotators of a table, for work that needs every column.
    pub fn annotate(&mut self, id: TableId) -> EngineResult<Handle> {
        self.table(id)?;
        Ok(match self.mode() {
            ExecutionMode::Immediate => Handle::Done,
            ExecutionMode::Deferred => Handle::Annotate(id),
        })
    }

    /// Derive a child table holding the rows selected by `row_filter`.
    ///
    /// The child gets the parent's load-time columns plus `parent_row`, and
    /// inherits every annotator attached to the parent.
    pub fn filter(
        &mut self,
        id: TableId,
        new_name: &str,
        row_filter: RowFilter,
        options: FilterOptions,
    ) -> EngineResult<TableId> {
        self.table(id)?;
        self.transaction(|s| s.filter_inner(id, new_name, row_filter, options))
    }

    /// A new root table with (a subset of) the load-time columns of `id` and
    /// none of its annotators.
    pub fn clone_without_annotators(
        &mut self,
        id: TableId,
        new_name: &str,
        columns: Option<Vec<String>>,
        result_dir: Option<PathBuf>,
    ) -> EngineResult<TableId> {
        let source_table = self.table(id)?;
        if let (Some(wanted), Some(available)) = (&columns, source_table.non_annotator_columns())
        {
            if let Some(missing) = wanted.iter().find(|c| !available.contains(c)) {
                return UnknownColumnSnafu {
                    table: source_table.name(),
                    column: missing.clone(),
                    available: available.to_vec(),
                }
                .fail();
            }
        }
        let result_dir = result_dir.unwrap_or_else(|| self.config.result_dir.join(new_name));
        let dependencies = vec![Handle::Load(id)];
        self.transaction(|s| {
            s.insert_table(
                new_name,
                LoadSource::copy_of(id, columns),
                dependencies,
                result_dir,
            )
        })
    }

    /// Freeze the deferred-mode topology into a runnable graph.
    pub fn build_graph(self) -> EngineResult<FrozenGraph> {
        crate::graph::build(self)
    }

    fn transaction<T>(&mut self, op: impl FnOnce(&mut Self) -> EngineResult<T>) -> EngineResult<T> {
        let snapshot = Snapshot {
            tables: self.tables.clone(),
            names: self.names.clone(),
            known: self.known.clone(),
            files: self.files.clone(),
            qc: self.qc.clone(),
            qc_done: self.qc_done.clone(),
        };
        let result = op(self);
        if let Err(err) = &result {
            debug!("rolling back failed operation: {err}");
            self.tables = snapshot.tables;
            self.names = snapshot.names;
            self.known = snapshot.known;
            self.files = snapshot.files;
            self.qc = snapshot.qc;
            self.qc_done = snapshot.qc_done;
        }
        result
    }

    pub(crate) fn insert_table(
        &mut self,
        name: &str,
        source: LoadSource,
        dependencies: Vec<Handle>,
        result_dir: PathBuf,
    ) -> EngineResult<TableId> {
        annotator::validate_table_name(name)?;
        if self.mode() == ExecutionMode::Deferred {
            ensure!(!self.names.contains_key(name), DuplicateTableSnafu { name });
        }
        let id = TableId(self.tables.len());
        self.tables.push(Table::new(
            id,
            name.to_string(),
            source,
            dependencies,
            result_dir,
        ));
        self.names.insert(name.to_string(), id);
        info!("created table {name} ({} mode)", self.mode());
        if self.mode() == ExecutionMode::Immediate {
            self.load_now(id)?;
        }
        Ok(id)
    }

    fn attach_inner(&mut self, id: TableId, annotator: &AnnotatorRef) -> EngineResult<Handle> {
        let name = self.tables[id.0].name.clone();
        annotator::closure(&name, annotator)?;
        match self.mode() {
            ExecutionMode::Immediate => {
                self.attach_now(id, annotator)?;
                Ok(Handle::Done)
            }
            ExecutionMode::Deferred => {
                self.register_deferred(id, annotator)?;
                Ok(Handle::Annotator {
                    table: id,
                    cache_name: annotator.cache_name().to_string(),
                })
            }
        }
    }

    fn filter_inner(
        &mut self,
        id: TableId,
        new_name: &str,
        row_filter: RowFilter,
        options: FilterOptions,
    ) -> EngineResult<TableId> {
        let (predicate, mut filter_annotators) = match row_filter {
            RowFilter::Function { fingerprint, func } => {
                (Predicate::Function { fingerprint, func }, Vec::new())
            }
            RowFilter::Conditions(conditions) => {
                let parent = &self.tables[id.0];
                let scope = ResolveScope {
                    table: &parent.name,
                    loaded_columns: parent
                        .frame()
                        .map(|f| f.column_names().map(str::to_string).collect()),
                    known: &self.known,
                    column_lookup: &options.column_lookup,
                };
                let (resolved, annotators) = filter::resolve(&scope, &conditions)?;
                (Predicate::Conditions(resolved), annotators)
            }
        };
        for annotator in options.annotators {
            if !filter_annotators
                .iter()
                .any(|a| a.cache_name() == annotator.cache_name())
            {
                filter_annotators.push(annotator);
            }
        }

        let mut dependencies = options.dependencies;
        dependencies.push(Handle::Load(id));
        for annotator in &filter_annotators {
            let handle = self.attach_inner(id, annotator)?;
            if !handle.is_done() {
                dependencies.push(handle);
            }
        }

        let result_dir = options
            .result_dir
            .unwrap_or_else(|| self.tables[id.0].result_dir.join(new_name));
        let child = self.insert_table(
            new_name,
            LoadSource::derived(id, predicate),
            dependencies,
            result_dir,
        )?;
        self.tables[child.0].parent = Some(id);
        self.tables[child.0].filter_annotators = filter_annotators;
        self.tables[id.0].children.push(child);

        let inherited: Vec<AnnotatorRef> = self.tables[id.0].annotators.clone();
        for annotator in &inherited {
            self.attach_inner(child, annotator)?;
        }
        info!("filtered {} into {new_name}", self.tables[id.0].name);
        Ok(child)
    }

    /// Remember `annotator` for bare-column lookups in filter conditions.
    pub(crate) fn remember(&mut self, annotator: &AnnotatorRef) {
        let identity = AnnotatorIdentity::of(annotator.as_ref());
        for column in annotator.columns() {
            let entry = self.known.entry(column.clone()).or_default();
            if !entry
                .iter()
                .any(|a| AnnotatorIdentity::of(a.as_ref()) == identity)
            {
                entry.push(Arc::clone(annotator));
            }
        }
    }

    /// Invoke the annotator's quality-control hook, once per table.
    pub(crate) fn register_qc(&mut self, id: TableId, annotator: &AnnotatorRef) {
        let key = (id, annotator.cache_name().to_string());
        if self.qc_done.insert(key) {
            let table = self.tables[id.0].name.clone();
            let mut ctx = QcContext::new(&table, annotator.cache_name(), &mut self.qc);
            annotator.register_qc(&mut ctx);
        }
    }

    pub(crate) fn ensure_mode(&self, mode: ExecutionMode, operation: &str) -> EngineResult<()> {
        ensure!(
            self.mode() == mode,
            WrongModeSnafu {
                operation,
                mode: self.mode().as_str(),
            }
        );
        Ok(())
    }
}
