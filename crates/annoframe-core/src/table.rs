//! Table entities and their load sources.
//!
//! Tables live in an arena owned by the [`crate::Session`] and refer to each
//! other by [`TableId`]. A child is created by filtering its parent and keeps
//! a back-reference to it; the parent lists its children in creation order.
//!
//! A table records which annotator produces which column. The record only
//! grows: once a column is claimed by one annotator cache name, no other
//! cache name may produce it on that table.
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use snafu::prelude::*;

use crate::{
    annotator::{AnnotatorIdentity, AnnotatorRef, TableView},
    cache::{CacheError, frame_digest},
    error::{
        AnnotatorConflictSnafu, ColumnClaimedSnafu, ComputeError, EngineResult, FrameSnafu,
        LoadSnafu, NotLoadedSnafu,
    },
    filter::{self, Predicate},
    frame::Frame,
    handle::Handle,
};

/// Stable index of a table in its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub(crate) usize);

impl TableId {
    /// Position in the session's arena.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table#{}", self.0)
    }
}

/// Load function of a table.
pub type LoadFn = Arc<dyn Fn() -> Result<Frame, ComputeError> + Send + Sync>;

/// Where a table's load-time columns come from.
#[derive(Clone)]
pub struct LoadSource {
    kind: SourceKind,
}

#[derive(Clone)]
pub(crate) enum SourceKind {
    /// Ready-made columns.
    Frame(Frame),
    /// Deterministic function.
    Function { fingerprint: String, func: LoadFn },
    /// Rows of the parent selected by a filter.
    Derived { parent: TableId, predicate: Predicate },
    /// Load-time columns of another table, without its annotators.
    Copy {
        source: TableId,
        columns: Option<Vec<String>>,
    },
}

impl LoadSource {
    /// Load from ready-made columns.
    pub fn frame(frame: Frame) -> Self {
        Self {
            kind: SourceKind::Frame(frame),
        }
    }

    /// Load by calling `func`. `fingerprint` identifies the function's logic
    /// and inputs; change it whenever the loaded data would change.
    pub fn function<F>(fingerprint: impl Into<String>, func: F) -> Self
    where
        F: Fn() -> Result<Frame, ComputeError> + Send + Sync + 'static,
    {
        Self {
            kind: SourceKind::Function {
                fingerprint: fingerprint.into(),
                func: Arc::new(func),
            },
        }
    }

    pub(crate) fn derived(parent: TableId, predicate: Predicate) -> Self {
        Self {
            kind: SourceKind::Derived { parent, predicate },
        }
    }

    pub(crate) fn copy_of(source: TableId, columns: Option<Vec<String>>) -> Self {
        Self {
            kind: SourceKind::Copy { source, columns },
        }
    }

    pub(crate) fn kind(&self) -> &SourceKind {
        &self.kind
    }

    /// Digest input describing this source's content.
    pub(crate) fn fingerprint(&self) -> Result<String, CacheError> {
        Ok(match &self.kind {
            SourceKind::Frame(frame) => format!("frame:{}", frame_digest(frame)?),
            SourceKind::Function { fingerprint, .. } => format!("fn:{fingerprint}"),
            SourceKind::Derived { predicate, .. } => format!("filter:{}", predicate.fingerprint()),
            SourceKind::Copy { columns, .. } => match columns {
                Some(columns) => format!("copy:[{}]", columns.join(",")),
                None => "copy:*".to_string(),
            },
        })
    }

    /// Table this source reads from, if any.
    pub(crate) fn upstream_table(&self) -> Option<TableId> {
        match &self.kind {
            SourceKind::Derived { parent, .. } => Some(*parent),
            SourceKind::Copy { source, .. } => Some(*source),
            SourceKind::Frame(_) | SourceKind::Function { .. } => None,
        }
    }

    /// Produce the load-time columns of `table`.
    ///
    /// Derived and copied sources read from `upstream`, which must be the
    /// loaded table returned by [`LoadSource::upstream_table`].
    pub(crate) fn produce(
        &self,
        table: &str,
        upstream: Option<Upstream<'_>>,
    ) -> EngineResult<Frame> {
        match (&self.kind, upstream) {
            (SourceKind::Frame(frame), _) => Ok(frame.clone()),
            (SourceKind::Function { func, .. }, _) => func().context(LoadSnafu { table }),
            (SourceKind::Derived { predicate, .. }, Some(up)) => {
                let selection = predicate.select(&TableView::new(up.name, up.frame))?;
                let positions = filter::selected_positions(table, up.frame, &selection)?;
                filter::derive_child(table, up.frame, up.non_annotator_columns, &positions)
            }
            (SourceKind::Copy { columns, .. }, Some(up)) => {
                let columns = columns.as_deref().unwrap_or(up.non_annotator_columns);
                up.frame.select(columns).context(FrameSnafu { table })
            }
            (
                SourceKind::Derived { parent: upstream, .. }
                | SourceKind::Copy {
                    source: upstream, ..
                },
                None,
            ) => NotLoadedSnafu {
                table: upstream.to_string(),
            }
            .fail(),
        }
    }
}

/// A loaded table read by a derived or copied source.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Upstream<'a> {
    pub(crate) name: &'a str,
    pub(crate) frame: &'a Frame,
    pub(crate) non_annotator_columns: &'a [String],
}

impl From<Frame> for LoadSource {
    fn from(frame: Frame) -> Self {
        LoadSource::frame(frame)
    }
}

impl fmt::Debug for LoadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SourceKind::Frame(frame) => write!(
                f,
                "LoadSource::Frame({} rows, {} columns)",
                frame.num_rows(),
                frame.num_columns()
            ),
            SourceKind::Function { fingerprint, .. } => {
                write!(f, "LoadSource::Function({fingerprint})")
            }
            SourceKind::Derived { parent, predicate } => {
                write!(f, "LoadSource::Derived({parent}, {predicate:?})")
            }
            SourceKind::Copy { source, columns } => {
                write!(f, "LoadSource::Copy({source}, {columns:?})")
            }
        }
    }
}

/// A named column store with its annotators and place in the table tree.
#[derive(Debug, Clone)]
pub struct Table {
    pub(crate) id: TableId,
    pub(crate) name: String,
    pub(crate) parent: Option<TableId>,
    pub(crate) children: Vec<TableId>,
    pub(crate) annotators: Vec<AnnotatorRef>,
    pub(crate) column_owners: BTreeMap<String, String>,
    pub(crate) non_annotator_columns: Option<Vec<String>>,
    pub(crate) store: Option<Frame>,
    pub(crate) source: LoadSource,
    pub(crate) dependencies: Vec<Handle>,
    pub(crate) result_dir: PathBuf,
    pub(crate) filter_annotators: Vec<AnnotatorRef>,
}

impl Table {
    pub(crate) fn new(
        id: TableId,
        name: String,
        source: LoadSource,
        dependencies: Vec<Handle>,
        result_dir: PathBuf,
    ) -> Self {
        Self {
            id,
            name,
            parent: None,
            children: Vec::new(),
            annotators: Vec::new(),
            column_owners: BTreeMap::new(),
            non_annotator_columns: None,
            store: None,
            source,
            dependencies,
            result_dir,
            filter_annotators: Vec::new(),
        }
    }

    /// Id in the session.
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent table, for filtered tables.
    pub fn parent(&self) -> Option<TableId> {
        self.parent
    }

    /// Child tables in creation order.
    pub fn children(&self) -> &[TableId] {
        &self.children
    }

    /// Directory for this table's output files.
    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    /// Default path of [`crate::Session::write`].
    pub fn table_file_name(&self) -> PathBuf {
        self.result_dir.join(format!("{}.tsv", self.name))
    }

    /// Returns true once the load-time columns are present.
    pub fn is_loaded(&self) -> bool {
        self.store.is_some()
    }

    /// Current column store, once loaded.
    pub fn frame(&self) -> Option<&Frame> {
        self.store.as_ref()
    }

    /// Columns established at load time.
    pub fn non_annotator_columns(&self) -> Option<&[String]> {
        self.non_annotator_columns.as_deref()
    }

    /// Attached annotators in attach order.
    pub fn annotators(&self) -> impl Iterator<Item = &AnnotatorRef> {
        self.annotators.iter()
    }

    /// Attached annotator with this cache name.
    pub fn annotator(&self, cache_name: &str) -> Option<&AnnotatorRef> {
        self.annotators.iter().find(|a| a.cache_name() == cache_name)
    }

    /// Returns true if an annotator with this cache name is attached.
    pub fn has_annotator(&self, cache_name: &str) -> bool {
        self.annotator(cache_name).is_some()
    }

    /// Cache name of the annotator producing `column`, if any.
    pub fn column_owner(&self, column: &str) -> Option<&str> {
        self.column_owners.get(column).map(String::as_str)
    }

    /// Record `annotator` on this table.
    ///
    /// Returns false if an identical annotator is already attached. Fails if a
    /// different annotator holds the cache name or any of the columns.
    pub(crate) fn register(&mut self, annotator: &AnnotatorRef) -> EngineResult<bool> {
        let cache_name = annotator.cache_name();
        if let Some(existing) = self.annotator(cache_name) {
            let existing = AnnotatorIdentity::of(existing.as_ref());
            let incoming = AnnotatorIdentity::of(annotator.as_ref());
            ensure!(
                existing == incoming,
                AnnotatorConflictSnafu {
                    table: &self.name,
                    annotator: cache_name,
                    existing: existing.to_string(),
                    incoming: incoming.to_string(),
                }
            );
            return Ok(false);
        }
        for column in annotator.columns() {
            if let Some(owner) = self.column_owners.get(column) {
                return ColumnClaimedSnafu {
                    table: &self.name,
                    column,
                    annotator: cache_name,
                    owner,
                }
                .fail();
            }
        }
        for column in annotator.columns() {
            self.column_owners
                .insert(column.clone(), cache_name.to_string());
        }
        self.annotators.push(Arc::clone(annotator));
        Ok(true)
    }

    /// Install the loaded columns.
    pub(crate) fn set_loaded(&mut self, frame: Frame) {
        self.non_annotator_columns = Some(frame.column_names().map(str::to_string).collect());
        self.store = Some(frame);
    }

    /// View of this table for sources that read from it.
    pub(crate) fn as_upstream(&self) -> Option<Upstream<'_>> {
        Some(Upstream {
            name: &self.name,
            frame: self.store.as_ref()?,
            non_annotator_columns: self.non_annotator_columns.as_deref()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotator::{Annotator, Computed, TableView};
    use crate::error::{EngineError, ErrorKind};

    #[derive(Debug)]
    struct Cols(Vec<String>, &'static str, &'static str);

    impl Annotator for Cols {
        fn columns(&self) -> &[String] {
            &self.0
        }

        fn cache_name(&self) -> &str {
            self.1
        }

        fn fingerprint(&self) -> String {
            self.2.to_string()
        }

        fn compute(&self, table: &TableView<'_>) -> Result<Computed, ComputeError> {
            Ok(Computed::Block(Frame::empty(table.num_rows())))
        }
    }

    fn cols(columns: &[&str], name: &'static str, fp: &'static str) -> AnnotatorRef {
        Arc::new(Cols(
            columns.iter().map(|c| c.to_string()).collect(),
            name,
            fp,
        ))
    }

    fn table() -> Table {
        Table::new(
            TableId(0),
            "t".into(),
            LoadSource::frame(Frame::empty(0)),
            Vec::new(),
            PathBuf::from("results/t"),
        )
    }

    #[test]
    fn identical_registration_is_a_no_op() {
        let mut t = table();
        assert!(t.register(&cols(&["y"], "double", "")).unwrap());
        assert!(!t.register(&cols(&["y"], "double", "")).unwrap());
        assert_eq!(t.annotators().count(), 1);
        assert_eq!(t.column_owner("y"), Some("double"));
    }

    #[test]
    fn same_cache_name_different_identity_conflicts() {
        let mut t = table();
        t.register(&cols(&["y"], "double", "")).unwrap();
        let err = t.register(&cols(&["y", "z"], "double", "")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AnnotatorConflict);
        let err = t.register(&cols(&["y"], "double", "v2")).unwrap_err();
        assert!(matches!(err, EngineError::AnnotatorConflict { .. }));
        assert_eq!(t.annotators().count(), 1);
    }

    #[test]
    fn column_claims_are_exclusive() {
        let mut t = table();
        t.register(&cols(&["y"], "double", "")).unwrap();
        let err = t.register(&cols(&["z", "y"], "other", "")).unwrap_err();
        match err {
            EngineError::ColumnClaimed { column, owner, .. } => {
                assert_eq!(column, "y");
                assert_eq!(owner, "double");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(t.column_owner("z"), None);
    }

    #[test]
    fn load_sources_fingerprint_their_content() {
        let a = LoadSource::function("v1", || Ok(Frame::empty(1)));
        let b = LoadSource::function("v2", || Ok(Frame::empty(1)));
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        let f = LoadSource::from(Frame::empty(3));
        assert!(f.fingerprint().unwrap().starts_with("frame:"));
        assert_eq!(f.upstream_table(), None);
    }

    #[test]
    fn copied_source_needs_a_loaded_upstream() {
        let copy = LoadSource::copy_of(TableId(3), None);
        assert_eq!(copy.upstream_table(), Some(TableId(3)));
        let err = copy.produce("c", None).unwrap_err();
        assert!(matches!(err, EngineError::NotLoaded { .. }));

        let mut up = table();
        up.set_loaded(Frame::empty(2));
        let frame = copy.produce("c", up.as_upstream()).unwrap();
        assert_eq!(frame.num_rows(), 2);
    }
}
