//! Error types and SNAFU context selectors for the engine.
//!
//! `EngineError` is the single error surfaced by the public API. Each variant
//! names the table and, where one is involved, the annotator or column that
//! triggered it, and [`EngineError::kind`] classifies it into the invariant
//! families callers branch on. Lower layers ([`FrameError`],
//! [`CacheError`], [`OutputError`]) are wrapped with that context here.

use std::path::PathBuf;

use snafu::prelude::*;

use crate::{cache::CacheError, frame::FrameError, output::OutputError};

/// Error type returned by user callbacks (annotator computations, load and
/// filter functions, writers, plotters).
pub type ComputeError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;

/// Invariant family an [`EngineError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed names, duplicate tables, unresolvable references, misuse of the mode.
    Configuration,
    /// Two different annotators claim the same cache name or column.
    AnnotatorConflict,
    /// A merge would duplicate a column name.
    ColumnCollision,
    /// A computed block does not line up with the table's rows.
    IndexMismatch,
    /// Annotator or graph dependencies form a cycle.
    DependencyCycle,
    /// A user computation failed or broke its declared contract.
    Computation,
    /// Cache or output file I/O failed.
    Io,
}

/// Errors from table, annotator, graph and output operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    /// A table with this name is already registered in the session.
    #[snafu(display("Table {name} already exists in this session"))]
    DuplicateTable {
        /// The duplicated table name.
        name: String,
    },

    /// A table or cache name cannot be used as a key / directory name.
    #[snafu(display("Invalid name {name:?} on table {table}: {reason}"))]
    InvalidName {
        /// Table being configured.
        table: String,
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An annotator declares no output columns.
    #[snafu(display("Annotator {annotator} on table {table} declares no columns"))]
    EmptyColumns {
        /// Table being annotated.
        table: String,
        /// Offending annotator cache name.
        annotator: String,
    },

    /// A handle or table id does not resolve to anything known.
    #[snafu(display("Unresolvable reference on table {table}: {detail}"))]
    UnknownReference {
        /// Table the reference was used on.
        table: String,
        /// What could not be resolved.
        detail: String,
    },

    /// The operation is not available in the session's execution mode.
    #[snafu(display("{operation} is not available in {mode} mode"))]
    WrongMode {
        /// Attempted operation.
        operation: String,
        /// Active mode.
        mode: String,
    },

    /// A filter condition references a column that does not exist.
    #[snafu(display("Unknown column {column} on table {table}; available: {}", available.join(", ")))]
    UnknownColumn {
        /// Table being filtered.
        table: String,
        /// The unknown column.
        column: String,
        /// Columns and lookup names that would have been accepted.
        available: Vec<String>,
    },

    /// A bare column name is produced by more than one known annotator.
    #[snafu(display(
        "Column {column} on table {table} is produced by several annotators ({}); pass the annotator explicitly",
        annotators.join(", ")
    ))]
    AmbiguousColumn {
        /// Table being filtered.
        table: String,
        /// The ambiguous column.
        column: String,
        /// Cache names of the candidate annotators.
        annotators: Vec<String>,
    },

    /// A filter operator string is not recognised.
    #[snafu(display("Invalid filter operator {op:?}"))]
    InvalidOperator {
        /// The rejected operator.
        op: String,
    },

    /// A filter condition cannot be evaluated against its column.
    #[snafu(display("Cannot evaluate filter on table {table}, column {column}: {detail}"))]
    InvalidCondition {
        /// Table being filtered.
        table: String,
        /// Column of the condition.
        column: String,
        /// What went wrong.
        detail: String,
    },

    /// Two different writers target the same output path.
    #[snafu(display("Output {} of table {table} is already generated by a different writer", path.display()))]
    ConflictingOutput {
        /// Table being written.
        table: String,
        /// Contested path.
        path: PathBuf,
    },

    /// Same cache name attached with a different annotator identity.
    #[snafu(display(
        "Annotator redefinition conflict on table {table}: cache name {annotator} is already bound to {existing}, got {incoming}"
    ))]
    AnnotatorConflict {
        /// Table being annotated.
        table: String,
        /// The contested cache name.
        annotator: String,
        /// Identity already attached.
        existing: String,
        /// Identity that was rejected.
        incoming: String,
    },

    /// A column is already produced by a different annotator on this table.
    #[snafu(display(
        "Column {column} on table {table} is already produced by annotator {owner}; {annotator} cannot produce it too"
    ))]
    ColumnClaimed {
        /// Table being annotated.
        table: String,
        /// The contested column.
        column: String,
        /// Annotator that was rejected.
        annotator: String,
        /// Annotator that owns the column.
        owner: String,
    },

    /// Merging a block would duplicate existing column names.
    #[snafu(display(
        "Annotator {annotator} on table {table} created columns that are already present: {}",
        columns.join(", ")
    ))]
    ColumnCollision {
        /// Table being merged into.
        table: String,
        /// Annotator whose block collided.
        annotator: String,
        /// Colliding column names.
        columns: Vec<String>,
    },

    /// A block cannot be aligned with the table's rows.
    #[snafu(display("Index mismatch merging {annotator} into table {table}: {detail}"))]
    IndexMismatch {
        /// Table being merged into.
        table: String,
        /// Annotator whose block did not align.
        annotator: String,
        /// Row counts or labels involved.
        detail: String,
    },

    /// Annotator prerequisites or graph edges form a cycle.
    #[snafu(display("Dependency cycle on table {table}: {}", cycle.join(" -> ")))]
    DependencyCycle {
        /// Table where the cycle was detected.
        table: String,
        /// Members of the cycle, in dependency order.
        cycle: Vec<String>,
    },

    /// An annotator's computation returned an error.
    #[snafu(display("Annotator {annotator} failed on table {table}: {source}"))]
    Computation {
        /// Table being annotated.
        table: String,
        /// Failing annotator.
        annotator: String,
        /// Error raised by the computation.
        source: ComputeError,
    },

    /// An annotator returned a different column set than it declared.
    #[snafu(display(
        "Annotator {annotator} on table {table} declared different columns from those calculated (missing: [{}], unexpected: [{}])",
        missing.join(", "),
        unexpected.join(", ")
    ))]
    ColumnSetMismatch {
        /// Table being annotated.
        table: String,
        /// Offending annotator.
        annotator: String,
        /// Declared but not produced.
        missing: Vec<String>,
        /// Produced but not declared.
        unexpected: Vec<String>,
    },

    /// A load source or filter function failed.
    #[snafu(display("Loading table {table} failed: {source}"))]
    Load {
        /// Table being loaded.
        table: String,
        /// Error raised by the load source.
        source: ComputeError,
    },

    /// A node ran before the table it works on was loaded.
    #[snafu(display("Table {table} is not loaded yet"))]
    NotLoaded {
        /// The unloaded table.
        table: String,
    },

    /// Column store failure while working on a table.
    #[snafu(display("Column store error on table {table}: {source}"))]
    Frame {
        /// Table being worked on.
        table: String,
        /// Underlying column store error.
        source: FrameError,
    },

    /// Cache store failure.
    #[snafu(display("Cache error on table {table}: {source}"))]
    Cache {
        /// Table whose cache entry failed.
        table: String,
        /// Underlying cache error.
        source: CacheError,
    },

    /// Output file generation failed.
    #[snafu(display("Generating output for table {table} failed: {source}"))]
    Output {
        /// Table being written.
        table: String,
        /// Underlying output error.
        source: OutputError,
    },

    /// A scheduler worker task could not be joined.
    #[snafu(display("Scheduler worker failed: {source}"))]
    Worker {
        /// Underlying join error.
        source: tokio::task::JoinError,
    },
}

impl EngineError {
    /// The invariant family this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::DuplicateTable { .. }
            | EngineError::InvalidName { .. }
            | EngineError::EmptyColumns { .. }
            | EngineError::UnknownReference { .. }
            | EngineError::WrongMode { .. }
            | EngineError::UnknownColumn { .. }
            | EngineError::AmbiguousColumn { .. }
            | EngineError::InvalidOperator { .. }
            | EngineError::ConflictingOutput { .. }
            | EngineError::NotLoaded { .. } => ErrorKind::Configuration,
            EngineError::AnnotatorConflict { .. } | EngineError::ColumnClaimed { .. } => {
                ErrorKind::AnnotatorConflict
            }
            EngineError::ColumnCollision { .. } => ErrorKind::ColumnCollision,
            EngineError::IndexMismatch { .. } => ErrorKind::IndexMismatch,
            EngineError::DependencyCycle { .. } => ErrorKind::DependencyCycle,
            EngineError::Computation { .. }
            | EngineError::ColumnSetMismatch { .. }
            | EngineError::InvalidCondition { .. }
            | EngineError::Load { .. }
            | EngineError::Frame { .. }
            | EngineError::Worker { .. } => ErrorKind::Computation,
            EngineError::Cache { .. } | EngineError::Output { .. } => ErrorKind::Io,
        }
    }
}
