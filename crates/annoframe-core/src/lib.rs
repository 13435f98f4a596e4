//! Core engine for incrementally annotated tables.
//!
//! A table is loaded once and then enriched with computed columns by
//! annotators. Each annotator declares the columns it produces and the other
//! annotators it needs; the engine computes every (table, annotator) pair at
//! most once and merges the result into the table's append-only column store.
//! Filtering a table derives a child that inherits the parent's annotators and
//! receives their columns by re-indexing instead of recomputation.
//!
//! The pieces:
//!
//! - An Arrow-backed column store with a label-preserving row index
//!   (`frame` module).
//! - The annotator contract and identity rules (`annotator` module).
//! - Tables, their load sources and the table tree (`table` module).
//! - A [`Session`] that owns every table and runs operations either
//!   immediately or by recording them for a graph (`session` module).
//! - Tree-fix and the [`FrozenGraph`] of load, compute, forward and file
//!   nodes, keyed by chained BLAKE3 content keys (`graph` module).
//! - A tokio-based [`LocalScheduler`] behind the [`Scheduler`] trait.
//! - A content-addressed on-disk cache of Arrow IPC files (`cache` module).
//! - Row filters, tab-separated writers, plots and generated files.
#![deny(missing_docs)]
pub mod annotator;
pub mod cache;
mod combine;
pub mod config;
pub mod error;
pub mod filter;
pub mod frame;
pub mod graph;
pub mod handle;
pub mod output;
pub mod scheduler;
pub mod session;
pub mod table;

pub use annotator::{
    Annotator, AnnotatorIdentity, AnnotatorRef, Computed, QcContext, QcEntry, TableView,
};
pub use cache::{CacheError, CacheKey, CacheStore};
pub use config::{ConfigError, ExecutionMode, SessionConfig};
pub use error::{ComputeError, EngineError, EngineResult, ErrorKind};
pub use filter::{
    ColumnRef, ColumnSelector, Condition, FilterFn, FilterOptions, Op, PARENT_ROW_COLUMN,
    RowFilter, Selection, Threshold,
};
pub use frame::{Frame, FrameError, RowIndex, RowLabel};
pub use graph::{FrozenGraph, NodeId, NodeInfo, NodeKind, NodeRun, NodeState};
pub use handle::{FileOutput, Handle};
pub use output::{
    CalcFn, Figure, FileWriterFn, FloatFormat, Mangler, OutputError, PlotFn, PlotOptions,
    WriteOptions,
};
pub use scheduler::{LocalScheduler, NodeOutcome, RunReport, Scheduler};
pub use session::Session;
pub use table::{LoadFn, LoadSource, Table, TableId};
