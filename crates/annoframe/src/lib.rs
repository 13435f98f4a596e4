//! # annoframe
//!
//! Tables that are incrementally enriched with computed columns, evaluated
//! either immediately or as a cached, scheduled dependency graph.
//!
//! This crate is the supported public entry point and provides a small, stable surface.
//!
//! ## Example
//!
//! ```rust,ignore
//! use annoframe::prelude::*;
//!
//! let mut session = Session::new(SessionConfig::new(ExecutionMode::Deferred));
//! let genes = session.create_table("genes", frame, vec![])?;
//! let handle = session.attach(genes, Arc::new(MyAnnotator))?;
//! let graph = session.build_graph()?;
//! let report = LocalScheduler::from_config(graph.config())
//!     .run_targets(&graph, &[handle])
//!     .await?;
//! ```

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// Row filtering namespace.
pub mod filter {
    pub use annoframe_core::filter::{
        ColumnRef, ColumnSelector, Condition, FilterFn, FilterOptions, Op, PARENT_ROW_COLUMN,
        RowFilter, Selection, Threshold,
    };
}

/// File output namespace.
pub mod output {
    pub use annoframe_core::output::{
        CalcFn, Figure, FileWriterFn, FloatFormat, Mangler, OutputError, PlotFn, PlotOptions,
        WriteOptions, is_spreadsheet,
    };
}

/// Graph execution namespace.
pub mod graph {
    pub use annoframe_core::graph::{FrozenGraph, NodeId, NodeInfo, NodeKind, NodeRun, NodeState};
    pub use annoframe_core::scheduler::{LocalScheduler, NodeOutcome, RunReport, Scheduler};
}

pub use annoframe_core::annotator::{
    Annotator, AnnotatorIdentity, AnnotatorRef, Computed, QcContext, QcEntry, TableView,
};
pub use annoframe_core::cache::{CacheKey, CacheStore};
pub use annoframe_core::config::{ConfigError, ExecutionMode, SessionConfig};
pub use annoframe_core::error::{ComputeError, EngineError, EngineResult, ErrorKind};
pub use annoframe_core::frame::{Frame, FrameError, RowIndex, RowLabel};
pub use annoframe_core::handle::{FileOutput, Handle};
pub use annoframe_core::session::Session;
pub use annoframe_core::table::{LoadSource, Table, TableId};
