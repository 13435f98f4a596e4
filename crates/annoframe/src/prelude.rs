//! Wrapper prelude.
//!
//! The `annoframe` crate is the supported public entry point. Downstream code
//! should prefer importing from this prelude instead of depending on internal
//! core module paths.

pub use crate::filter::{Condition, FilterOptions, Op, RowFilter, Selection, Threshold};
pub use crate::graph::{FrozenGraph, LocalScheduler, NodeOutcome, RunReport, Scheduler};
pub use crate::output::{FloatFormat, PlotOptions, WriteOptions};
pub use crate::{
    Annotator, AnnotatorRef, Computed, ComputeError, EngineError, ErrorKind, ExecutionMode,
    FileOutput, Frame, Handle, LoadSource, QcContext, RowIndex, Session, SessionConfig, Table,
    TableId, TableView,
};
