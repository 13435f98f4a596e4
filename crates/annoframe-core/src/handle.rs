//! Handles returned by table operations.
//!
//! In immediate mode every operation has already run when it returns, so the
//! handle is [`Handle::Done`]. In deferred mode a handle names a graph node;
//! it can be listed as a dependency of other tables, annotators and file
//! outputs, and resolves to a node id once the graph is built.
use std::{fmt, path::PathBuf};

use crate::table::TableId;

/// Reference to a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Handle {
    /// The work already happened.
    Done,
    /// Load step of a table.
    Load(TableId),
    /// An annotator's result on a table.
    Annotator {
        /// Table the annotator is attached to.
        table: TableId,
        /// Annotator cache name.
        cache_name: String,
    },
    /// Every annotator currently registered on a table.
    Annotate(TableId),
    /// A generated file.
    File(PathBuf),
}

impl Handle {
    /// Returns true for [`Handle::Done`].
    pub fn is_done(&self) -> bool {
        matches!(self, Handle::Done)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Done => f.write_str("done"),
            Handle::Load(table) => write!(f, "load({table})"),
            Handle::Annotator { table, cache_name } => {
                write!(f, "annotator({table}, {cache_name})")
            }
            Handle::Annotate(table) => write!(f, "annotate({table})"),
            Handle::File(path) => write!(f, "file({})", path.display()),
        }
    }
}

/// A file produced by `write`, `plot` or `generate_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutput {
    /// Handle of the producing work.
    pub handle: Handle,
    /// Where the file is (or will be) written.
    pub path: PathBuf,
}
