//! Annotator contract.
//!
//! An [`Annotator`] is a named, pure computation that adds one or more
//! columns to a table. The engine never inspects what an annotator does; it
//! only relies on the declarations made here:
//!
//! - `columns()` lists the exact output columns (never empty).
//! - `cache_name()` is the stable key used for collision detection and as the
//!   cache entry name. It defaults to the first column.
//! - `dependent_annotators()` lists prerequisites that must be present on the
//!   same table before `compute` runs.
//! - Identity is structural: kind, cache name, columns and `fingerprint()`.
//!   Two instances with equal identities are interchangeable.
use std::{collections::HashSet, fmt, sync::Arc};

use arrow::array::{Array, ArrayRef, AsArray, PrimitiveArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type};
use snafu::prelude::*;

use crate::{
    error::{
        ColumnSetMismatchSnafu, ComputeError, DependencyCycleSnafu, EmptyColumnsSnafu,
        EngineResult, FrameSnafu, InvalidNameSnafu,
    },
    frame::Frame,
    handle::Handle,
};

/// Longest accepted cache name.
pub const MAX_CACHE_NAME_LEN: usize = 60;

/// Characters that may not appear in a cache name or table name.
pub const FORBIDDEN_NAME_CHARS: &[char] = &['/', '\\', '?', '*'];

/// Shared, type-erased annotator.
pub type AnnotatorRef = Arc<dyn Annotator>;

/// Result of an annotator computation.
#[derive(Debug, Clone)]
pub enum Computed {
    /// A single column. Only valid for annotators that declare exactly one
    /// column; it is named after that column.
    Column(ArrayRef),
    /// A block whose column set must equal the declared columns.
    Block(Frame),
}

impl From<Frame> for Computed {
    fn from(frame: Frame) -> Self {
        Computed::Block(frame)
    }
}

impl From<ArrayRef> for Computed {
    fn from(array: ArrayRef) -> Self {
        Computed::Column(array)
    }
}

/// Read-only view of a table handed to [`Annotator::compute`] and to user
/// callbacks.
#[derive(Debug, Clone, Copy)]
pub struct TableView<'a> {
    name: &'a str,
    frame: &'a Frame,
}

impl<'a> TableView<'a> {
    pub(crate) fn new(name: &'a str, frame: &'a Frame) -> Self {
        Self { name, frame }
    }

    /// Table name.
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Current column store.
    pub fn frame(&self) -> &'a Frame {
        self.frame
    }

    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.frame.num_rows()
    }

    /// Column called `name`, if present.
    pub fn column(&self, name: &str) -> Option<&'a ArrayRef> {
        self.frame.column(name)
    }

    /// Column called `name`, or an error naming the table and the column.
    pub fn require_column(&self, name: &str) -> Result<&'a ArrayRef, ComputeError> {
        self.frame
            .column(name)
            .ok_or_else(|| format!("table {} has no column {name}", self.name).into())
    }

    /// Column called `name` cast to `Float64`.
    pub fn f64_column(&self, name: &str) -> Result<PrimitiveArray<Float64Type>, ComputeError> {
        let array = self.require_column(name)?;
        let cast_array = cast(array.as_ref(), &DataType::Float64)?;
        Ok(cast_array.as_primitive::<Float64Type>().clone())
    }
}

/// A quality-control artifact registered by an annotator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QcEntry {
    /// Table the annotator is attached to.
    pub table: String,
    /// Cache name of the registering annotator.
    pub annotator: String,
    /// Free-form artifact name.
    pub name: String,
}

/// Collector passed to [`Annotator::register_qc`].
#[derive(Debug)]
pub struct QcContext<'a> {
    table: &'a str,
    annotator: &'a str,
    entries: &'a mut Vec<QcEntry>,
}

impl<'a> QcContext<'a> {
    pub(crate) fn new(table: &'a str, annotator: &'a str, entries: &'a mut Vec<QcEntry>) -> Self {
        Self {
            table,
            annotator,
            entries,
        }
    }

    /// Table the annotator is being registered on.
    pub fn table(&self) -> &str {
        self.table
    }

    /// Record an artifact.
    pub fn register(&mut self, name: impl Into<String>) {
        self.entries.push(QcEntry {
            table: self.table.to_string(),
            annotator: self.annotator.to_string(),
            name: name.into(),
        });
    }
}

/// A pluggable column computation.
pub trait Annotator: Send + Sync + fmt::Debug {
    /// Output columns, in order. Must not be empty.
    fn columns(&self) -> &[String];

    /// Stable key for storage and conflict detection.
    fn cache_name(&self) -> &str {
        self.columns().first().map_or("", String::as_str)
    }

    /// Digest of the annotator's configuration. Change it whenever the
    /// computed values would change.
    fn fingerprint(&self) -> String {
        String::new()
    }

    /// Kind tag used in identity comparisons.
    fn kind(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Annotators that must be attached (and computed) first. `None` entries
    /// are ignored.
    fn dependent_annotators(&self) -> Vec<Option<AnnotatorRef>> {
        Vec::new()
    }

    /// Extra scheduler-level preconditions for the computation on `table`.
    fn preconditions(&self, _table: &str) -> Vec<Handle> {
        Vec::new()
    }

    /// Compute the declared columns from the table's current columns.
    fn compute(&self, table: &TableView<'_>) -> Result<Computed, ComputeError>;

    /// Register quality-control artifacts. Invoked once per table.
    fn register_qc(&self, _ctx: &mut QcContext<'_>) {}

    /// Worker slots the computation occupies.
    fn cores_needed(&self) -> usize {
        1
    }
}

/// Structural identity of an annotator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnnotatorIdentity {
    /// [`Annotator::kind`].
    pub kind: &'static str,
    /// [`Annotator::cache_name`].
    pub cache_name: String,
    /// [`Annotator::columns`].
    pub columns: Vec<String>,
    /// [`Annotator::fingerprint`].
    pub fingerprint: String,
}

impl AnnotatorIdentity {
    /// Identity of `annotator`.
    pub fn of(annotator: &dyn Annotator) -> Self {
        Self {
            kind: annotator.kind(),
            cache_name: annotator.cache_name().to_string(),
            columns: annotator.columns().to_vec(),
            fingerprint: annotator.fingerprint(),
        }
    }
}

impl fmt::Display for AnnotatorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.columns.join(", "))?;
        if !self.fingerprint.is_empty() {
            write!(f, "@{}", self.fingerprint)?;
        }
        Ok(())
    }
}

/// Returns true if both annotators have the same structural identity.
pub fn same_identity(a: &dyn Annotator, b: &dyn Annotator) -> bool {
    AnnotatorIdentity::of(a) == AnnotatorIdentity::of(b)
}

/// Check that a cache name can be used as a storage key and file name.
pub(crate) fn validate_name(table: &str, name: &str) -> EngineResult<()> {
    let reason = if name.chars().count() > MAX_CACHE_NAME_LEN {
        Some(format!("longer than {MAX_CACHE_NAME_LEN} characters"))
    } else if name.starts_with("__") {
        Some("names starting with __ are reserved".to_string())
    } else {
        path_unsafe(name)
    };
    invalid_name(table, name, reason)
}

/// Check that a table name can be used as a directory name.
pub(crate) fn validate_table_name(name: &str) -> EngineResult<()> {
    invalid_name(name, name, path_unsafe(name))
}

fn path_unsafe(name: &str) -> Option<String> {
    if name.is_empty() {
        Some("name is empty".to_string())
    } else if name == "." || name == ".." {
        Some("reserved path component".to_string())
    } else {
        name.chars()
            .find(|c| FORBIDDEN_NAME_CHARS.contains(c))
            .map(|c| format!("contains forbidden character {c:?}"))
    }
}

fn invalid_name(table: &str, name: &str, reason: Option<String>) -> EngineResult<()> {
    match reason {
        Some(reason) => InvalidNameSnafu {
            table,
            name,
            reason,
        }
        .fail(),
        None => Ok(()),
    }
}

/// Validate the declarations of `annotator` for use on `table`.
pub(crate) fn validate(table: &str, annotator: &dyn Annotator) -> EngineResult<()> {
    ensure!(
        !annotator.columns().is_empty(),
        EmptyColumnsSnafu {
            table,
            annotator: annotator.cache_name(),
        }
    );
    validate_name(table, annotator.cache_name())
}

/// `annotator` and all of its transitive prerequisites, prerequisites first.
///
/// Prerequisites are matched by cache name; the first instance seen wins.
/// Fails with a dependency cycle error if an annotator (transitively) requires
/// itself.
pub(crate) fn closure(table: &str, annotator: &AnnotatorRef) -> EngineResult<Vec<AnnotatorRef>> {
    let mut out = Vec::new();
    let mut done = HashSet::new();
    let mut stack = Vec::new();
    visit(table, annotator, &mut stack, &mut done, &mut out)?;
    Ok(out)
}

fn visit(
    table: &str,
    annotator: &AnnotatorRef,
    stack: &mut Vec<String>,
    done: &mut HashSet<String>,
    out: &mut Vec<AnnotatorRef>,
) -> EngineResult<()> {
    let name = annotator.cache_name().to_string();
    if done.contains(&name) {
        return Ok(());
    }
    if let Some(start) = stack.iter().position(|n| *n == name) {
        let mut cycle = stack[start..].to_vec();
        cycle.push(name);
        return DependencyCycleSnafu { table, cycle }.fail();
    }
    validate(table, annotator.as_ref())?;
    stack.push(name.clone());
    for prerequisite in annotator.dependent_annotators().into_iter().flatten() {
        visit(table, &prerequisite, stack, done, out)?;
    }
    stack.pop();
    done.insert(name);
    out.push(Arc::clone(annotator));
    Ok(())
}

/// Turn a computation result into a block with exactly the declared columns,
/// in declared order.
pub(crate) fn into_block(
    table: &str,
    annotator: &dyn Annotator,
    computed: Computed,
) -> EngineResult<Frame> {
    let declared = annotator.columns();
    let block = match computed {
        Computed::Column(array) => {
            if declared.len() != 1 {
                return ColumnSetMismatchSnafu {
                    table,
                    annotator: annotator.cache_name(),
                    missing: declared.iter().skip(1).cloned().collect::<Vec<_>>(),
                    unexpected: Vec::<String>::new(),
                }
                .fail();
            }
            let rows = array.len();
            Frame::empty(rows)
                .with_column(declared[0].clone(), array)
                .context(FrameSnafu { table })?
        }
        Computed::Block(frame) => frame,
    };

    let produced: HashSet<&str> = block.column_names().collect();
    let expected: HashSet<&str> = declared.iter().map(String::as_str).collect();
    if produced != expected {
        let mut missing: Vec<String> = expected
            .difference(&produced)
            .map(|s| s.to_string())
            .collect();
        let mut unexpected: Vec<String> = produced
            .difference(&expected)
            .map(|s| s.to_string())
            .collect();
        missing.sort();
        unexpected.sort();
        return ColumnSetMismatchSnafu {
            table,
            annotator: annotator.cache_name(),
            missing,
            unexpected,
        }
        .fail();
    }
    block.select(declared).context(FrameSnafu { table })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, ErrorKind};
    use arrow::array::Int64Array;

    #[derive(Debug)]
    struct Fixed {
        columns: Vec<String>,
        name: Option<String>,
        deps: Vec<String>,
    }

    impl Fixed {
        fn new(columns: &[&str]) -> Self {
            Self {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                name: None,
                deps: Vec::new(),
            }
        }

        fn named(mut self, name: &str) -> Self {
            self.name = Some(name.to_string());
            self
        }

        fn requiring(mut self, deps: &[&str]) -> Self {
            self.deps = deps.iter().map(|d| d.to_string()).collect();
            self
        }
    }

    impl Annotator for Fixed {
        fn columns(&self) -> &[String] {
            &self.columns
        }

        fn cache_name(&self) -> &str {
            match &self.name {
                Some(name) => name,
                None => &self.columns[0],
            }
        }

        fn dependent_annotators(&self) -> Vec<Option<AnnotatorRef>> {
            self.deps
                .iter()
                .map(|d| {
                    // "a" -> "b" -> "a" style chains are built from names.
                    let next = match d.as_str() {
                        "cyc_a" => Fixed::new(&["cyc_a"]).requiring(&["cyc_b"]),
                        "cyc_b" => Fixed::new(&["cyc_b"]).requiring(&["cyc_a"]),
                        other => Fixed::new(&[other]),
                    };
                    Some(Arc::new(next) as AnnotatorRef)
                })
                .chain(std::iter::once(None))
                .collect()
        }

        fn compute(&self, table: &TableView<'_>) -> Result<Computed, ComputeError> {
            Ok(Computed::Block(Frame::empty(table.num_rows())))
        }
    }

    fn ints(values: Vec<i64>) -> ArrayRef {
        Arc::new(Int64Array::from(values))
    }

    #[test]
    fn cache_name_defaults_to_first_column() {
        let a = Fixed::new(&["y", "z"]);
        assert_eq!(a.cache_name(), "y");
        assert!(AnnotatorIdentity::of(&a).kind.ends_with("Fixed"));
    }

    #[test]
    fn identity_compares_structure() {
        let a = Fixed::new(&["y"]);
        let b = Fixed::new(&["y"]);
        let c = Fixed::new(&["y", "z"]).named("y");
        assert!(same_identity(&a, &b));
        assert!(!same_identity(&a, &c));
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_name("t", "fine_name").is_ok());
        for bad in ["", "a/b", "a?", "star*", "back\\slash", "..", "__load"] {
            let err = validate_name("t", bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{bad}");
        }
        let long = "x".repeat(MAX_CACHE_NAME_LEN + 1);
        assert!(validate_name("t", &long).is_err());
        assert!(validate_name("t", &"x".repeat(MAX_CACHE_NAME_LEN)).is_ok());
    }

    #[test]
    fn table_names_only_need_to_be_path_safe() {
        assert!(validate_table_name("__scratch").is_ok());
        assert!(validate_table_name(&"t".repeat(MAX_CACHE_NAME_LEN * 2)).is_ok());
        for bad in ["", ".", "a/b", "a*"] {
            assert!(validate_table_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn empty_columns_are_rejected() {
        let a = Fixed::new(&[]).named("empty");
        let err = validate("t", &a).unwrap_err();
        assert!(matches!(err, EngineError::EmptyColumns { .. }));
    }

    #[test]
    fn closure_orders_prerequisites_first() {
        let root: AnnotatorRef = Arc::new(Fixed::new(&["top"]).requiring(&["mid", "low"]));
        let names: Vec<String> = closure("t", &root)
            .unwrap()
            .iter()
            .map(|a| a.cache_name().to_string())
            .collect();
        assert_eq!(names, vec!["mid", "low", "top"]);
    }

    #[test]
    fn closure_detects_cycles() {
        let root: AnnotatorRef = Arc::new(Fixed::new(&["cyc_a"]).requiring(&["cyc_b"]));
        let err = closure("t", &root).unwrap_err();
        match err {
            EngineError::DependencyCycle { table, cycle } => {
                assert_eq!(table, "t");
                assert_eq!(cycle, vec!["cyc_a", "cyc_b", "cyc_a"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn single_column_result_needs_single_declared_column() {
        let one = Fixed::new(&["y"]);
        let block = into_block("t", &one, Computed::Column(ints(vec![1, 2]))).unwrap();
        assert_eq!(block.column_names().collect::<Vec<_>>(), vec!["y"]);

        let two = Fixed::new(&["y", "z"]);
        let err = into_block("t", &two, Computed::Column(ints(vec![1, 2]))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Computation);
    }

    #[test]
    fn block_must_match_declared_columns_exactly() {
        let a = Fixed::new(&["y", "z"]);
        let block = Frame::new([("z", ints(vec![1])), ("y", ints(vec![2]))]).unwrap();
        let ordered = into_block("t", &a, Computed::Block(block)).unwrap();
        assert_eq!(ordered.column_names().collect::<Vec<_>>(), vec!["y", "z"]);

        let extra = Frame::new([("y", ints(vec![1])), ("w", ints(vec![2]))]).unwrap();
        match into_block("t", &a, Computed::Block(extra)).unwrap_err() {
            EngineError::ColumnSetMismatch {
                missing,
                unexpected,
                ..
            } => {
                assert_eq!(missing, vec!["z"]);
                assert_eq!(unexpected, vec!["w"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
