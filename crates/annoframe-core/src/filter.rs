//! Row filters and derivation of child tables.
//!
//! A filter is either a user function returning a [`Selection`] or a list of
//! declarative [`Condition`]s. Conditions are combined with a logical AND and
//! evaluated with Arrow's comparison kernels against scalar thresholds:
//!
//! - Integer thresholds compare integer columns exactly; other numeric
//!   comparisons cast the column to `Float64`.
//! - String thresholds compare the column cast to `Utf8`.
//! - The `|` operators compare the absolute value of the column.
//! - `isin` keeps rows whose value equals any member of the set.
//! - Null values never pass a condition.
//!
//! Deriving a child keeps the parent's load-time columns for the selected
//! rows, keeps their row labels, and adds a `parent_row` column holding those
//! labels.
use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, Scalar, StringArray,
    UInt64Array,
};
use arrow::compute::kernels::{boolean as boolean_kernels, cmp as cmp_kernels};
use arrow::compute::{cast, prep_null_mask_filter};
use arrow::datatypes::{DataType, Float64Type, Int64Type};
use arrow::error::ArrowError;
use snafu::prelude::*;

use crate::{
    annotator::{AnnotatorIdentity, AnnotatorRef, TableView},
    error::{
        AmbiguousColumnSnafu, ComputeError, EngineResult, FrameSnafu, InvalidConditionSnafu,
        InvalidOperatorSnafu, LoadSnafu, UnknownColumnSnafu,
    },
    frame::{Frame, RowLabel},
    handle::Handle,
};

/// Name of the provenance column added to filtered tables.
pub const PARENT_ROW_COLUMN: &str = "parent_row";

/// Comparison operator of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `==`
    Eq,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    LtEq,
    /// `>=`
    GtEq,
    /// `|<`: absolute value below the threshold.
    AbsLt,
    /// `|>`
    AbsGt,
    /// `|<=`
    AbsLtEq,
    /// `|>=`
    AbsGtEq,
    /// `isin`: value is a member of the threshold set.
    IsIn,
}

impl Op {
    /// Operator token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Eq => "==",
            Op::Lt => "<",
            Op::Gt => ">",
            Op::LtEq => "<=",
            Op::GtEq => ">=",
            Op::AbsLt => "|<",
            Op::AbsGt => "|>",
            Op::AbsLtEq => "|<=",
            Op::AbsGtEq => "|>=",
            Op::IsIn => "isin",
        }
    }

    fn is_absolute(&self) -> bool {
        matches!(self, Op::AbsLt | Op::AbsGt | Op::AbsLtEq | Op::AbsGtEq)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Op {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s {
            "==" => Op::Eq,
            "<" => Op::Lt,
            ">" => Op::Gt,
            "<=" => Op::LtEq,
            ">=" => Op::GtEq,
            "|<" => Op::AbsLt,
            "|>" => Op::AbsGt,
            "|<=" => Op::AbsLtEq,
            "|>=" => Op::AbsGtEq,
            "isin" => Op::IsIn,
            other => return InvalidOperatorSnafu { op: other }.fail(),
        };
        Ok(op)
    }
}

/// Right-hand side of a [`Condition`].
#[derive(Debug, Clone, PartialEq)]
pub enum Threshold {
    /// Integer, compared as `f64`.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    Str(String),
    /// Boolean.
    Bool(bool),
    /// Members for `isin`.
    Set(Vec<Threshold>),
}

impl Threshold {
    fn fingerprint(&self) -> String {
        match self {
            Threshold::Int(v) => format!("i:{v}"),
            Threshold::Float(v) => format!("f:{:016x}", v.to_bits()),
            Threshold::Str(v) => format!("s:{v:?}"),
            Threshold::Bool(v) => format!("b:{v}"),
            Threshold::Set(members) => {
                let inner: Vec<String> = members.iter().map(Threshold::fingerprint).collect();
                format!("set:[{}]", inner.join(","))
            }
        }
    }
}

impl From<i64> for Threshold {
    fn from(v: i64) -> Self {
        Threshold::Int(v)
    }
}

impl From<i32> for Threshold {
    fn from(v: i32) -> Self {
        Threshold::Int(i64::from(v))
    }
}

impl From<f64> for Threshold {
    fn from(v: f64) -> Self {
        Threshold::Float(v)
    }
}

impl From<bool> for Threshold {
    fn from(v: bool) -> Self {
        Threshold::Bool(v)
    }
}

impl From<&str> for Threshold {
    fn from(v: &str) -> Self {
        Threshold::Str(v.to_string())
    }
}

impl From<String> for Threshold {
    fn from(v: String) -> Self {
        Threshold::Str(v)
    }
}

impl<T: Into<Threshold>> From<Vec<T>> for Threshold {
    fn from(v: Vec<T>) -> Self {
        Threshold::Set(v.into_iter().map(Into::into).collect())
    }
}

/// Column of an annotator, by position or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSelector {
    /// Position in [`crate::Annotator::columns`].
    Index(usize),
    /// Column name.
    Name(String),
}

/// Left-hand side of a [`Condition`].
#[derive(Debug, Clone)]
pub enum ColumnRef {
    /// A column name, or a `column_lookup` abbreviation. Names that are not on
    /// the table are searched for among known annotators.
    Name(String),
    /// The first column of an annotator, which is attached if needed.
    Annotator(AnnotatorRef),
    /// A specific column of an annotator, which is attached if needed.
    AnnotatorColumn(AnnotatorRef, ColumnSelector),
}

impl From<&str> for ColumnRef {
    fn from(name: &str) -> Self {
        ColumnRef::Name(name.to_string())
    }
}

impl From<String> for ColumnRef {
    fn from(name: String) -> Self {
        ColumnRef::Name(name)
    }
}

impl From<AnnotatorRef> for ColumnRef {
    fn from(annotator: AnnotatorRef) -> Self {
        ColumnRef::Annotator(annotator)
    }
}

impl From<(AnnotatorRef, usize)> for ColumnRef {
    fn from((annotator, index): (AnnotatorRef, usize)) -> Self {
        ColumnRef::AnnotatorColumn(annotator, ColumnSelector::Index(index))
    }
}

impl From<(AnnotatorRef, &str)> for ColumnRef {
    fn from((annotator, name): (AnnotatorRef, &str)) -> Self {
        ColumnRef::AnnotatorColumn(annotator, ColumnSelector::Name(name.to_string()))
    }
}

/// A declarative `(column, operator, threshold)` condition.
#[derive(Debug, Clone)]
pub struct Condition {
    /// Column to test.
    pub column: ColumnRef,
    /// Comparison.
    pub op: Op,
    /// Value compared against.
    pub threshold: Threshold,
}

impl Condition {
    /// Build a condition.
    pub fn new(column: impl Into<ColumnRef>, op: Op, threshold: impl Into<Threshold>) -> Self {
        Self {
            column: column.into(),
            op,
            threshold: threshold.into(),
        }
    }

    /// Build a condition from an operator token such as `"|>="`.
    pub fn parse(
        column: impl Into<ColumnRef>,
        op: &str,
        threshold: impl Into<Threshold>,
    ) -> EngineResult<Self> {
        Ok(Self::new(column, op.parse()?, threshold))
    }
}

/// Rows chosen by a filter function.
#[derive(Debug, Clone)]
pub enum Selection {
    /// One flag per row; kept rows keep their order. Nulls are dropped.
    Mask(BooleanArray),
    /// Row labels of the table, in the order the child should have.
    Rows(Vec<RowLabel>),
}

/// User filter function.
pub type FilterFn = Arc<dyn Fn(&TableView<'_>) -> Result<Selection, ComputeError> + Send + Sync>;

/// How a child table selects its rows.
#[derive(Clone)]
pub enum RowFilter {
    /// Arbitrary function. `fingerprint` identifies its logic for caching.
    Function {
        /// Digest of the function's logic and parameters.
        fingerprint: String,
        /// The function.
        func: FilterFn,
    },
    /// Conditions, all of which must hold.
    Conditions(Vec<Condition>),
}

impl RowFilter {
    /// Filter by function.
    pub fn function<F>(fingerprint: impl Into<String>, func: F) -> Self
    where
        F: Fn(&TableView<'_>) -> Result<Selection, ComputeError> + Send + Sync + 'static,
    {
        RowFilter::Function {
            fingerprint: fingerprint.into(),
            func: Arc::new(func),
        }
    }

    /// Filter by conditions.
    pub fn conditions(conditions: impl IntoIterator<Item = Condition>) -> Self {
        RowFilter::Conditions(conditions.into_iter().collect())
    }
}

impl fmt::Debug for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowFilter::Function { fingerprint, .. } => f
                .debug_struct("Function")
                .field("fingerprint", fingerprint)
                .finish_non_exhaustive(),
            RowFilter::Conditions(conditions) => {
                f.debug_tuple("Conditions").field(conditions).finish()
            }
        }
    }
}

/// Options for [`crate::Session::filter`].
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    /// Annotators the filter function reads; attached to the parent first.
    pub annotators: Vec<AnnotatorRef>,
    /// Extra dependencies of the child's load step.
    pub dependencies: Vec<Handle>,
    /// Abbreviations usable as condition column names.
    pub column_lookup: HashMap<String, ColumnRef>,
    /// Result directory of the child (default: `<parent result dir>/<name>`).
    pub result_dir: Option<PathBuf>,
}

/// A condition whose column has been resolved to a name.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedCondition {
    pub(crate) column: String,
    pub(crate) op: Op,
    pub(crate) threshold: Threshold,
}

/// Filter logic as stored on a derived table.
#[derive(Clone)]
pub(crate) enum Predicate {
    Function { fingerprint: String, func: FilterFn },
    Conditions(Vec<ResolvedCondition>),
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

impl Predicate {
    /// Stable digest input of the filter logic.
    pub(crate) fn fingerprint(&self) -> String {
        match self {
            Predicate::Function { fingerprint, .. } => format!("fn:{fingerprint}"),
            Predicate::Conditions(conditions) => {
                let parts: Vec<String> = conditions
                    .iter()
                    .map(|c| {
                        format!(
                            "{:?}{}{}",
                            c.column,
                            c.op.as_str(),
                            c.threshold.fingerprint()
                        )
                    })
                    .collect();
                format!("conditions:[{}]", parts.join(";"))
            }
        }
    }

    /// Select rows of `table`.
    pub(crate) fn select(&self, table: &TableView<'_>) -> EngineResult<Selection> {
        match self {
            Predicate::Function { func, .. } => func(table).context(LoadSnafu {
                table: table.name(),
            }),
            Predicate::Conditions(conditions) => {
                evaluate(table.name(), table.frame(), conditions).map(Selection::Mask)
            }
        }
    }
}

/// What a table looks like to condition resolution.
pub(crate) struct ResolveScope<'a> {
    pub(crate) table: &'a str,
    /// Current columns, if the table is loaded.
    pub(crate) loaded_columns: Option<Vec<String>>,
    /// Every annotator ever attached in the session, by produced column.
    pub(crate) known: &'a HashMap<String, Vec<AnnotatorRef>>,
    pub(crate) column_lookup: &'a HashMap<String, ColumnRef>,
}

/// Resolve condition columns to names and collect the annotators that must
/// be attached before the filter can run.
pub(crate) fn resolve(
    scope: &ResolveScope<'_>,
    conditions: &[Condition],
) -> EngineResult<(Vec<ResolvedCondition>, Vec<AnnotatorRef>)> {
    let mut resolved = Vec::with_capacity(conditions.len());
    let mut annotators: Vec<AnnotatorRef> = Vec::new();
    for condition in conditions {
        let (column, annotator) = resolve_column(scope, &condition.column)?;
        if let Some(annotator) = annotator {
            let name = annotator.cache_name().to_string();
            if !annotators.iter().any(|a| a.cache_name() == name) {
                annotators.push(annotator);
            }
        }
        resolved.push(ResolvedCondition {
            column,
            op: condition.op,
            threshold: condition.threshold.clone(),
        });
    }
    Ok((resolved, annotators))
}

fn resolve_column(
    scope: &ResolveScope<'_>,
    column: &ColumnRef,
) -> EngineResult<(String, Option<AnnotatorRef>)> {
    if let ColumnRef::Name(name) = column {
        let on_table = scope
            .loaded_columns
            .as_ref()
            .is_some_and(|cols| cols.iter().any(|c| c == name));
        if on_table {
            return Ok((name.clone(), None));
        }
    }
    let column = match column {
        ColumnRef::Name(name) => scope.column_lookup.get(name).unwrap_or(column),
        other => other,
    };
    match column {
        ColumnRef::Annotator(annotator) => {
            let name = annotator.columns().first().cloned().unwrap_or_default();
            Ok((name, Some(Arc::clone(annotator))))
        }
        ColumnRef::AnnotatorColumn(annotator, selector) => {
            let declared = annotator.columns();
            let name = match selector {
                ColumnSelector::Index(i) => declared.get(*i).cloned(),
                ColumnSelector::Name(n) => declared.iter().find(|c| *c == n).cloned(),
            };
            let name = name.with_context(|| UnknownColumnSnafu {
                table: scope.table,
                column: format!("{selector:?} of {}", annotator.cache_name()),
                available: declared.to_vec(),
            })?;
            Ok((name, Some(Arc::clone(annotator))))
        }
        ColumnRef::Name(name) => {
            let candidates = distinct(scope.known.get(name).map(Vec::as_slice).unwrap_or(&[]));
            match candidates.as_slice() {
                [single] => Ok((name.clone(), Some(Arc::clone(single)))),
                [] => match &scope.loaded_columns {
                    Some(columns) if !columns.contains(name) => {
                        let mut available: Vec<String> = columns
                            .iter()
                            .cloned()
                            .chain(scope.column_lookup.keys().cloned())
                            .collect();
                        available.sort();
                        available.dedup();
                        UnknownColumnSnafu {
                            table: scope.table,
                            column: name.clone(),
                            available,
                        }
                        .fail()
                    }
                    // Not loaded yet: the load step provides it or the
                    // filter fails when it runs.
                    _ => Ok((name.clone(), None)),
                },
                many => AmbiguousColumnSnafu {
                    table: scope.table,
                    column: name.clone(),
                    annotators: many
                        .iter()
                        .map(|a| AnnotatorIdentity::of(a.as_ref()).to_string())
                        .collect::<Vec<_>>(),
                }
                .fail(),
            }
        }
    }
}

fn distinct(annotators: &[AnnotatorRef]) -> Vec<AnnotatorRef> {
    let mut seen: Vec<AnnotatorIdentity> = Vec::new();
    let mut out = Vec::new();
    for annotator in annotators {
        let identity = AnnotatorIdentity::of(annotator.as_ref());
        if !seen.contains(&identity) {
            seen.push(identity);
            out.push(Arc::clone(annotator));
        }
    }
    out
}

/// AND of all conditions over `frame`; nulls are false.
pub(crate) fn evaluate(
    table: &str,
    frame: &Frame,
    conditions: &[ResolvedCondition],
) -> EngineResult<BooleanArray> {
    let mut keep = BooleanArray::from(vec![true; frame.num_rows()]);
    for condition in conditions {
        let values = frame.column(&condition.column).with_context(|| UnknownColumnSnafu {
            table,
            column: condition.column.clone(),
            available: frame.column_names().map(str::to_string).collect::<Vec<_>>(),
        })?;
        let mask = condition_mask(values, condition.op, &condition.threshold).map_err(|e| {
            InvalidConditionSnafu {
                table,
                column: condition.column.clone(),
                detail: e.to_string(),
            }
            .build()
        })?;
        keep = boolean_kernels::and(&keep, &nulls_as_false(&mask)).map_err(|e| {
            InvalidConditionSnafu {
                table,
                column: condition.column.clone(),
                detail: e.to_string(),
            }
            .build()
        })?;
    }
    Ok(keep)
}

/// `mask` with null entries turned into `false`.
fn nulls_as_false(mask: &BooleanArray) -> BooleanArray {
    match mask.nulls() {
        Some(_) => prep_null_mask_filter(mask),
        None => mask.clone(),
    }
}

fn condition_mask(
    values: &ArrayRef,
    op: Op,
    threshold: &Threshold,
) -> Result<BooleanArray, ArrowError> {
    match (op, threshold) {
        (Op::IsIn, Threshold::Set(members)) => {
            let mut mask = BooleanArray::from(vec![false; values.len()]);
            for member in members {
                let hit = compare(values, Op::Eq, member)?;
                mask = boolean_kernels::or(&mask, &nulls_as_false(&hit))?;
            }
            Ok(mask)
        }
        (Op::IsIn, single) => compare(values, Op::Eq, single),
        (_, Threshold::Set(_)) => Err(ArrowError::InvalidArgumentError(format!(
            "operator {op} does not take a set"
        ))),
        (op, threshold) => compare(values, op, threshold),
    }
}

fn compare(values: &ArrayRef, op: Op, threshold: &Threshold) -> Result<BooleanArray, ArrowError> {
    let (lhs, rhs): (ArrayRef, ArrayRef) = match threshold {
        Threshold::Int(v) => match integer(values, op, *v)? {
            Some(operands) => operands,
            None => numeric(values, op, *v as f64)?,
        },
        Threshold::Float(v) => numeric(values, op, *v)?,
        Threshold::Str(v) => {
            ensure_not_absolute(op)?;
            (
                cast(values.as_ref(), &DataType::Utf8)?,
                Arc::new(StringArray::from(vec![v.as_str()])),
            )
        }
        Threshold::Bool(v) => {
            ensure_not_absolute(op)?;
            (
                cast(values.as_ref(), &DataType::Boolean)?,
                Arc::new(BooleanArray::from(vec![*v])),
            )
        }
        Threshold::Set(_) => {
            return Err(ArrowError::InvalidArgumentError(
                "nested sets are not supported".to_string(),
            ));
        }
    };
    let rhs = Scalar::new(rhs);
    match op {
        Op::Eq | Op::IsIn => cmp_kernels::eq(&lhs, &rhs),
        Op::Lt | Op::AbsLt => cmp_kernels::lt(&lhs, &rhs),
        Op::Gt | Op::AbsGt => cmp_kernels::gt(&lhs, &rhs),
        Op::LtEq | Op::AbsLtEq => cmp_kernels::lt_eq(&lhs, &rhs),
        Op::GtEq | Op::AbsGtEq => cmp_kernels::gt_eq(&lhs, &rhs),
    }
}

fn numeric(values: &ArrayRef, op: Op, threshold: f64) -> Result<(ArrayRef, ArrayRef), ArrowError> {
    let as_float = cast(values.as_ref(), &DataType::Float64)?;
    let lhs: ArrayRef = if op.is_absolute() {
        Arc::new(
            as_float
                .as_primitive::<Float64Type>()
                .unary::<_, Float64Type>(f64::abs),
        )
    } else {
        as_float
    };
    Ok((lhs, Arc::new(Float64Array::from(vec![threshold]))))
}

/// Operands for an integer threshold against an integer column, compared
/// without going through `Float64`. `None` for other column types.
fn integer(
    values: &ArrayRef,
    op: Op,
    threshold: i64,
) -> Result<Option<(ArrayRef, ArrayRef)>, ArrowError> {
    match values.data_type() {
        DataType::UInt64 => Ok(u64::try_from(threshold)
            .ok()
            .filter(|_| !op.is_absolute())
            .map(|t| -> (ArrayRef, ArrayRef) {
                (Arc::clone(values), Arc::new(UInt64Array::from(vec![t])))
            })),
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => {
            let as_int = cast(values.as_ref(), &DataType::Int64)?;
            let lhs: ArrayRef = if op.is_absolute() {
                Arc::new(
                    as_int
                        .as_primitive::<Int64Type>()
                        .unary::<_, Int64Type>(i64::saturating_abs),
                )
            } else {
                as_int
            };
            Ok(Some((lhs, Arc::new(Int64Array::from(vec![threshold])))))
        }
        _ => Ok(None),
    }
}

fn ensure_not_absolute(op: Op) -> Result<(), ArrowError> {
    if op.is_absolute() {
        return Err(ArrowError::InvalidArgumentError(format!(
            "operator {op} needs a numeric threshold"
        )));
    }
    Ok(())
}

/// Row positions of `parent` picked by `selection`.
pub(crate) fn selected_positions(
    table: &str,
    parent: &Frame,
    selection: &Selection,
) -> EngineResult<Vec<usize>> {
    match selection {
        Selection::Mask(mask) => {
            ensure!(
                mask.len() == parent.num_rows(),
                InvalidConditionSnafu {
                    table,
                    column: "<mask>",
                    detail: format!(
                        "mask has {} entries, table has {} rows",
                        mask.len(),
                        parent.num_rows()
                    ),
                }
            );
            let mask = nulls_as_false(mask);
            Ok(mask
                .values()
                .iter()
                .enumerate()
                .filter_map(|(i, keep)| keep.then_some(i))
                .collect())
        }
        Selection::Rows(labels) => {
            let mut seen = HashSet::with_capacity(labels.len());
            if let Some(label) = labels.iter().find(|l| !seen.insert(**l)) {
                return InvalidConditionSnafu {
                    table,
                    column: "<rows>",
                    detail: format!("row {label} selected more than once"),
                }
                .fail();
            }
            parent
                .index()
                .positions_of(labels)
                .context(FrameSnafu { table })
        }
    }
}

/// Build a child frame: the parent's load-time columns (minus any previous
/// `parent_row`) at `positions`, plus a fresh `parent_row` column.
pub(crate) fn derive_child(
    table: &str,
    parent: &Frame,
    non_annotator_columns: &[String],
    positions: &[usize],
) -> EngineResult<Frame> {
    let carried: Vec<&str> = non_annotator_columns
        .iter()
        .map(String::as_str)
        .filter(|c| *c != PARENT_ROW_COLUMN)
        .collect();
    let taken = parent
        .select(carried.as_slice())
        .and_then(|f| f.take(positions))
        .context(FrameSnafu { table })?;
    let parent_rows: ArrayRef = Arc::new(UInt64Array::from(taken.index().to_labels()));
    taken
        .with_column(PARENT_ROW_COLUMN, parent_rows)
        .context(FrameSnafu { table })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotator::{Annotator, Computed};
    use crate::error::{EngineError, ErrorKind};
    use arrow::datatypes::UInt64Type;

    #[derive(Debug)]
    struct Produces(Vec<String>, &'static str);

    impl Annotator for Produces {
        fn columns(&self) -> &[String] {
            &self.0
        }

        fn fingerprint(&self) -> String {
            self.1.to_string()
        }

        fn compute(&self, table: &TableView<'_>) -> Result<Computed, ComputeError> {
            Ok(Computed::Block(Frame::empty(table.num_rows())))
        }
    }

    fn frame() -> Frame {
        Frame::new([
            (
                "x",
                Arc::new(Int64Array::from(vec![Some(-3), Some(1), None, Some(4)])) as ArrayRef,
            ),
            (
                "name",
                Arc::new(StringArray::from(vec!["a", "b", "c", "d"])) as ArrayRef,
            ),
        ])
        .unwrap()
    }

    fn cond(column: &str, op: &str, threshold: impl Into<Threshold>) -> ResolvedCondition {
        ResolvedCondition {
            column: column.to_string(),
            op: op.parse().unwrap(),
            threshold: threshold.into(),
        }
    }

    fn kept(mask: &BooleanArray) -> Vec<bool> {
        mask.iter().map(|v| v.unwrap_or(false)).collect()
    }

    #[test]
    fn operators_parse_and_reject_unknown_tokens() {
        for token in ["==", "<", ">", "<=", ">=", "|<", "|>", "|<=", "|>=", "isin"] {
            let op: Op = token.parse().unwrap();
            assert_eq!(op.as_str(), token);
        }
        let err = "=>".parse::<Op>().unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperator { .. }));
    }

    #[test]
    fn numeric_and_absolute_comparisons() {
        let f = frame();
        let mask = evaluate("t", &f, &[cond("x", ">", 0)]).unwrap();
        assert_eq!(kept(&mask), vec![false, true, false, true]);

        let mask = evaluate("t", &f, &[cond("x", "|>=", 3.0)]).unwrap();
        assert_eq!(kept(&mask), vec![true, false, false, true]);
    }

    #[test]
    fn conditions_are_anded_and_nulls_dropped() {
        let f = frame();
        let mask = evaluate("t", &f, &[cond("x", "|<", 10), cond("name", "==", "d")]).unwrap();
        assert_eq!(kept(&mask), vec![false, false, false, true]);
        assert_eq!(mask.null_count(), 0);
    }

    #[test]
    fn isin_matches_any_member() {
        let f = frame();
        let mask = evaluate("t", &f, &[cond("name", "isin", vec!["a", "c"])]).unwrap();
        assert_eq!(kept(&mask), vec![true, false, true, false]);
    }

    #[test]
    fn set_threshold_needs_isin() {
        let err = evaluate("t", &frame(), &[cond("x", "<", vec![1, 2])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Computation);
    }

    #[test]
    fn derive_child_keeps_labels_and_replaces_parent_row() {
        let parent = frame();
        let columns = vec!["x".to_string(), "name".to_string()];
        let child = derive_child("child", &parent, &columns, &[1, 3]).unwrap();
        assert_eq!(
            child.column_names().collect::<Vec<_>>(),
            vec!["x", "name", PARENT_ROW_COLUMN]
        );
        assert_eq!(child.index().to_labels(), vec![1, 3]);

        let mut grand_columns = columns.clone();
        grand_columns.push(PARENT_ROW_COLUMN.to_string());
        let grand = derive_child("grand", &child, &grand_columns, &[1]).unwrap();
        let rows = grand
            .column(PARENT_ROW_COLUMN)
            .unwrap()
            .as_primitive::<UInt64Type>();
        assert_eq!(rows.values().to_vec(), vec![3]);
        assert_eq!(grand.num_columns(), 3);
    }

    #[test]
    fn explicit_rows_follow_given_order() {
        let parent = frame();
        let positions = selected_positions("t", &parent, &Selection::Rows(vec![3, 0])).unwrap();
        assert_eq!(positions, vec![3, 0]);
    }

    #[test]
    fn masks_with_and_without_nulls() {
        let parent = frame();
        let plain = BooleanArray::from(vec![false, true, false, true]);
        assert!(plain.nulls().is_none());
        let positions = selected_positions("t", &parent, &Selection::Mask(plain)).unwrap();
        assert_eq!(positions, vec![1, 3]);

        let nullable = BooleanArray::from(vec![Some(true), None, Some(false), Some(true)]);
        let positions = selected_positions("t", &parent, &Selection::Mask(nullable)).unwrap();
        assert_eq!(positions, vec![0, 3]);
    }

    #[test]
    fn repeated_rows_are_rejected() {
        let err =
            selected_positions("t", &frame(), &Selection::Rows(vec![1, 2, 1])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidCondition { .. }));
        assert!(err.to_string().contains("row 1 selected more than once"));
    }

    #[test]
    fn integer_thresholds_compare_exactly() {
        let big = 1_i64 << 53;
        let f = Frame::new([(
            "x",
            Arc::new(Int64Array::from(vec![Some(big), None, Some(-big - 1)])) as ArrayRef,
        )])
        .unwrap();
        let mask = evaluate("t", &f, &[cond("x", "==", big + 1)]).unwrap();
        assert_eq!(kept(&mask), vec![false, false, false]);
        let mask = evaluate("t", &f, &[cond("x", "<", big + 1)]).unwrap();
        assert_eq!(kept(&mask), vec![true, false, true]);
        let mask = evaluate("t", &f, &[cond("x", "|>", big)]).unwrap();
        assert_eq!(kept(&mask), vec![false, false, true]);

        let unsigned = Frame::new([(
            "u",
            Arc::new(UInt64Array::from(vec![u64::MAX, 7])) as ArrayRef,
        )])
        .unwrap();
        let mask = evaluate("t", &unsigned, &[cond("u", ">", i64::MAX)]).unwrap();
        assert_eq!(kept(&mask), vec![true, false]);
    }

    #[test]
    fn bare_names_resolve_through_known_annotators() {
        let a: AnnotatorRef = Arc::new(Produces(vec!["score".into()], "a"));
        let b: AnnotatorRef = Arc::new(Produces(vec!["score".into()], "b"));
        let lookup = HashMap::new();

        let mut known = HashMap::new();
        known.insert("score".to_string(), vec![Arc::clone(&a), Arc::clone(&a)]);
        let scope = ResolveScope {
            table: "t",
            loaded_columns: Some(vec!["x".into()]),
            known: &known,
            column_lookup: &lookup,
        };
        let (resolved, annos) = resolve(&scope, &[Condition::new("score", Op::Gt, 1)]).unwrap();
        assert_eq!(resolved[0].column, "score");
        assert_eq!(annos.len(), 1);

        let mut clashing = HashMap::new();
        clashing.insert("score".to_string(), vec![a, b]);
        let scope = ResolveScope {
            table: "t",
            loaded_columns: Some(vec!["x".into()]),
            known: &clashing,
            column_lookup: &lookup,
        };
        let err = resolve(&scope, &[Condition::new("score", Op::Gt, 1)]).unwrap_err();
        assert!(matches!(err, EngineError::AmbiguousColumn { .. }));

        let err = resolve(&scope, &[Condition::new("nope", Op::Gt, 1)]).unwrap_err();
        match err {
            EngineError::UnknownColumn { available, .. } => assert_eq!(available, vec!["x"]),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn lookup_and_annotator_columns_resolve() {
        let a: AnnotatorRef = Arc::new(Produces(vec!["lo".into(), "hi".into()], ""));
        let mut lookup = HashMap::new();
        lookup.insert("HI".to_string(), ColumnRef::from((Arc::clone(&a), 1)));
        let known = HashMap::new();
        let scope = ResolveScope {
            table: "t",
            loaded_columns: None,
            known: &known,
            column_lookup: &lookup,
        };
        let (resolved, annos) = resolve(
            &scope,
            &[
                Condition::new("HI", Op::Lt, 2),
                Condition::new(Arc::clone(&a), Op::Gt, 0),
                Condition::new((a, "hi"), Op::Gt, 0),
            ],
        )
        .unwrap();
        let names: Vec<_> = resolved.iter().map(|c| c.column.as_str()).collect();
        assert_eq!(names, vec!["hi", "lo", "hi"]);
        assert_eq!(annos.len(), 1);
    }
}
