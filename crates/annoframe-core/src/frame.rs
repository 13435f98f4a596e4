//! Column store primitive.
//!
//! A [`Frame`] is an ordered set of named Arrow arrays that share one
//! [`RowIndex`]. Tables keep their materialized columns in a frame, annotators
//! return frames (or single columns), and the engine only ever grows a
//! table's frame by appending whole columns.
//!
//! Row identity is carried by the index, not by position:
//!
//! - A freshly loaded table has the positional index `0..n`.
//! - Taking rows (filtering) keeps the labels of the surviving rows, so a
//!   filtered child can look its rows up in the parent by label.
//! - A block with the positional index is assumed to be in the row order of
//!   whatever it is merged into; a block with explicit labels is aligned by
//!   label.
use std::{collections::HashMap, sync::Arc};

use arrow::array::{Array, ArrayRef, RecordBatch, RecordBatchOptions, UInt64Array};
use arrow::compute::take as take_kernel;
use arrow::datatypes::{Field, Schema};
use arrow::error::ArrowError;
use snafu::prelude::*;

/// Label of a row in a [`RowIndex`].
pub type RowLabel = u64;

/// Errors from column store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FrameError {
    /// A column does not have the frame's row count.
    #[snafu(display("Column {column} has {found} rows, expected {expected}"))]
    LengthMismatch {
        /// Offending column.
        column: String,
        /// Row count of the frame.
        expected: usize,
        /// Row count of the column.
        found: usize,
    },

    /// A column name appears twice.
    #[snafu(display("Duplicate column name {column}"))]
    DuplicateColumn {
        /// The repeated name.
        column: String,
    },

    /// A requested column is not present.
    #[snafu(display("Unknown column {column}"))]
    UnknownColumn {
        /// The missing name.
        column: String,
    },

    /// A requested row label is not present in the index.
    #[snafu(display("Row label {label} is not present in the index"))]
    UnknownRowLabel {
        /// The missing label.
        label: RowLabel,
    },

    /// An explicit index contains the same label twice.
    #[snafu(display("Row label {label} appears more than once in the index"))]
    DuplicateRowLabel {
        /// The repeated label.
        label: RowLabel,
    },

    /// An index does not match the frame's row count.
    #[snafu(display("Index has {found} rows, frame has {expected}"))]
    IndexLength {
        /// Row count of the frame.
        expected: usize,
        /// Length of the index.
        found: usize,
    },

    /// A row position is past the end of the frame.
    #[snafu(display("Row position {position} out of bounds for {rows} rows"))]
    PositionOutOfBounds {
        /// The requested position.
        position: usize,
        /// Row count of the frame.
        rows: usize,
    },

    /// Arrow kernel or conversion failure.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },
}

/// Row identity shared by every column of a [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowIndex {
    /// Positional index `0..n`.
    Range(usize),
    /// Explicit labels in row order.
    Labels(Arc<[RowLabel]>),
}

impl RowIndex {
    /// Build an explicit index from labels.
    pub fn from_labels(labels: impl Into<Arc<[RowLabel]>>) -> Self {
        RowIndex::Labels(labels.into())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            RowIndex::Range(n) => *n,
            RowIndex::Labels(labels) => labels.len(),
        }
    }

    /// Returns true if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true for the positional `0..n` index.
    pub fn is_positional(&self) -> bool {
        matches!(self, RowIndex::Range(_))
    }

    /// Label of the row at `position`.
    pub fn label(&self, position: usize) -> Option<RowLabel> {
        match self {
            RowIndex::Range(n) => (position < *n).then_some(position as RowLabel),
            RowIndex::Labels(labels) => labels.get(position).copied(),
        }
    }

    /// All labels in row order.
    pub fn to_labels(&self) -> Vec<RowLabel> {
        match self {
            RowIndex::Range(n) => (0..*n as RowLabel).collect(),
            RowIndex::Labels(labels) => labels.to_vec(),
        }
    }

    /// Resolve labels to row positions, in the order given.
    pub fn positions_of(&self, labels: &[RowLabel]) -> Result<Vec<usize>, FrameError> {
        match self {
            RowIndex::Range(n) => labels
                .iter()
                .map(|&label| {
                    let pos = usize::try_from(label).ok().filter(|p| p < n);
                    pos.context(UnknownRowLabelSnafu { label })
                })
                .collect(),
            RowIndex::Labels(_) => {
                let lookup = self.lookup()?;
                labels
                    .iter()
                    .map(|label| {
                        lookup
                            .get(label)
                            .copied()
                            .context(UnknownRowLabelSnafu { label: *label })
                    })
                    .collect()
            }
        }
    }

    /// Index of the rows at `positions` (labels are kept, order follows
    /// `positions`). Positions must be in bounds.
    pub(crate) fn take(&self, positions: &[usize]) -> RowIndex {
        let labels: Vec<RowLabel> = match self {
            RowIndex::Range(_) => positions.iter().map(|&p| p as RowLabel).collect(),
            RowIndex::Labels(labels) => positions.iter().map(|&p| labels[p]).collect(),
        };
        RowIndex::Labels(labels.into())
    }

    /// Label -> position map; fails on duplicate labels.
    pub(crate) fn lookup(&self) -> Result<HashMap<RowLabel, usize>, FrameError> {
        let mut map = HashMap::with_capacity(self.len());
        for (pos, label) in self.to_labels().into_iter().enumerate() {
            if map.insert(label, pos).is_some() {
                return DuplicateRowLabelSnafu { label }.fail();
            }
        }
        Ok(map)
    }
}

/// Named Arrow columns sharing a [`RowIndex`].
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    index: RowIndex,
    names: Vec<String>,
    columns: Vec<ArrayRef>,
}

impl Frame {
    /// Build a frame with the positional index from `(name, array)` pairs.
    ///
    /// The row count is taken from the first column; every other column must
    /// match it and names must be unique.
    pub fn new<I, S>(columns: I) -> Result<Self, FrameError>
    where
        I: IntoIterator<Item = (S, ArrayRef)>,
        S: Into<String>,
    {
        let mut columns = columns.into_iter().peekable();
        let rows = columns.peek().map_or(0, |(_, array)| array.len());
        let mut frame = Frame::empty(rows);
        for (name, array) in columns {
            frame.push_column(name.into(), array)?;
        }
        Ok(frame)
    }

    /// A frame with `num_rows` rows and no columns.
    pub fn empty(num_rows: usize) -> Self {
        Self {
            index: RowIndex::Range(num_rows),
            names: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Replace the index. The length must match and labels must be unique.
    pub fn with_index(mut self, index: RowIndex) -> Result<Self, FrameError> {
        ensure!(
            index.len() == self.num_rows(),
            IndexLengthSnafu {
                expected: self.num_rows(),
                found: index.len(),
            }
        );
        if !index.is_positional() {
            index.lookup()?;
        }
        self.index = index;
        Ok(self)
    }

    /// Build a frame from a record batch (positional index).
    pub fn from_record_batch(batch: &RecordBatch) -> Result<Self, FrameError> {
        let mut frame = Frame::empty(batch.num_rows());
        for (field, array) in batch.schema().fields().iter().zip(batch.columns()) {
            frame.push_column(field.name().clone(), Arc::clone(array))?;
        }
        Ok(frame)
    }

    /// Convert to a record batch. The index is not included.
    pub fn to_record_batch(&self) -> Result<RecordBatch, FrameError> {
        let fields: Vec<Field> = self
            .names
            .iter()
            .zip(&self.columns)
            .map(|(name, array)| Field::new(name, array.data_type().clone(), true))
            .collect();
        let options = RecordBatchOptions::new().with_row_count(Some(self.num_rows()));
        RecordBatch::try_new_with_options(
            Arc::new(Schema::new(fields)),
            self.columns.clone(),
            &options,
        )
        .context(ArrowSnafu)
    }

    /// The row index.
    pub fn index(&self) -> &RowIndex {
        &self.index
    }

    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.index.len()
    }

    /// Number of columns.
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Column names in order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Returns true if a column called `name` exists.
    pub fn contains_column(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Column called `name`, if present.
    pub fn column(&self, name: &str) -> Option<&ArrayRef> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.columns[i])
    }

    /// `(name, array)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayRef)> {
        self.names.iter().map(String::as_str).zip(&self.columns)
    }

    /// Frame with only the named columns, in the requested order.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Frame, FrameError> {
        let mut out = Frame {
            index: self.index.clone(),
            names: Vec::with_capacity(names.len()),
            columns: Vec::with_capacity(names.len()),
        };
        for name in names {
            let name = name.as_ref();
            let array = self
                .column(name)
                .context(UnknownColumnSnafu { column: name })?;
            out.push_column(name.to_string(), Arc::clone(array))?;
        }
        Ok(out)
    }

    /// Frame without the column called `name` (unchanged if absent).
    pub fn without_column(&self, name: &str) -> Frame {
        let mut out = Frame {
            index: self.index.clone(),
            names: Vec::with_capacity(self.names.len()),
            columns: Vec::with_capacity(self.columns.len()),
        };
        for (n, array) in self.iter().filter(|(n, _)| *n != name) {
            out.names.push(n.to_string());
            out.columns.push(Arc::clone(array));
        }
        out
    }

    /// Rows at `positions`, in that order. Labels of the taken rows are kept.
    pub fn take(&self, positions: &[usize]) -> Result<Frame, FrameError> {
        let rows = self.num_rows();
        if let Some(&position) = positions.iter().find(|&&p| p >= rows) {
            return PositionOutOfBoundsSnafu { position, rows }.fail();
        }
        let indices = UInt64Array::from_iter_values(positions.iter().map(|&p| p as u64));
        let columns = self
            .columns
            .iter()
            .map(|array| take_kernel(array.as_ref(), &indices, None))
            .collect::<Result<Vec<_>, _>>()
            .context(ArrowSnafu)?;
        Ok(Frame {
            index: self.index.take(positions),
            names: self.names.clone(),
            columns,
        })
    }

    /// Rows looked up by label, in the order of `labels`.
    pub fn reindex(&self, labels: &[RowLabel]) -> Result<Frame, FrameError> {
        let positions = self.index.positions_of(labels)?;
        let mut out = self.take(&positions)?;
        out.index = RowIndex::from_labels(labels.to_vec());
        Ok(out)
    }

    /// Append a column.
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        array: ArrayRef,
    ) -> Result<Frame, FrameError> {
        self.push_column(name.into(), array)?;
        Ok(self)
    }

    /// Append every column of `other`. Row alignment is the caller's job.
    pub(crate) fn append_columns(mut self, other: Frame) -> Result<Frame, FrameError> {
        for (name, array) in other.names.into_iter().zip(other.columns) {
            self.push_column(name, array)?;
        }
        Ok(self)
    }

    fn push_column(&mut self, name: String, array: ArrayRef) -> Result<(), FrameError> {
        ensure!(
            !self.contains_column(&name),
            DuplicateColumnSnafu { column: name }
        );
        ensure!(
            array.len() == self.num_rows(),
            LengthMismatchSnafu {
                column: name,
                expected: self.num_rows(),
                found: array.len(),
            }
        );
        self.names.push(name);
        self.columns.push(array);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{AsArray, Int64Array, StringArray};
    use arrow::datatypes::Int64Type;

    fn xs(frame: &Frame, name: &str) -> Vec<i64> {
        frame
            .column(name)
            .unwrap()
            .as_primitive::<Int64Type>()
            .values()
            .to_vec()
    }

    fn sample() -> Frame {
        Frame::new([
            ("x", Arc::new(Int64Array::from(vec![10, 20, 30, 40])) as ArrayRef),
            (
                "name",
                Arc::new(StringArray::from(vec!["a", "b", "c", "d"])) as ArrayRef,
            ),
        ])
        .unwrap()
    }

    #[test]
    fn new_rejects_ragged_columns() {
        let err = Frame::new([
            ("x", Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef),
            ("y", Arc::new(Int64Array::from(vec![1])) as ArrayRef),
        ])
        .unwrap_err();
        assert!(matches!(err, FrameError::LengthMismatch { found: 1, .. }));
    }

    #[test]
    fn new_rejects_duplicate_names() {
        let err = Frame::new([
            ("x", Arc::new(Int64Array::from(vec![1])) as ArrayRef),
            ("x", Arc::new(Int64Array::from(vec![2])) as ArrayRef),
        ])
        .unwrap_err();
        assert!(matches!(err, FrameError::DuplicateColumn { .. }));
    }

    #[test]
    fn take_keeps_labels_and_order() {
        let frame = sample();
        let taken = frame.take(&[3, 1]).unwrap();
        assert_eq!(xs(&taken, "x"), vec![40, 20]);
        assert_eq!(taken.index().to_labels(), vec![3, 1]);

        let again = taken.take(&[1]).unwrap();
        assert_eq!(again.index().to_labels(), vec![1]);
    }

    #[test]
    fn reindex_looks_up_by_label() {
        let child = sample().take(&[1, 2, 3]).unwrap();
        let aligned = child.reindex(&[3, 1]).unwrap();
        assert_eq!(xs(&aligned, "x"), vec![40, 20]);

        let err = child.reindex(&[0]).unwrap_err();
        assert!(matches!(err, FrameError::UnknownRowLabel { label: 0 }));
    }

    #[test]
    fn with_index_rejects_duplicate_labels() {
        let frame =
            Frame::new([("x", Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef)]).unwrap();
        let err = frame
            .with_index(RowIndex::from_labels(vec![7, 7]))
            .unwrap_err();
        assert!(matches!(err, FrameError::DuplicateRowLabel { label: 7 }));
    }

    #[test]
    fn record_batch_conversion_keeps_empty_frames_row_count() {
        let batch = Frame::empty(5).to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 5);
        assert_eq!(batch.num_columns(), 0);

        let back = Frame::from_record_batch(&sample().to_record_batch().unwrap()).unwrap();
        assert_eq!(back, sample());
        assert_eq!(
            back.column("name").unwrap().as_string::<i32>().value(2),
            "c"
        );
    }
}
