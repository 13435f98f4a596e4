#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use annoframe_core::{
    Annotator, AnnotatorRef, ComputeError, Computed, ExecutionMode, Frame, QcContext, Selection,
    Session, SessionConfig, TableView,
};
use arrow::array::{ArrayRef, AsArray, BooleanArray, Int64Array};
use arrow::datatypes::Int64Type;
use tempfile::TempDir;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub fn ints(values: &[i64]) -> ArrayRef {
    Arc::new(Int64Array::from(values.to_vec()))
}

/// Single-column frame `x`.
pub fn xs(values: &[i64]) -> Frame {
    Frame::new([("x", ints(values))]).expect("valid frame")
}

pub fn int_column(frame: &Frame, name: &str) -> Vec<i64> {
    frame
        .column(name)
        .unwrap_or_else(|| panic!("missing column {name}"))
        .as_primitive::<Int64Type>()
        .values()
        .to_vec()
}

pub fn column_names(frame: &Frame) -> Vec<String> {
    frame.column_names().map(str::to_string).collect()
}

pub fn session(mode: ExecutionMode, tmp: &TempDir) -> Session {
    Session::new(SessionConfig::new(mode).rooted_at(tmp.path()))
}

/// `output = input * factor` over Int64 columns, counting its computations.
#[derive(Debug)]
pub struct Times {
    name: String,
    columns: Vec<String>,
    input: String,
    factor: i64,
    requires: Vec<AnnotatorRef>,
    calls: AtomicUsize,
}

impl Times {
    pub fn named(name: &str, input: &str, output: &str, factor: i64) -> Self {
        Self {
            name: name.to_string(),
            columns: vec![output.to_string()],
            input: input.to_string(),
            factor,
            requires: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn requiring(mut self, prerequisite: AnnotatorRef) -> Self {
        self.requires.push(prerequisite);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Annotator for Times {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn cache_name(&self) -> &str {
        &self.name
    }

    fn fingerprint(&self) -> String {
        format!("{}*{}", self.input, self.factor)
    }

    fn dependent_annotators(&self) -> Vec<Option<AnnotatorRef>> {
        self.requires.iter().cloned().map(Some).collect()
    }

    fn compute(&self, table: &TableView<'_>) -> Result<Computed, ComputeError> {
        let input = table.require_column(&self.input)?;
        let values = input
            .as_primitive_opt::<Int64Type>()
            .ok_or_else(|| format!("{} is not Int64", self.input))?;
        let out: Int64Array = values.iter().map(|v| v.map(|v| v * self.factor)).collect();
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Computed::Column(Arc::new(out)))
    }

    fn register_qc(&self, ctx: &mut QcContext<'_>) {
        ctx.register(format!("{}_histogram", self.name));
    }
}

/// `Double` from the canonical scenario: cache name `double`, `y = x * 2`.
pub fn double() -> Arc<Times> {
    Arc::new(Times::named("double", "x", "y", 2))
}

/// Constant columns, for shape and conflict checks.
#[derive(Debug)]
pub struct Constant {
    name: String,
    columns: Vec<String>,
    value: i64,
}

impl Constant {
    pub fn new(name: &str, columns: &[&str], value: i64) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            value,
        }
    }
}

impl Annotator for Constant {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn cache_name(&self) -> &str {
        &self.name
    }

    fn fingerprint(&self) -> String {
        self.value.to_string()
    }

    fn compute(&self, table: &TableView<'_>) -> Result<Computed, ComputeError> {
        let rows = table.num_rows();
        let mut frame = Frame::empty(rows);
        for column in &self.columns {
            frame = frame.with_column(column.clone(), ints(&vec![self.value; rows]))?;
        }
        Ok(Computed::Block(frame))
    }
}

/// Always fails.
#[derive(Debug)]
pub struct Failing {
    columns: Vec<String>,
}

impl Failing {
    pub fn new(column: &str) -> Self {
        Self {
            columns: vec![column.to_string()],
        }
    }
}

impl Annotator for Failing {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn compute(&self, _table: &TableView<'_>) -> Result<Computed, ComputeError> {
        Err("boom".into())
    }
}

/// Requires its partner, which requires it back.
#[derive(Debug)]
pub struct Cyclic {
    columns: Vec<String>,
    partner: &'static str,
}

impl Cyclic {
    pub fn new(column: &'static str, partner: &'static str) -> Self {
        Self {
            columns: vec![column.to_string()],
            partner,
        }
    }
}

impl Annotator for Cyclic {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn dependent_annotators(&self) -> Vec<Option<AnnotatorRef>> {
        let me: &'static str = if self.partner == "a" { "b" } else { "a" };
        vec![Some(Arc::new(Cyclic::new(self.partner, me)))]
    }

    fn compute(&self, table: &TableView<'_>) -> Result<Computed, ComputeError> {
        Ok(Computed::Column(ints(&vec![0; table.num_rows()])))
    }
}

/// Filter keeping even `x`.
pub fn evens(table: &TableView<'_>) -> Result<Selection, ComputeError> {
    let x = table.require_column("x")?.as_primitive::<Int64Type>();
    let mask: BooleanArray = x.iter().map(|v| v.map(|v| v % 2 == 0)).collect();
    Ok(Selection::Mask(mask))
}
