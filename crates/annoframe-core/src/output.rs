//! File outputs: tables, plots and arbitrary generated files.
//!
//! Tables are written as tab-separated text with a header row and without
//! the row index. Float columns are rendered with a [`FloatFormat`] before
//! they reach the CSV writer so the on-disk text is fully determined by the
//! format; everything else uses Arrow's own rendering.
//!
//! There is no spreadsheet engine in this crate. A `.xls`/`.xlsx` target is
//! therefore written as tab-separated text under the requested name, and the
//! fallback is logged.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::array::{Array, ArrayRef, AsArray, StringArray};
use arrow::compute::cast;
use arrow::csv::WriterBuilder;
use arrow::datatypes::{DataType, Float64Type};
use arrow::error::ArrowError;
use log::warn;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    annotator::AnnotatorRef,
    error::ComputeError,
    frame::{Frame, FrameError},
};

/// Errors from writing output files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum OutputError {
    /// A directory or file could not be created.
    #[snafu(display("I/O error on {}: {source}", path.display()))]
    Io {
        /// Path being written.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The CSV writer rejected the data.
    #[snafu(display("Failed to encode {}: {source}", path.display()))]
    Encode {
        /// Path being written.
        path: PathBuf,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// The frame could not be prepared for writing.
    #[snafu(display("Failed to prepare {}: {source}", path.display()))]
    Prepare {
        /// Path being written.
        path: PathBuf,
        /// Underlying column store error.
        source: FrameError,
    },

    /// A user callback (mangler, writer, plot or calc function) failed.
    #[snafu(display("Callback for {} failed: {source}", path.display()))]
    Callback {
        /// Path being written.
        path: PathBuf,
        /// Error raised by the callback.
        source: ComputeError,
    },

    /// The writer returned without creating the file.
    #[snafu(display("{} was not created", path.display()))]
    Missing {
        /// Expected path.
        path: PathBuf,
    },

    /// The writer created an empty file and empty output was not allowed.
    #[snafu(display("{} is empty", path.display()))]
    Empty {
        /// Offending path.
        path: PathBuf,
    },
}

/// How float columns are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloatFormat {
    /// Shortest text that parses back to the same value.
    Shortest,
    /// Fixed number of decimals.
    Fixed(usize),
    /// `%g`-style: at most this many significant digits, trailing zeros
    /// removed, exponent notation for very large or small magnitudes.
    Significant(usize),
}

impl Default for FloatFormat {
    fn default() -> Self {
        FloatFormat::Significant(6)
    }
}

impl FloatFormat {
    /// Render `value`.
    pub fn format(&self, value: f64) -> String {
        if !value.is_finite() {
            return value.to_string();
        }
        match *self {
            FloatFormat::Shortest => value.to_string(),
            FloatFormat::Fixed(decimals) => format!("{value:.decimals$}"),
            FloatFormat::Significant(digits) => significant(value, digits.max(1)),
        }
    }
}

fn significant(value: f64, digits: usize) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let sci = format!("{:.*e}", digits - 1, value);
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let exp: i32 = exp.parse().unwrap_or(0);
    if exp < -4 || exp >= digits as i32 {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exp.abs())
    } else {
        let decimals = usize::try_from(digits as i32 - 1 - exp).unwrap_or(0);
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Transforms a table's columns just before writing.
pub type Mangler = Arc<dyn Fn(Frame) -> Result<Frame, ComputeError> + Send + Sync>;

/// Pre-transforms a table's columns before plotting.
pub type CalcFn = Arc<dyn Fn(&Frame) -> Result<Frame, ComputeError> + Send + Sync>;

/// Something that can save itself to a path, such as a rendered chart.
pub trait Figure {
    /// Write the figure to `path`.
    fn save(&self, path: &Path) -> Result<(), ComputeError>;
}

/// Builds a figure from a table's (possibly transformed) columns.
pub type PlotFn = Arc<dyn Fn(&Frame) -> Result<Box<dyn Figure>, ComputeError> + Send + Sync>;

/// Writes an arbitrary file at the given path.
pub type FileWriterFn = Arc<dyn Fn(&Path) -> Result<(), ComputeError> + Send + Sync>;

/// Options for [`crate::Session::write`].
#[derive(Clone, Default)]
pub struct WriteOptions {
    /// Applied to the columns before writing.
    pub mangler: Option<Mangler>,
    /// Overrides the session's float format.
    pub float_format: Option<FloatFormat>,
}

impl std::fmt::Debug for WriteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteOptions")
            .field("mangler", &self.mangler.is_some())
            .field("float_format", &self.float_format)
            .finish()
    }
}

/// Options for [`crate::Session::plot`].
#[derive(Clone, Default)]
pub struct PlotOptions {
    /// Applied to the columns before plotting.
    pub calc: Option<CalcFn>,
    /// Annotators the plot needs. When set, only these are required before
    /// plotting; otherwise every annotator of the table is.
    pub annotators: Option<Vec<AnnotatorRef>>,
}

impl std::fmt::Debug for PlotOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlotOptions")
            .field("calc", &self.calc.is_some())
            .field("annotators", &self.annotators)
            .finish()
    }
}

/// Returns true for paths that ask for spreadsheet output.
pub fn is_spreadsheet(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("xls") || e.eq_ignore_ascii_case("xlsx"))
}

fn ensure_parent(path: &Path) -> Result<(), OutputError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
    }
    Ok(())
}

fn render_floats(frame: &Frame, format: FloatFormat, path: &Path) -> Result<Frame, OutputError> {
    let mut out = Frame::empty(frame.num_rows());
    for (name, array) in frame.iter() {
        let rendered: ArrayRef = if array.data_type().is_floating() {
            let as_float = cast(array.as_ref(), &DataType::Float64).context(EncodeSnafu { path })?;
            let strings: StringArray = as_float
                .as_primitive::<Float64Type>()
                .iter()
                .map(|v| v.map(|v| format.format(v)))
                .collect();
            Arc::new(strings)
        } else {
            Arc::clone(array)
        };
        out = out
            .with_column(name, rendered)
            .context(PrepareSnafu { path })?;
    }
    Ok(out)
}

/// Write `frame` as tab-separated text with a header and no index.
pub(crate) fn write_table(
    frame: &Frame,
    path: &Path,
    format: FloatFormat,
) -> Result<(), OutputError> {
    ensure_parent(path)?;
    if is_spreadsheet(path) {
        warn!(
            "No spreadsheet engine available for {}; writing tab-separated text instead",
            path.display()
        );
    }
    let batch = render_floats(frame, format, path)?
        .to_record_batch()
        .context(PrepareSnafu { path })?;
    let file = fs::File::create(path).context(IoSnafu { path })?;
    let mut writer = WriterBuilder::new()
        .with_header(true)
        .with_delimiter(b'\t')
        .build(file);
    writer.write(&batch).context(EncodeSnafu { path })?;
    Ok(())
}

/// Check that a writer produced `path` (non-empty unless `empty_ok`).
pub(crate) fn verify_output(path: &Path, empty_ok: bool) -> Result<(), OutputError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return MissingSnafu { path }.fail();
        }
        Err(source) => return Err(source).context(IoSnafu { path }),
    };
    ensure!(empty_ok || meta.len() > 0, EmptySnafu { path });
    Ok(())
}

/// Run a file writer and verify its result.
pub(crate) fn generate(
    path: &Path,
    writer: &FileWriterFn,
    empty_ok: bool,
) -> Result<(), OutputError> {
    ensure_parent(path)?;
    writer(path).context(CallbackSnafu { path })?;
    verify_output(path, empty_ok)
}

/// Apply the mangler (if any) and write.
pub(crate) fn write_with(
    frame: &Frame,
    path: &Path,
    mangler: Option<&Mangler>,
    format: FloatFormat,
) -> Result<(), OutputError> {
    let frame = match mangler {
        Some(mangler) => mangler(frame.clone()).context(CallbackSnafu { path })?,
        None => frame.clone(),
    };
    write_table(&frame, path, format)
}

/// Apply the calc function (if any), build the figure and save it.
pub(crate) fn plot_with(
    frame: &Frame,
    path: &Path,
    plot: &PlotFn,
    calc: Option<&CalcFn>,
) -> Result<(), OutputError> {
    ensure_parent(path)?;
    let prepared;
    let input = match calc {
        Some(calc) => {
            prepared = calc(frame).context(CallbackSnafu { path })?;
            &prepared
        }
        None => frame,
    };
    let figure = plot(input).context(CallbackSnafu { path })?;
    figure.save(path).context(CallbackSnafu { path })?;
    verify_output(path, false)
}

/// What a deferred file node does once its dependencies are done.
#[derive(Clone)]
pub(crate) enum FileAction {
    Table {
        mangler: Option<Mangler>,
        float_format: FloatFormat,
    },
    Plot {
        plot: PlotFn,
        calc: Option<CalcFn>,
    },
    Generate {
        writer: FileWriterFn,
        empty_ok: bool,
    },
}

impl FileAction {
    /// Produce `path` from the table's current columns.
    pub(crate) fn run(&self, frame: &Frame, path: &Path) -> Result<(), OutputError> {
        match self {
            FileAction::Table {
                mangler,
                float_format,
            } => write_with(frame, path, mangler.as_ref(), *float_format),
            FileAction::Plot { plot, calc } => plot_with(frame, path, plot, calc.as_ref()),
            FileAction::Generate { writer, empty_ok } => generate(path, writer, *empty_ok),
        }
    }

    /// Returns true if `other` would write the same file the same way.
    pub(crate) fn same_as(&self, other: &FileAction) -> bool {
        match (self, other) {
            (
                FileAction::Table {
                    mangler: a,
                    float_format: fa,
                },
                FileAction::Table {
                    mangler: b,
                    float_format: fb,
                },
            ) => {
                fa == fb
                    && match (a, b) {
                        (None, None) => true,
                        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                        _ => false,
                    }
            }
            (FileAction::Plot { plot: a, .. }, FileAction::Plot { plot: b, .. }) => {
                Arc::ptr_eq(a, b)
            }
            (FileAction::Generate { writer: a, .. }, FileAction::Generate { writer: b, .. }) => {
                Arc::ptr_eq(a, b)
            }
            _ => false,
        }
    }

    /// Kind tag for node labels and cache keys.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            FileAction::Table { .. } => "write",
            FileAction::Plot { .. } => "plot",
            FileAction::Generate { .. } => "generate",
        }
    }
}

impl std::fmt::Debug for FileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}
