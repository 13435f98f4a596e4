//! Content-addressed on-disk cache for deferred execution.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<table name>/<entry>.arrow   Arrow IPC file with the cached columns
//! <root>/<table name>/<entry>.json    sidecar: key, shape, creation time
//! ```
//!
//! `<entry>` is `__load` for a table's load step and the annotator cache name
//! otherwise. Row labels are stored as an extra `__row_label` column so a
//! cached block re-aligns exactly like a fresh one.
//!
//! A cache hit requires the sidecar key to equal the requested
//! [`CacheKey`]. Keys are BLAKE3 digests over everything that determines the
//! entry's content, chained through the keys of upstream nodes, so any
//! change upstream produces a different key and the old entry is ignored.
//!
//! Both files are written with write-then-rename; the sidecar is written
//! last, so a crash between the two leaves an entry that reads as a miss.
use std::{
    fmt,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::array::{Array, ArrayRef, AsArray, RecordBatch, UInt64Array};
use arrow::datatypes::UInt64Type;
use arrow::error::ArrowError;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::frame::{Frame, FrameError, RowIndex};

/// Name of the hidden column holding row labels in cache files.
pub const ROW_LABEL_COLUMN: &str = "__row_label";

/// Entry name used for a table's load step.
pub const LOAD_ENTRY: &str = "__load";

const FORMAT_VERSION: u32 = 1;

/// Errors from the cache store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CacheError {
    /// Filesystem failure.
    #[snafu(display("Cache I/O error on {}: {source}", path.display()))]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Arrow IPC encoding or decoding failed.
    #[snafu(display("Cache IPC error on {}: {source}", path.display()))]
    Ipc {
        /// Path involved.
        path: PathBuf,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// The sidecar could not be encoded or decoded.
    #[snafu(display("Cache metadata error on {}: {source}", path.display()))]
    Meta {
        /// Path involved.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// The entry does not have the expected shape.
    #[snafu(display("Corrupt cache entry {}: {detail}", path.display()))]
    Corrupt {
        /// Path involved.
        path: PathBuf,
        /// What was wrong.
        detail: String,
    },

    /// Rebuilding the cached frame failed.
    #[snafu(display("Cache entry {} does not form a valid frame: {source}", path.display()))]
    Frame {
        /// Path involved.
        path: PathBuf,
        /// Underlying column store error.
        source: FrameError,
    },
}

/// Digest identifying the content of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental builder for a [`CacheKey`].
///
/// Every field is length-prefixed so adjacent fields cannot run together.
pub(crate) struct KeyBuilder {
    hasher: blake3::Hasher,
}

impl KeyBuilder {
    /// Start a key in the given domain.
    pub(crate) fn new(domain: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"annoframe-cache-key-v1");
        hasher.update(b"\0");
        hasher.update(domain.as_bytes());
        hasher.update(b"\0");
        Self { hasher }
    }

    /// Add a field.
    pub(crate) fn field(mut self, bytes: impl AsRef<[u8]>) -> Self {
        let bytes = bytes.as_ref();
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    /// Add an upstream key.
    pub(crate) fn upstream(self, key: &CacheKey) -> Self {
        self.field(key.as_str())
    }

    /// Finish.
    pub(crate) fn finish(self) -> CacheKey {
        CacheKey(self.hasher.finalize().to_hex().to_string())
    }
}

/// Digest of a frame's content, for use as a load-source fingerprint.
pub fn frame_digest(frame: &Frame) -> Result<String, CacheError> {
    let path = PathBuf::from("<memory>");
    let batch = encode(frame, &path)?;
    let mut bytes = Vec::new();
    {
        let mut writer = FileWriter::try_new(&mut bytes, &batch.schema()).context(IpcSnafu {
            path: path.clone(),
        })?;
        writer.write(&batch).context(IpcSnafu { path: path.clone() })?;
        writer.finish().context(IpcSnafu { path: path.clone() })?;
    }
    let mut h = blake3::Hasher::new();
    h.update(b"frame-digest-v1");
    h.update(b"\0");
    h.update(&bytes);
    Ok(h.finalize().to_hex().to_string())
}

/// Sidecar describing a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Sidecar format version.
    pub format_version: u32,
    /// Key the entry was written under.
    pub key: CacheKey,
    /// Table name.
    pub table: String,
    /// Entry name.
    pub entry: String,
    /// Number of rows.
    pub rows: usize,
    /// Cached column names (without the label column).
    pub columns: Vec<String>,
    /// Whether the frame had the positional index.
    pub positional: bool,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

/// Cache store rooted at a directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Store rooted at `root` (created lazily).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a table's entries.
    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    fn data_path(&self, table: &str, entry: &str) -> PathBuf {
        self.table_dir(table).join(format!("{entry}.arrow"))
    }

    fn meta_path(&self, table: &str, entry: &str) -> PathBuf {
        self.table_dir(table).join(format!("{entry}.json"))
    }

    /// Sidecar of an entry, if present.
    pub fn meta(&self, table: &str, entry: &str) -> Result<Option<EntryMeta>, CacheError> {
        let path = self.meta_path(table, entry);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(source).context(IoSnafu { path }),
        };
        let meta = serde_json::from_str(&text).context(MetaSnafu { path })?;
        Ok(Some(meta))
    }

    /// Cached frame for `key`, or `None` on a miss.
    pub fn get(
        &self,
        table: &str,
        entry: &str,
        key: &CacheKey,
    ) -> Result<Option<Frame>, CacheError> {
        let Some(meta) = self.meta(table, entry)? else {
            debug!("cache miss for {table}/{entry}: no entry");
            return Ok(None);
        };
        if meta.format_version != FORMAT_VERSION || &meta.key != key {
            debug!("cache miss for {table}/{entry}: key changed");
            return Ok(None);
        }
        let path = self.data_path(table, entry);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(source).context(IoSnafu { path }),
        };
        let reader = FileReader::try_new(file, None).context(IpcSnafu { path: path.clone() })?;
        let batches = reader
            .collect::<Result<Vec<RecordBatch>, _>>()
            .context(IpcSnafu { path: path.clone() })?;
        let frame = decode(&batches, &meta, &path)?;
        debug!("cache hit for {table}/{entry}");
        Ok(Some(frame))
    }

    /// Store `frame` under `key`, replacing any previous entry.
    pub fn set(
        &self,
        table: &str,
        entry: &str,
        key: &CacheKey,
        frame: &Frame,
    ) -> Result<(), CacheError> {
        let data_path = self.data_path(table, entry);
        let batch = encode(frame, &data_path)?;
        let mut bytes = Vec::new();
        {
            let mut writer = FileWriter::try_new(&mut bytes, &batch.schema()).context(IpcSnafu {
                path: data_path.clone(),
            })?;
            writer.write(&batch).context(IpcSnafu {
                path: data_path.clone(),
            })?;
            writer.finish().context(IpcSnafu {
                path: data_path.clone(),
            })?;
        }
        write_atomic(&data_path, &bytes)?;

        let meta = EntryMeta {
            format_version: FORMAT_VERSION,
            key: key.clone(),
            table: table.to_string(),
            entry: entry.to_string(),
            rows: frame.num_rows(),
            columns: frame.column_names().map(str::to_string).collect(),
            positional: frame.index().is_positional(),
            created_at: Utc::now(),
        };
        let meta_path = self.meta_path(table, entry);
        let json = serde_json::to_vec_pretty(&meta).context(MetaSnafu {
            path: meta_path.clone(),
        })?;
        write_atomic(&meta_path, &json)?;
        debug!("cached {table}/{entry} ({} rows)", frame.num_rows());
        Ok(())
    }

    /// Remove an entry. Returns true if anything was removed.
    pub fn invalidate(&self, table: &str, entry: &str) -> Result<bool, CacheError> {
        let mut removed = false;
        for path in [self.meta_path(table, entry), self.data_path(table, entry)] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(source).context(IoSnafu { path }),
            }
        }
        Ok(removed)
    }

    /// Remove every entry of a table.
    pub fn invalidate_table(&self, table: &str) -> Result<(), CacheError> {
        let dir = self.table_dir(table);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(source).context(IoSnafu { path: dir }),
        }
    }
}

fn encode(frame: &Frame, path: &Path) -> Result<RecordBatch, CacheError> {
    let labels: ArrayRef = Arc::new(UInt64Array::from(frame.index().to_labels()));
    Frame::empty(frame.num_rows())
        .with_column(ROW_LABEL_COLUMN, labels)
        .and_then(|f| f.append_columns(frame.clone()))
        .and_then(|f| f.to_record_batch())
        .context(FrameSnafu { path })
}

fn decode(batches: &[RecordBatch], meta: &EntryMeta, path: &Path) -> Result<Frame, CacheError> {
    let [batch] = batches else {
        return CorruptSnafu {
            path,
            detail: format!("expected one record batch, found {}", batches.len()),
        }
        .fail();
    };
    ensure!(
        batch.num_rows() == meta.rows,
        CorruptSnafu {
            path,
            detail: format!("sidecar says {} rows, file has {}", meta.rows, batch.num_rows()),
        }
    );
    let stored = Frame::from_record_batch(batch).context(FrameSnafu { path })?;
    let labels = stored
        .column(ROW_LABEL_COLUMN)
        .filter(|a| a.data_type() == &arrow::datatypes::DataType::UInt64 && a.null_count() == 0)
        .with_context(|| CorruptSnafu {
            path,
            detail: format!("missing {ROW_LABEL_COLUMN} column"),
        })?
        .as_primitive::<UInt64Type>()
        .values()
        .to_vec();
    let index = if meta.positional {
        RowIndex::Range(labels.len())
    } else {
        RowIndex::from_labels(labels)
    };
    stored
        .select(meta.columns.as_slice())
        .and_then(|f| f.with_index(index))
        .context(FrameSnafu { path })
}

/// Guard that removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Write `contents` to `path` via a synced temporary file and a rename.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    let mut guard = TempFileGuard::new(tmp_path.clone());
    {
        let mut file = fs::File::create(&tmp_path).context(IoSnafu {
            path: tmp_path.clone(),
        })?;
        file.write_all(contents).context(IoSnafu {
            path: tmp_path.clone(),
        })?;
        file.sync_all().context(IoSnafu {
            path: tmp_path.clone(),
        })?;
    }
    fs::rename(&tmp_path, path).context(IoSnafu { path })?;
    guard.disarm();
    Ok(())
}
