//! Merging a freshly computed block into a table's column store.
//!
//! This is the only place annotator columns enter a store. The merge is
//! all-or-nothing: the store is returned unchanged on any error because the
//! new frame is built before anything is swapped in.
use snafu::prelude::*;

use crate::{
    error::{ColumnCollisionSnafu, EngineResult, FrameSnafu, IndexMismatchSnafu},
    frame::{Frame, FrameError, RowIndex},
};

/// Align `block` onto the rows of `store`.
///
/// A block with the positional index is taken to be in the store's row
/// order. A block with explicit labels is looked up label by label.
pub(crate) fn align(
    table: &str,
    annotator: &str,
    store: &Frame,
    block: Frame,
) -> EngineResult<Frame> {
    ensure!(
        block.num_rows() == store.num_rows(),
        IndexMismatchSnafu {
            table,
            annotator,
            detail: format!(
                "block has {} rows, table has {}",
                block.num_rows(),
                store.num_rows()
            ),
        }
    );
    if block.index().is_positional() {
        return block
            .with_index(store.index().clone())
            .context(FrameSnafu { table });
    }
    if block.index() == store.index() {
        return Ok(block);
    }
    match block.reindex(&store.index().to_labels()) {
        Ok(aligned) => Ok(aligned),
        Err(FrameError::UnknownRowLabel { label }) => IndexMismatchSnafu {
            table,
            annotator,
            detail: format!("row label {label} of the table is missing from the block"),
        }
        .fail(),
        Err(source) => Err(source).context(FrameSnafu { table }),
    }
}

/// Merge `block` into `store`, returning the grown store.
pub(crate) fn combine(
    table: &str,
    annotator: &str,
    store: &Frame,
    block: Frame,
) -> EngineResult<Frame> {
    let block = align(table, annotator, store, block)?;
    let collisions: Vec<String> = block
        .column_names()
        .filter(|name| store.contains_column(name))
        .map(str::to_string)
        .collect();
    ensure!(
        collisions.is_empty(),
        ColumnCollisionSnafu {
            table,
            annotator,
            columns: collisions,
        }
    );
    store
        .clone()
        .append_columns(block)
        .context(FrameSnafu { table })
}

/// The `columns` of a parent's store, re-indexed onto a child's rows.
pub(crate) fn forward(
    table: &str,
    annotator: &str,
    parent_store: &Frame,
    columns: &[String],
    child_index: &RowIndex,
) -> EngineResult<Frame> {
    let selected = parent_store.select(columns).context(FrameSnafu { table })?;
    match selected.reindex(&child_index.to_labels()) {
        Ok(block) => Ok(block),
        Err(FrameError::UnknownRowLabel { label }) => IndexMismatchSnafu {
            table,
            annotator,
            detail: format!("row label {label} is not present in the parent table"),
        }
        .fail(),
        Err(source) => Err(source).context(FrameSnafu { table }),
    }
}
