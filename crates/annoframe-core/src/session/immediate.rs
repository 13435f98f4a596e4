//! Immediate mode: load and compute on the calling thread.
use log::{debug, info};
use snafu::prelude::*;

use super::Session;
use crate::{
    annotator::{self, AnnotatorRef, TableView},
    combine,
    error::{ComputationSnafu, EngineResult, NotLoadedSnafu},
    table::TableId,
};

impl Session {
    /// Load `id` (and the table it derives from) unless already loaded.
    pub(crate) fn load_now(&mut self, id: TableId) -> EngineResult<()> {
        if self.tables[id.0].is_loaded() {
            return Ok(());
        }
        let source = self.tables[id.0].source.clone();
        if let Some(upstream) = source.upstream_table() {
            self.load_now(upstream)?;
        }
        let frame = {
            let upstream = source
                .upstream_table()
                .and_then(|up| self.tables[up.0].as_upstream());
            source.produce(&self.tables[id.0].name, upstream)?
        };
        let table = &mut self.tables[id.0];
        info!(
            "loaded table {} ({} rows, {} columns)",
            table.name,
            frame.num_rows(),
            frame.num_columns()
        );
        table.set_loaded(frame);
        Ok(())
    }

    /// Register, compute and propagate `annotator` on `id`.
    ///
    /// Prerequisites are attached first; the annotator then reaches every
    /// existing child of `id`.
    pub(crate) fn attach_now(&mut self, id: TableId, annotator: &AnnotatorRef) -> EngineResult<()> {
        if !self.tables[id.0].register(annotator)? {
            debug!(
                "annotator {} already present on {}",
                annotator.cache_name(),
                self.tables[id.0].name
            );
            return Ok(());
        }
        self.remember(annotator);
        for prerequisite in annotator.dependent_annotators().into_iter().flatten() {
            self.attach_now(id, &prerequisite)?;
        }
        self.materialize(id, annotator)?;
        self.register_qc(id, annotator);
        let children = self.tables[id.0].children.clone();
        for child in children {
            self.attach_now(child, annotator)?;
        }
        Ok(())
    }

    /// Compute (or forward from the parent) and merge one annotator's block.
    fn materialize(&mut self, id: TableId, annotator: &AnnotatorRef) -> EngineResult<()> {
        self.load_now(id)?;
        let table = &self.tables[id.0];
        let cache_name = annotator.cache_name();
        let store = table
            .store
            .as_ref()
            .context(NotLoadedSnafu { table: &table.name })?;

        let parent_store = table
            .parent
            .map(|parent| &self.tables[parent.0])
            .filter(|parent| parent.has_annotator(cache_name))
            .and_then(|parent| parent.store.as_ref())
            .filter(|frame| annotator.columns().iter().all(|c| frame.contains_column(c)));

        let block = match parent_store {
            Some(parent_store) => {
                debug!("forwarding {cache_name} from parent into {}", table.name);
                combine::forward(
                    &table.name,
                    cache_name,
                    parent_store,
                    annotator.columns(),
                    store.index(),
                )?
            }
            None => {
                debug!("computing {cache_name} on {}", table.name);
                let computed = annotator
                    .compute(&TableView::new(&table.name, store))
                    .context(ComputationSnafu {
                        table: &table.name,
                        annotator: cache_name,
                    })?;
                annotator::into_block(&table.name, annotator.as_ref(), computed)?
            }
        };
        let merged = combine::combine(&table.name, cache_name, store, block)?;
        info!("annotated {} with {cache_name}", table.name);
        self.tables[id.0].store = Some(merged);
        Ok(())
    }
}
