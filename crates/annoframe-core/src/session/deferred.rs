//! Deferred mode: record annotators, build nodes later.
use log::debug;

use super::Session;
use crate::{annotator::AnnotatorRef, error::EngineResult, table::TableId};

impl Session {
    /// Record `annotator` (and its prerequisites) on `id` and its children.
    ///
    /// Nothing runs here; the graph builder turns the records into nodes.
    pub(crate) fn register_deferred(
        &mut self,
        id: TableId,
        annotator: &AnnotatorRef,
    ) -> EngineResult<()> {
        if !self.tables[id.0].register(annotator)? {
            return Ok(());
        }
        debug!(
            "recorded annotator {} on {}",
            annotator.cache_name(),
            self.tables[id.0].name
        );
        self.remember(annotator);
        for prerequisite in annotator.dependent_annotators().into_iter().flatten() {
            self.register_deferred(id, &prerequisite)?;
        }
        let children = self.tables[id.0].children.clone();
        for child in children {
            self.register_deferred(child, annotator)?;
        }
        Ok(())
    }
}
