//! File outputs: tables, plots and arbitrary generated files.
//!
//! In immediate mode the file is produced before the call returns. In
//! deferred mode a file spec is recorded and becomes a graph node; asking for
//! the same path again with the same writer returns the same handle.
use std::path::PathBuf;

use log::info;
use snafu::prelude::*;

use super::{FileSpec, Session};
use crate::{
    config::ExecutionMode,
    error::{ConflictingOutputSnafu, EngineResult, NotLoadedSnafu, OutputSnafu},
    handle::{FileOutput, Handle},
    output::{FileAction, FileWriterFn, PlotFn, PlotOptions, WriteOptions},
    table::TableId,
};

impl Session {
    /// Write the table's current columns as tab-separated text.
    ///
    /// `path` defaults to `<table result dir>/<name>.tsv`; relative paths are
    /// resolved under the table's result dir. In deferred mode the write runs
    /// after every annotator of the table.
    pub fn write(
        &mut self,
        id: TableId,
        path: Option<PathBuf>,
        options: WriteOptions,
    ) -> EngineResult<FileOutput> {
        let path = self.output_path(id, path)?;
        let action = FileAction::Table {
            mangler: options.mangler,
            float_format: options.float_format.unwrap_or(self.config.float_format),
        };
        self.transaction(|s| s.emit(id, path, action, vec![Handle::Annotate(id)]))
    }

    /// Render a plot of the table to `path`.
    ///
    /// When `options.annotators` is set those annotators are attached first
    /// and, in deferred mode, the plot waits only for them.
    pub fn plot(
        &mut self,
        id: TableId,
        path: PathBuf,
        plot: PlotFn,
        options: PlotOptions,
    ) -> EngineResult<FileOutput> {
        let path = self.output_path(id, Some(path))?;
        let action = FileAction::Plot {
            plot,
            calc: options.calc,
        };
        self.transaction(|s| {
            let dependencies = match options.annotators {
                Some(annotators) => {
                    let mut dependencies = vec![Handle::Load(id)];
                    for annotator in &annotators {
                        let handle = s.attach_inner(id, annotator)?;
                        if !handle.is_done() {
                            dependencies.push(handle);
                        }
                    }
                    dependencies
                }
                None => vec![Handle::Annotate(id)],
            };
            s.emit(id, path, action, dependencies)
        })
    }

    /// Produce `path` with a custom writer once `dependencies` are done.
    ///
    /// The file must exist afterwards and be non-empty unless `empty_ok`.
    pub fn generate_file(
        &mut self,
        id: TableId,
        path: PathBuf,
        writer: FileWriterFn,
        dependencies: Vec<Handle>,
        empty_ok: bool,
    ) -> EngineResult<FileOutput> {
        let path = self.output_path(id, Some(path))?;
        let action = FileAction::Generate { writer, empty_ok };
        let mut all = vec![Handle::Load(id)];
        all.extend(dependencies.into_iter().filter(|h| !h.is_done()));
        self.transaction(|s| s.emit(id, path, action, all))
    }

    fn output_path(&self, id: TableId, path: Option<PathBuf>) -> EngineResult<PathBuf> {
        let table = self.table(id)?;
        Ok(match path {
            None => table.table_file_name(),
            Some(path) if path.is_absolute() => path,
            Some(path) => table.result_dir().join(path),
        })
    }

    fn emit(
        &mut self,
        id: TableId,
        path: PathBuf,
        action: FileAction,
        dependencies: Vec<Handle>,
    ) -> EngineResult<FileOutput> {
        let table = &self.tables[id.0];
        match self.mode() {
            ExecutionMode::Immediate => {
                let frame = table
                    .frame()
                    .context(NotLoadedSnafu { table: &table.name })?;
                action
                    .run(frame, &path)
                    .context(OutputSnafu { table: &table.name })?;
                info!("{} {} -> {}", action.kind(), table.name, path.display());
                Ok(FileOutput {
                    handle: Handle::Done,
                    path,
                })
            }
            ExecutionMode::Deferred => {
                if let Some(existing) = self.files.iter().find(|f| f.path == path) {
                    ensure!(
                        existing.table == id && existing.action.same_as(&action),
                        ConflictingOutputSnafu {
                            table: &table.name,
                            path,
                        }
                    );
                    return Ok(FileOutput {
                        handle: Handle::File(path.clone()),
                        path,
                    });
                }
                self.files.push(FileSpec {
                    table: id,
                    path: path.clone(),
                    action,
                    dependencies,
                });
                Ok(FileOutput {
                    handle: Handle::File(path.clone()),
                    path,
                })
            }
        }
    }
}
