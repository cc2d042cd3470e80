use crate::backend::Describer;
use crate::error::ProcessError;
use crate::index::{relative_key, utc_now_iso, DescriptionRecord, Index};
use crate::metadata;
use crate::storage::{should_skip, FormatClass, StorageMode};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Per-run settings the loop needs beyond the backend itself.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub mode: StorageMode,
    pub force: bool,
    pub prompt: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub described: usize,
    pub skipped: usize,
    pub failed: usize,
    pub backend_calls: usize,
    pub index_flush_failed: bool,
}

impl RunSummary {
    pub fn had_errors(&self) -> bool {
        self.failed > 0 || self.index_flush_failed
    }
}

enum Outcome {
    Skipped,
    Described,
}

/// Describes images one at a time and commits captions to the stores.
pub struct Processor<'a> {
    settings: &'a RunSettings,
    backend: &'a dyn Describer,
    index: &'a mut Index,
}

impl<'a> Processor<'a> {
    pub fn new(settings: &'a RunSettings, backend: &'a dyn Describer, index: &'a mut Index) -> Self {
        Self {
            settings,
            backend,
            index,
        }
    }

    /// Processes `images` in order, printing one status line each, then
    /// flushes the index once. Failures never stop the loop.
    pub fn run(
        &mut self,
        images: &[PathBuf],
        base_dir: &Path,
        out: &mut impl Write,
        err: &mut impl Write,
    ) -> RunSummary {
        log::info!(
            "Processing {} images with {} (store: {})",
            images.len(),
            self.backend.kind().as_str(),
            self.settings.mode.as_str()
        );
        let mut summary = RunSummary::default();

        for image in images {
            let key = relative_key(image, base_dir);
            log::debug!("Processing image started for: {}", key);
            match self.process_image(image, &key, &mut summary) {
                Ok(Outcome::Skipped) => {
                    summary.skipped += 1;
                    report(out, format_args!("skip {key}"));
                }
                Ok(Outcome::Described) => {
                    summary.described += 1;
                    report(out, format_args!("ok {key}"));
                }
                Err(e) => {
                    summary.failed += 1;
                    log::debug!("Failed to process image {}: {:?}", key, e);
                    report(err, format_args!("error {key}: {e}"));
                }
            }
        }

        if let Err(e) = self.index.save() {
            summary.index_flush_failed = true;
            report(err, format_args!("error saving index: {e}"));
        }

        log::info!(
            "Finished: {} described, {} skipped, {} failed ({} backend calls).",
            summary.described,
            summary.skipped,
            summary.failed,
            summary.backend_calls
        );
        summary
    }

    fn process_image(
        &mut self,
        image: &Path,
        key: &str,
        summary: &mut RunSummary,
    ) -> Result<Outcome, ProcessError> {
        let mode = self.settings.mode;
        let format = FormatClass::of(image);

        let index = &*self.index;
        if should_skip(
            mode,
            self.settings.force,
            format,
            || index.has(key),
            || metadata::has_description(image),
        ) {
            log::trace!("{} already described; skipping.", key);
            return Ok(Outcome::Skipped);
        }

        summary.backend_calls += 1;
        let description = self.backend.describe(image, &self.settings.prompt)?;
        log::trace!("Caption for {}: {:?}", key, description);

        let (stored_meta, meta_error) = if mode.attempts_metadata() {
            match metadata::write_description(image, &description) {
                Ok(stored) => (stored, None),
                Err(e) => (false, Some(e)),
            }
        } else {
            (false, None)
        };

        if mode == StorageMode::Metadata && !stored_meta && meta_error.is_none() {
            return Err(ProcessError::MetadataUnsupported);
        }

        if mode.writes_index(stored_meta) {
            self.index.set(
                key,
                DescriptionRecord {
                    backend: self.backend.kind(),
                    description,
                    model: self.backend.model_name().map(str::to_string),
                    prompt: self.settings.prompt.clone(),
                    updated_at: utc_now_iso(),
                },
            );
        }

        match meta_error {
            Some(e) => Err(e.into()),
            None => Ok(Outcome::Described),
        }
    }
}

fn report(w: &mut impl Write, line: fmt::Arguments<'_>) {
    if let Err(e) = writeln!(w, "{line}") {
        log::warn!("Could not write status line: {}", e);
    }
}
