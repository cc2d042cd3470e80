mod backend;
mod backends;
mod cli;
mod config;
mod error;
mod index;
mod metadata;
mod processor;
mod storage;
mod walker;

use crate::backend::Backend;
use crate::cli::Cli;
use crate::config::AppConfig;
use crate::index::Index;
use crate::processor::{Processor, RunSettings};
use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const INDEX_FILE_NAME: &str = "descriptions.json";

const EXIT_FAILURES: u8 = 1;
const EXIT_USAGE: u8 = 2;

/// Runs one pass and returns the process exit status: 0 when every image was
/// handled, 1 on per-image errors or when nothing was found.
fn run(cli: Cli) -> Result<u8> {
    let config = AppConfig::new(&cli).context("failed to load configuration")?;

    // Tests run several passes in one process.
    let _ = env_logger::Builder::new()
        .filter_level(config.log_filter())
        .try_init();

    info!("Starting describe-images");

    let discovery = walker::collect_images(&cli.path, config.recursive)?;
    if discovery.images.is_empty() {
        eprintln!("No images found.");
        return Ok(EXIT_FAILURES);
    }

    let backend = Backend::from_config(&config)?;

    let index_path = index_path(&config, &discovery.base_dir);
    let mut index = Index::open(index_path)?;
    info!("Found {} existing records in the index.", index.len());

    let settings = RunSettings {
        mode: config.store,
        force: config.force,
        prompt: config.prompt.clone(),
    };
    let stdout = std::io::stdout();
    let stderr = std::io::stderr();
    let summary = Processor::new(&settings, &backend, &mut index).run(
        &discovery.images,
        &discovery.base_dir,
        &mut stdout.lock(),
        &mut stderr.lock(),
    );

    info!("describe-images finished");
    Ok(if summary.had_errors() { EXIT_FAILURES } else { 0 })
}

/// Explicit `--index` wins; otherwise JSON-capable modes keep the index next
/// to the images.
fn index_path(config: &AppConfig, base_dir: &Path) -> Option<PathBuf> {
    match &config.index {
        Some(path) => Some(path.clone()),
        None if config.store.uses_index() => Some(base_dir.join(INDEX_FILE_NAME)),
        None => None,
    }
}

/// Configuration and input errors abort the run with status 2.
fn exit_status(result: Result<u8>) -> u8 {
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            EXIT_USAGE
        }
    }
}

fn main() -> ExitCode {
    ExitCode::from(exit_status(run(Cli::parse())))
}
