use crate::backend::BackendKind;
use crate::error::{AppError, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Caption stored per image in the JSON sidecar.
///
/// Fields are declared in alphabetical order so the serialized document has
/// sorted keys at every level.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DescriptionRecord {
    pub backend: BackendKind,
    pub description: String,
    pub model: Option<String>,
    pub prompt: String,
    pub updated_at: String,
}

/// Sidecar mapping relative image paths to description records.
///
/// `Disabled` is the sink used when no index file is configured.
#[derive(Debug)]
pub enum Index {
    Disabled,
    File(FileIndex),
}

#[derive(Debug)]
pub struct FileIndex {
    path: PathBuf,
    records: BTreeMap<String, DescriptionRecord>,
    changed: bool,
}

impl Index {
    /// Loads the index at `path`. A missing file yields an empty index.
    pub fn open(path: Option<PathBuf>) -> Result<Self, AppError> {
        let Some(path) = path else {
            log::debug!("No index file configured; JSON storage disabled.");
            return Ok(Index::Disabled);
        };

        let records: BTreeMap<String, DescriptionRecord> = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| {
                AppError::IndexLoad {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("Index file {:?} does not exist yet.", path);
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        log::info!("Loaded {} records from {:?}", records.len(), path);

        Ok(Index::File(FileIndex {
            path,
            records,
            changed: false,
        }))
    }

    pub fn has(&self, key: &str) -> bool {
        match self {
            Index::Disabled => false,
            Index::File(index) => index.records.contains_key(key),
        }
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&DescriptionRecord> {
        match self {
            Index::Disabled => None,
            Index::File(index) => index.records.get(key),
        }
    }

    /// Inserts or fully replaces the record under `key`.
    pub fn set(&mut self, key: &str, record: DescriptionRecord) {
        match self {
            Index::Disabled => log::trace!("Discarding record for {} (no index).", key),
            Index::File(index) => {
                index.records.insert(key.to_string(), record);
                index.changed = true;
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Index::Disabled => 0,
            Index::File(index) => index.records.len(),
        }
    }

    /// Writes the index to disk if anything changed since it was loaded.
    ///
    /// The document is written to a temporary file next to the target and
    /// renamed over it, so readers never observe a partial file.
    pub fn save(&mut self) -> Result<(), StoreError> {
        let index = match self {
            Index::File(index) if index.changed => index,
            _ => return Ok(()),
        };

        let dir = match index.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let tmp = NamedTempFile::new_in(&dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, &index.records)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&index.path)?;

        index.changed = false;
        log::info!(
            "Wrote {} records to {:?}",
            index.records.len(),
            index.path
        );
        Ok(())
    }
}

/// Index key for `path`: forward-slash path relative to `base_dir`, or the
/// bare file name when `path` lies outside it.
pub fn relative_key(path: &Path, base_dir: &Path) -> String {
    match path.strip_prefix(base_dir) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned()),
    }
}

/// Current UTC time, second precision, e.g. `2024-05-01T12:00:00+00:00`.
pub fn utc_now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
}
