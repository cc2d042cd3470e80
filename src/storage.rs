//! Which store is authoritative for an image, and whether it already holds a
//! caption.

use serde::Deserialize;
use std::path::Path;

/// Persistence policy for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// EXIF for JPEG, JSON index for everything else.
    Auto,
    #[serde(alias = "json-only")]
    #[value(alias = "json-only")]
    Json,
    #[serde(alias = "metadata-only")]
    #[value(alias = "metadata-only")]
    Metadata,
    Both,
}

impl StorageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageMode::Auto => "auto",
            StorageMode::Json => "json",
            StorageMode::Metadata => "metadata",
            StorageMode::Both => "both",
        }
    }

    /// Whether a run in this mode keeps a JSON index by default.
    pub fn uses_index(self) -> bool {
        !matches!(self, StorageMode::Metadata)
    }

    /// Whether a fresh caption is offered to the EXIF store first.
    pub fn attempts_metadata(self) -> bool {
        !matches!(self, StorageMode::Json)
    }

    /// Whether a fresh caption goes to the index, given the outcome of the
    /// EXIF write.
    pub fn writes_index(self, metadata_stored: bool) -> bool {
        match self {
            StorageMode::Json | StorageMode::Both => true,
            StorageMode::Auto => !metadata_stored,
            StorageMode::Metadata => false,
        }
    }

    fn needs(self, format: FormatClass) -> (bool, bool) {
        let tag_capable = format.is_tag_capable();
        let json_needed = matches!(self, StorageMode::Json | StorageMode::Both)
            || (self == StorageMode::Auto && !tag_capable);
        let meta_needed = matches!(self, StorageMode::Metadata | StorageMode::Both)
            || (self == StorageMode::Auto && tag_capable);
        (json_needed, meta_needed)
    }
}

/// Whether the file container can carry an embedded description tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatClass {
    TagCapable,
    Plain,
}

impl FormatClass {
    pub fn of(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("jpg") | Some("jpeg") => FormatClass::TagCapable,
            _ => FormatClass::Plain,
        }
    }

    pub fn is_tag_capable(self) -> bool {
        self == FormatClass::TagCapable
    }
}

/// Decides whether the backend can be skipped for an image.
///
/// `has_record` and `has_tag` are only consulted when the corresponding
/// store is authoritative for this mode and format, so callers can hand in
/// lazy lookups.
pub fn should_skip(
    mode: StorageMode,
    force: bool,
    format: FormatClass,
    has_record: impl FnOnce() -> bool,
    has_tag: impl FnOnce() -> bool,
) -> bool {
    if force {
        return false;
    }

    let (json_needed, meta_needed) = mode.needs(format);

    let json_ok = !json_needed || has_record();
    let meta_ok = if !meta_needed {
        true
    } else if format.is_tag_capable() {
        has_tag()
    } else {
        false
    };

    json_ok && meta_ok
}
