use std::path::PathBuf;
use thiserror::Error;

/// Errors that stop a run before any image is processed (exit status 2).
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("Not an image: {}", .0.display())]
    NotAnImage(PathBuf),

    #[error("Not a file or folder: {}", .0.display())]
    NotFileOrFolder(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid index file {}: {source}", path.display())]
    IndexLoad {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A single generation call failed. Recovered per image.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{backend} request failed: {source}")]
    Transport {
        backend: &'static str,
        source: reqwest::Error,
    },

    #[error("{backend} error {status}: {body}")]
    Status {
        backend: &'static str,
        status: u16,
        body: String,
    },

    #[error("{backend} returned invalid JSON: {body}")]
    InvalidResponse { backend: &'static str, body: String },

    #[error("{backend} returned no choices")]
    NoChoices { backend: &'static str },

    #[error("Failed to read image {}: {source}", path.display())]
    ReadImage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("llama.cpp binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("Failed to run llama.cpp: {0}")]
    Spawn(std::io::Error),

    #[error("llama.cpp error {code}: {stderr}")]
    ProcessFailed { code: String, stderr: String },

    #[error("llama.cpp timed out after {0}s")]
    Timeout(u64),
}

/// Persisting a caption into the index or into the file's EXIF block failed.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("EXIF error: {0}")]
    Exif(#[from] exif::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to replace file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Malformed JPEG: {0}")]
    MalformedJpeg(&'static str),

    #[error("EXIF block too large for a JPEG segment ({0} bytes)")]
    ExifTooLarge(usize),
}

/// Everything that can go wrong for one image.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("metadata not supported for this file type")]
    MetadataUnsupported,
}
