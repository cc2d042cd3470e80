use crate::error::AppError;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "webp", "bmp", "gif", "tif", "tiff"];

/// Images to describe, in processing order, plus the directory their index
/// keys are relative to.
#[derive(Debug)]
pub struct Discovery {
    pub images: Vec<PathBuf>,
    pub base_dir: PathBuf,
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Resolves `input` (a file or folder) into a sorted, deduplicated list of
/// absolute image paths.
pub fn collect_images(input: &Path, recursive: bool) -> Result<Discovery, AppError> {
    if !input.exists() {
        return Err(AppError::PathNotFound(input.to_path_buf()));
    }
    let input = input.canonicalize()?;

    if input.is_file() {
        if !is_image(&input) {
            return Err(AppError::NotAnImage(input));
        }
        let base_dir = input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        return Ok(Discovery {
            images: vec![input],
            base_dir,
        });
    }

    if !input.is_dir() {
        return Err(AppError::NotFileOrFolder(input));
    }

    log::info!("Starting file discovery in {:?}", input);
    let mut walker = WalkDir::new(&input).min_depth(1);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut images = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if !path.is_file() {
            log::trace!("Skipping non-file entry: {:?}", path);
            continue;
        }
        if is_image(path) {
            log::trace!("Discovered image: {:?}", path);
            images.push(path.to_path_buf());
        } else {
            log::trace!("Skipping file due to unsupported extension: {:?}", path);
        }
    }
    images.sort();
    images.dedup();
    log::info!("File discovery complete: {} images.", images.len());

    Ok(Discovery {
        images,
        base_dir: input,
    })
}
