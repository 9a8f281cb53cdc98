use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Raster formats accepted as receipt input.
pub const VALID_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("Input must be an existing file or directory: {}", .0.display())]
    NotFound(PathBuf),
    #[error("IO error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A receipt photograph on disk, plus the stem every derived artifact is keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub path: PathBuf,
    pub stem: String,
}

impl ImageAsset {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        Self { path, stem }
    }

    /// Lowercased extension, if any.
    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
    }
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VALID_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expand files and directories (non-recursive) into image assets.
///
/// Directory entries are sorted by path. Stems are made unique: the second
/// `scan.jpg` after `scan.png` becomes `scan_1`.
pub fn collect_images(inputs: &[PathBuf]) -> Result<Vec<ImageAsset>, AssetError> {
    let mut paths = Vec::new();
    for input in inputs {
        if input.is_file() {
            if is_supported_image(input) {
                paths.push(input.clone());
            } else {
                tracing::warn!("Skipping unsupported file: {}", input.display());
            }
        } else if input.is_dir() {
            let entries = std::fs::read_dir(input).map_err(|source| AssetError::Io {
                path: input.clone(),
                source,
            })?;
            let mut found = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|source| AssetError::Io {
                    path: input.clone(),
                    source,
                })?;
                let path = entry.path();
                if path.is_file() && is_supported_image(&path) {
                    found.push(path);
                }
            }
            found.sort();
            paths.extend(found);
        } else {
            return Err(AssetError::NotFound(input.clone()));
        }
    }

    let mut seen = HashSet::new();
    let mut assets = Vec::with_capacity(paths.len());
    for path in paths {
        let mut asset = ImageAsset::new(path);
        if !seen.insert(asset.stem.clone()) {
            let base = asset.stem.clone();
            let mut ctr = 1;
            while !seen.insert(format!("{base}_{ctr}")) {
                ctr += 1;
            }
            asset.stem = format!("{base}_{ctr}");
        }
        assets.push(asset);
    }
    Ok(assets)
}
