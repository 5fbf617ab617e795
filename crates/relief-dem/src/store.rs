//! Flat-file cache of rasterized grids.
//!
//! Each grid is stored as `{dir}/{id}.tif`. The files are self-describing
//! GeoTIFFs, so the directory alone is enough to rebuild the catalog.

use crate::grid::ElevationGrid;
use crate::{ReliefError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File extension of cached grids.
pub const CACHE_EXTENSION: &str = "tif";

/// Directory of cached grids keyed by source identifier.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Open (and create if needed) a cache directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file for `id`.
    ///
    /// Identifiers must be non-empty and must not contain path separators.
    pub fn path_for(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{}.{}", id, CACHE_EXTENSION)))
    }

    /// Whether a grid for `id` has been persisted.
    pub fn contains(&self, id: &str) -> bool {
        self.path_for(id).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Write `grid` under `id`, replacing any previous file.
    pub fn persist(&self, id: &str, grid: &ElevationGrid) -> Result<PathBuf> {
        let path = self.path_for(id)?;
        // Write next to the target and rename so readers never see a partial file
        let partial = self.dir.join(format!(".{}.partial", id));
        grid.write_geotiff(&partial)?;
        fs::rename(&partial, &path)?;

        debug!(id, path = %path.display(), "Persisted grid");
        Ok(path)
    }

    /// Paths of all cached grids, sorted by file name.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == CACHE_EXTENSION) && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

/// Source identifier of a cached grid file (its file stem).
pub fn id_from_path(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

fn validate_id(id: &str) -> Result<()> {
    let bad = id.is_empty()
        || id.starts_with('.')
        || id.chars().any(|c| c == '/' || c == '\\' || c == '\0');
    if bad {
        return Err(ReliefError::InvalidParameter(format!(
            "invalid source identifier {:?}",
            id
        )));
    }
    Ok(())
}
