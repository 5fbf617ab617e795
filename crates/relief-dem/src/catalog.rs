//! In-memory catalog of cached elevation grids.
//!
//! The catalog is append-only. Entries are shared as `Arc`s and queries
//! iterate over a snapshot, so a `register` running concurrently with a
//! tile request never disturbs it. Grids backed by files are indexed from
//! their GeoTIFF headers and only decoded on first use.

use crate::bounds::BoundingBox;
use crate::crs::TransformCache;
use crate::grid::ElevationGrid;
use crate::store::{id_from_path, CacheStore};
use crate::{ReliefError, Result};
use relief_metrics::metric_defs;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{debug, info, warn};

/// A grid registered in the catalog, with its extent in its own CRS.
#[derive(Debug)]
pub struct CoverageEntry {
    id: String,
    bounds: BoundingBox,
    epsg: u16,
    nodata: f32,
    dimensions: (usize, usize),
    path: Option<PathBuf>,
    grid: OnceLock<Arc<ElevationGrid>>,
}

impl CoverageEntry {
    /// Wrap a grid that is already in memory.
    pub fn from_grid(id: impl Into<String>, grid: ElevationGrid) -> Self {
        Self::from_shared(id, Arc::new(grid), None)
    }

    fn from_shared(id: impl Into<String>, grid: Arc<ElevationGrid>, path: Option<PathBuf>) -> Self {
        let entry = Self {
            id: id.into(),
            bounds: grid.bounds(),
            epsg: grid.epsg(),
            nodata: grid.nodata(),
            dimensions: grid.dimensions(),
            path,
            grid: OnceLock::new(),
        };
        let _ = entry.grid.set(grid);
        entry
    }

    /// Index a cached GeoTIFF by reading only its header.
    ///
    /// The entry's id is the file stem.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let id = id_from_path(path)
            .ok_or_else(|| {
                ReliefError::InvalidParameter(format!("bad cache file name {}", path.display()))
            })?;
        let header = ElevationGrid::read_geotiff_header(path)?;

        Ok(Self {
            id,
            bounds: header.bounds,
            epsg: header.epsg,
            nodata: header.nodata,
            dimensions: (header.width, header.height),
            path: Some(path.to_path_buf()),
            grid: OnceLock::new(),
        })
    }

    /// Stable source identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Extent in the entry's CRS.
    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    /// EPSG code of the entry's CRS.
    pub fn epsg(&self) -> u16 {
        self.epsg
    }

    /// No-data sentinel of the grid.
    pub fn nodata(&self) -> f32 {
        self.nodata
    }

    /// Grid size in cells `(width, height)`.
    pub fn dimensions(&self) -> (usize, usize) {
        self.dimensions
    }

    /// Backing file, if the grid is persisted.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether the grid's cells are in memory.
    pub fn is_loaded(&self) -> bool {
        self.grid.get().is_some()
    }

    /// The grid, decoding the backing file on first use.
    pub fn grid(&self) -> Result<Arc<ElevationGrid>> {
        if let Some(grid) = self.grid.get() {
            return Ok(Arc::clone(grid));
        }

        let path = self.path.as_ref().ok_or_else(|| {
            ReliefError::NoCoverage(format!("entry {} has neither cells nor a file", self.id))
        })?;
        let loaded = Arc::new(ElevationGrid::from_geotiff(path)?);
        debug!(id = %self.id, path = %path.display(), "Loaded cached grid");

        // Another thread may have won the race; both loaded the same file
        Ok(Arc::clone(self.grid.get_or_init(|| loaded)))
    }

    /// Summary of the entry for listings.
    pub fn summary(&self) -> EntrySummary {
        EntrySummary {
            id: self.id.clone(),
            bounds: self.bounds,
            epsg: self.epsg,
            width: self.dimensions.0,
            height: self.dimensions.1,
            file_size: self
                .path
                .as_ref()
                .and_then(|p| std::fs::metadata(p).ok())
                .map(|m| m.len()),
            loaded: self.is_loaded(),
        }
    }
}

/// One line of a catalog listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySummary {
    pub id: String,
    pub bounds: BoundingBox,
    pub epsg: u16,
    pub width: usize,
    pub height: usize,
    /// Size of the backing file in bytes, for persisted entries.
    pub file_size: Option<u64>,
    pub loaded: bool,
}

/// Catalog of coverage entries queried by bbox overlap.
///
/// This type is thread-safe and can be shared across threads.
#[derive(Debug)]
pub struct CoverageCatalog {
    entries: RwLock<Vec<Arc<CoverageEntry>>>,
    transforms: Arc<TransformCache>,
}

impl Default for CoverageCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl CoverageCatalog {
    /// Create an empty catalog with its own transform cache.
    pub fn new() -> Self {
        Self::with_transforms(Arc::new(TransformCache::new()))
    }

    /// Create an empty catalog sharing a transform cache.
    pub fn with_transforms(transforms: Arc<TransformCache>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            transforms,
        }
    }

    /// Rebuild the catalog from every cached file in `store`.
    ///
    /// Files whose headers cannot be read are skipped with a warning.
    pub fn open_store(store: &CacheStore, transforms: Arc<TransformCache>) -> Result<Self> {
        let catalog = Self::with_transforms(transforms);
        for path in store.files()? {
            match CoverageEntry::from_file(&path) {
                Ok(entry) => {
                    catalog.register(entry)?;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache file")
                }
            }
        }
        info!(dir = %store.dir().display(), entries = catalog.len(), "Indexed grid cache");
        Ok(catalog)
    }

    /// The transform cache used for overlap queries.
    pub fn transforms(&self) -> &Arc<TransformCache> {
        &self.transforms
    }

    /// Append an entry. Identifiers are unique.
    pub fn register(&self, entry: CoverageEntry) -> Result<Arc<CoverageEntry>> {
        let entry = Arc::new(entry);
        let mut entries = self.entries.write().map_err(|_| ReliefError::LockPoisoned)?;
        if entries.iter().any(|e| e.id == entry.id) {
            return Err(ReliefError::InvalidParameter(format!(
                "entry {} is already registered",
                entry.id
            )));
        }
        entries.push(Arc::clone(&entry));
        metrics::gauge!(metric_defs::CATALOG_ENTRIES.name).set(entries.len() as f64);

        debug!(id = %entry.id, epsg = entry.epsg, "Registered coverage entry");
        Ok(entry)
    }

    /// Register an in-memory grid, optionally remembering its backing file.
    pub fn register_grid(
        &self,
        id: impl Into<String>,
        grid: Arc<ElevationGrid>,
        path: Option<PathBuf>,
    ) -> Result<Arc<CoverageEntry>> {
        self.register(CoverageEntry::from_shared(id, grid, path))
    }

    /// Look up an entry by identifier.
    pub fn get(&self, id: &str) -> Option<Arc<CoverageEntry>> {
        let entries = self.entries.read().ok()?;
        entries.iter().find(|e| e.id == id).cloned()
    }

    /// A consistent copy of the current entry list, in registration order.
    pub fn snapshot(&self) -> Result<Vec<Arc<CoverageEntry>>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| ReliefError::LockPoisoned)?
            .clone())
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the catalog has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries whose extent intersects `bbox` (given in `epsg`), in registration order.
    ///
    /// The query box is transformed into each entry's CRS before the
    /// axis-aligned test; touching edges count. An entry whose CRS cannot be
    /// reached from `epsg` yields [`ReliefError::Projection`] in its place.
    pub fn find_overlapping<'a>(
        &'a self,
        bbox: BoundingBox,
        epsg: u16,
    ) -> Result<impl Iterator<Item = Result<Arc<CoverageEntry>>> + 'a> {
        bbox.validate()?;
        let snapshot = self.snapshot()?;
        Ok(snapshot
            .into_iter()
            .filter_map(move |entry| match self.entry_overlaps(&entry, &bbox, epsg) {
                Ok(true) => Some(Ok(entry)),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            }))
    }

    /// Whether any reachable entry intersects `bbox`.
    pub fn is_covered(&self, bbox: BoundingBox, epsg: u16) -> bool {
        self.find_overlapping(bbox, epsg)
            .map(|mut it| it.any(|entry| entry.is_ok()))
            .unwrap_or(false)
    }

    /// Summaries of every entry, in registration order.
    pub fn summaries(&self) -> Result<Vec<EntrySummary>> {
        Ok(self.snapshot()?.iter().map(|e| e.summary()).collect())
    }

    fn entry_overlaps(&self, entry: &CoverageEntry, bbox: &BoundingBox, epsg: u16) -> Result<bool> {
        let query = self
            .transforms
            .get(epsg, entry.epsg)
            .and_then(|t| t.transform_bbox(bbox))
            .map_err(|e| {
                warn!(
                    id = %entry.id,
                    from = epsg,
                    to = entry.epsg,
                    error = %e,
                    "Cannot compare extents"
                );
                match e {
                    ReliefError::Projection(msg) => {
                        ReliefError::Projection(format!("entry {}: {}", entry.id, msg))
                    }
                    other => other,
                }
            })?;
        Ok(query.overlaps(&entry.bounds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::{CrsTransform, SERVING_EPSG};
    use crate::grid::DEFAULT_NODATA;

    fn grid_at(left: f64, top: f64) -> ElevationGrid {
        ElevationGrid::new(left, top, 10.0, 10, 10, 32633, DEFAULT_NODATA, vec![300.0; 100])
            .unwrap()
    }

    #[test]
    fn test_find_overlapping_in_order() {
        let catalog = CoverageCatalog::new();
        catalog.register(CoverageEntry::from_grid("b", grid_at(0.0, 100.0))).unwrap();
        catalog.register(CoverageEntry::from_grid("a", grid_at(50.0, 150.0))).unwrap();
        catalog.register(CoverageEntry::from_grid("far", grid_at(10_000.0, 10_000.0))).unwrap();

        let query = BoundingBox::new(60.0, 60.0, 80.0, 80.0).unwrap();
        let ids: Vec<String> = catalog
            .find_overlapping(query, 32633)
            .unwrap()
            .map(|e| e.unwrap().id().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);

        // Touching the east edge of "b" only
        let touching = BoundingBox::new(100.0, 0.0, 101.0, 40.0).unwrap();
        let ids: Vec<String> = catalog
            .find_overlapping(touching, 32633)
            .unwrap()
            .map(|e| e.unwrap().id().to_string())
            .collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn test_overlap_across_crs() {
        let catalog = CoverageCatalog::new();
        // 1 km square near 15°E 50°N in UTM 33N
        let cells = vec![300.0; 10_000];
        let grid =
            ElevationGrid::new(500_000.0, 5_539_000.0, 10.0, 100, 100, 32633, DEFAULT_NODATA, cells)
                .unwrap();
        catalog.register(CoverageEntry::from_grid("utm", grid)).unwrap();

        let to_merc = CrsTransform::new(32633, SERVING_EPSG).unwrap();
        let utm_box = |l, b, r, t| BoundingBox::new(l, b, r, t).unwrap();
        let inside = to_merc
            .transform_bbox(&utm_box(500_400.0, 5_538_400.0, 500_600.0, 5_538_600.0))
            .unwrap();
        let outside = to_merc
            .transform_bbox(&utm_box(510_000.0, 5_530_000.0, 511_000.0, 5_531_000.0))
            .unwrap();

        assert!(catalog.is_covered(inside, SERVING_EPSG));
        assert!(!catalog.is_covered(outside, SERVING_EPSG));
    }

    #[test]
    fn test_unreachable_crs_is_reported() {
        let catalog = CoverageCatalog::new();
        // EPSG:1 is not a CRS any transform can reach
        let cells = vec![300.0; 100];
        let stray = ElevationGrid::new(0.0, 100.0, 10.0, 10, 10, 1, DEFAULT_NODATA, cells).unwrap();
        catalog.register(CoverageEntry::from_grid("stray", stray)).unwrap();
        catalog.register(CoverageEntry::from_grid("utm", grid_at(0.0, 100.0))).unwrap();

        let query = BoundingBox::new(0.0, 0.0, 100.0, 100.0).unwrap();
        let found: Vec<Result<Arc<CoverageEntry>>> =
            catalog.find_overlapping(query, 32633).unwrap().collect();
        assert_eq!(found.len(), 2);
        assert!(matches!(found[0], Err(ReliefError::Projection(_))));
        assert_eq!(found[1].as_ref().unwrap().id(), "utm");
        assert!(catalog.is_covered(query, 32633));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let catalog = CoverageCatalog::new();
        catalog.register(CoverageEntry::from_grid("dup", grid_at(0.0, 100.0))).unwrap();
        assert!(catalog.register(CoverageEntry::from_grid("dup", grid_at(0.0, 100.0))).is_err());
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_snapshot_survives_append() {
        let catalog = CoverageCatalog::new();
        catalog.register(CoverageEntry::from_grid("first", grid_at(0.0, 100.0))).unwrap();

        let query = BoundingBox::new(0.0, 0.0, 100.0, 100.0).unwrap();
        let mut iter = catalog.find_overlapping(query, 32633).unwrap();
        catalog.register(CoverageEntry::from_grid("second", grid_at(0.0, 100.0))).unwrap();

        assert_eq!(iter.next().unwrap().unwrap().id(), "first");
        assert!(iter.next().is_none());
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_rebuild_from_store_is_lazy() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        store.persist("tile_a", &grid_at(0.0, 100.0)).unwrap();
        store.persist("tile_b", &grid_at(100.0, 100.0)).unwrap();
        std::fs::write(dir.path().join("broken.tif"), b"not a tiff").unwrap();

        let catalog = CoverageCatalog::open_store(&store, Arc::new(TransformCache::new())).unwrap();
        assert_eq!(catalog.len(), 2);

        let entry = catalog.get("tile_a").unwrap();
        assert!(!entry.is_loaded());
        assert_eq!(entry.bounds(), grid_at(0.0, 100.0).bounds());
        assert_eq!(entry.epsg(), 32633);

        let grid = entry.grid().unwrap();
        assert!(entry.is_loaded());
        assert_eq!(grid.value(3, 3), 300.0);

        let listing = catalog.summaries().unwrap();
        assert_eq!(listing[0].id, "tile_a");
        assert!(listing[0].file_size.unwrap() > 400);
    }
}
