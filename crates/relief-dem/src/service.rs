//! The tile service: ingestion, tile reads, profiles and diagnostics over
//! one catalog.

use crate::bounds::BoundingBox;
use crate::catalog::{CoverageCatalog, EntrySummary};
use crate::chain::{ChainOptions, Provenance, ResolutionChain};
use crate::config::ReliefConfig;
use crate::crs::SERVING_EPSG;
use crate::encode::{encode, TileFormat};
use crate::points::read_points;
use crate::profile::{sample_profile, CatalogSource, ProfileSample};
use crate::raster::{rasterize, Sample};
use crate::remote::{CoverageService, ImageService};
use crate::store::{id_from_path, CacheStore};
use crate::tile::TileCoord;
use crate::{ReliefError, Result};
use relief_metrics::metric_defs;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// A tile read request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileQuery {
    pub tile: TileCoord,
    pub format: TileFormat,
    pub options: ChainOptions,
}

/// An encoded tile and where its data came from.
#[derive(Debug, Clone, PartialEq)]
pub struct TileResponse {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub provenance: Provenance,
    pub source: String,
}

/// Outcome of ingesting one point cloud.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub id: String,
    pub path: PathBuf,
    pub bounds: BoundingBox,
    pub width: usize,
    pub height: usize,
    /// Cells holding at least one sample.
    pub filled: usize,
    /// `filled` over the total number of cells.
    pub fill_ratio: f64,
}

/// Where a tile lands in each CRS and which entries it touches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileDiagnostics {
    pub tile: String,
    pub lonlat_bounds: BoundingBox,
    pub mercator_bounds: BoundingBox,
    pub native_epsg: u16,
    pub native_bounds: BoundingBox,
    pub overlapping: Vec<String>,
    /// Entries whose CRS could not be compared with the tile.
    pub unreachable: Vec<String>,
}

/// Facade over the catalog, cache directory and resolution chain.
#[derive(Debug)]
pub struct TileService {
    config: ReliefConfig,
    store: CacheStore,
    chain: ResolutionChain,
}

impl TileService {
    /// Index the cache directory and connect the configured remote services.
    pub fn open(config: ReliefConfig) -> Result<Self> {
        config.validate()?;
        let store = CacheStore::open(&config.cache_dir)?;
        let catalog = CoverageCatalog::open_store(&store, Arc::new(config.transform_cache()))?;
        let coverage: Arc<dyn CoverageService> = Arc::new(config.coverage_client()?);
        let image: Arc<dyn ImageService> = Arc::new(config.image_client()?);
        Self::with_services(config, store, Arc::new(catalog), Some(coverage), image)
    }

    /// Assemble a service from explicit parts.
    pub fn with_services(
        config: ReliefConfig,
        store: CacheStore,
        catalog: Arc<CoverageCatalog>,
        coverage: Option<Arc<dyn CoverageService>>,
        image: Arc<dyn ImageService>,
    ) -> Result<Self> {
        config.validate()?;
        let chain = ResolutionChain::new(catalog, coverage, image, config.chain_settings());
        Ok(Self {
            config,
            store,
            chain,
        })
    }

    pub fn config(&self) -> &ReliefConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<CoverageCatalog> {
        self.chain.catalog()
    }

    /// Resolve, resample and encode one tile.
    pub fn read_tile(&self, query: &TileQuery) -> Result<TileResponse> {
        let resolved = self.chain.resolve(&query.tile, &query.options)?;
        let encoded = encode(&resolved.grid, query.format)?;

        metrics::counter!(
            metric_defs::TILES_SERVED.name,
            "provenance" => resolved.provenance.as_str(),
            "format" => query.format.as_str()
        )
        .increment(1);

        Ok(TileResponse {
            bytes: encoded.bytes,
            content_type: encoded.content_type,
            provenance: resolved.provenance,
            source: resolved.source,
        })
    }

    /// Rasterize samples, persist the grid under `id` and register it.
    pub fn ingest(&self, id: &str, samples: &[Sample], cell_size: Option<f64>) -> Result<IngestReport> {
        // Fail before writing anything
        self.store.path_for(id)?;
        if self.catalog().get(id).is_some() {
            return Err(ReliefError::InvalidParameter(format!(
                "{} is already in the catalog",
                id
            )));
        }

        let cell_size = cell_size.unwrap_or(self.config.default_cell_size);
        let grid = rasterize(samples, cell_size, self.config.native_epsg)?;
        let path = self.store.persist(id, &grid)?;

        let (width, height) = grid.dimensions();
        let filled = grid.valid_count();
        let fill_ratio = filled as f64 / (width * height) as f64;
        let bounds = grid.bounds();
        self.catalog().register_grid(id, Arc::new(grid), Some(path.clone()))?;

        metrics::counter!(metric_defs::GRIDS_INGESTED.name).increment(1);
        metrics::counter!(metric_defs::SAMPLES_INGESTED.name).increment(samples.len() as u64);
        metrics::histogram!(metric_defs::GRID_FILL_RATIO.name).record(fill_ratio * 100.0);
        info!(
            id,
            width,
            height,
            fill_ratio = %format!("{:.1}%", fill_ratio * 100.0),
            "Ingested point cloud"
        );

        Ok(IngestReport {
            id: id.to_string(),
            path,
            bounds,
            width,
            height,
            filled,
            fill_ratio,
        })
    }

    /// Read a point-cloud file and ingest it, by default under its file stem.
    pub fn ingest_file<P: AsRef<Path>>(
        &self,
        path: P,
        id: Option<&str>,
        cell_size: Option<f64>,
    ) -> Result<IngestReport> {
        let path = path.as_ref();
        let id = match id {
            Some(id) => id.to_string(),
            None => id_from_path(path).ok_or_else(|| {
                ReliefError::InvalidParameter(format!("cannot derive an id from {}", path.display()))
            })?,
        };
        let samples = read_points(path)?;
        self.ingest(&id, &samples, cell_size)
    }

    /// Elevation profile along `(lon, lat)` vertices from the catalog.
    pub fn profile(&self, path: &[(f64, f64)]) -> Result<Vec<ProfileSample>> {
        let source = CatalogSource::new(self.catalog(), self.config.native_epsg);
        sample_profile(path, &source, self.catalog().transforms(), &self.config.profile)
    }

    /// Where `tile` lands and which catalog entries it overlaps.
    pub fn tile_diagnostics(&self, tile: &TileCoord) -> Result<TileDiagnostics> {
        let mercator_bounds = tile.mercator_bounds();
        let native_bounds = self
            .catalog()
            .transforms()
            .get(SERVING_EPSG, self.config.native_epsg)?
            .transform_bbox(&mercator_bounds)?;
        let mut overlapping = Vec::new();
        let mut unreachable = Vec::new();
        for entry in self.catalog().find_overlapping(mercator_bounds, SERVING_EPSG)? {
            match entry {
                Ok(entry) => overlapping.push(entry.id().to_string()),
                Err(e) => unreachable.push(e.to_string()),
            }
        }

        Ok(TileDiagnostics {
            tile: tile.to_string(),
            lonlat_bounds: tile.lonlat_bounds(),
            mercator_bounds,
            native_epsg: self.config.native_epsg,
            native_bounds,
            overlapping,
            unreachable,
        })
    }

    /// Summaries of every catalog entry.
    pub fn list(&self) -> Result<Vec<EntrySummary>> {
        self.catalog().summaries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::BoundingBox;
    use crate::catalog::CoverageEntry;
    use crate::grid::{ElevationGrid, DEFAULT_NODATA};
    use crate::remote::GrayImage;

    struct FlatImage;

    impl ImageService for FlatImage {
        fn fetch_image(
            &self,
            _: &BoundingBox,
            _: u16,
            width: usize,
            height: usize,
        ) -> Result<GrayImage> {
            Ok(GrayImage {
                width,
                height,
                pixels: vec![0; width * height],
            })
        }
    }

    fn service(dir: &Path) -> TileService {
        let config = ReliefConfig {
            cache_dir: dir.to_path_buf(),
            native_epsg: 32633,
            tile_size: 8,
            ..ReliefConfig::default()
        };
        let store = CacheStore::open(dir).unwrap();
        let catalog = Arc::new(CoverageCatalog::new());
        TileService::with_services(config, store, catalog, None, Arc::new(FlatImage)).unwrap()
    }

    #[test]
    fn test_ingest_persists_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let samples = [
            Sample::new(500_000.0, 5_540_000.0, 300.0),
            Sample::new(500_010.0, 5_539_990.0, 310.0),
        ];

        let report = service.ingest("block_1", &samples, None).unwrap();
        assert_eq!((report.width, report.height), (3, 3));
        assert_eq!(report.filled, 2);
        assert!(report.path.is_file());
        assert!(service.catalog().get("block_1").is_some());

        // Same id twice is refused without touching the file
        assert!(service.ingest("block_1", &samples, None).is_err());
        assert_eq!(service.list().unwrap().len(), 1);
    }

    #[test]
    fn test_read_tile_falls_back_to_image() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let query = TileQuery {
            tile: TileCoord::new(14, 8852, 5549).unwrap(),
            format: TileFormat::Raw,
            options: ChainOptions::default(),
        };
        let response = service.read_tile(&query).unwrap();
        assert_eq!(response.provenance, Provenance::Approximated);
        assert_eq!(response.content_type, "application/octet-stream");
        assert_eq!(response.bytes.len(), 8 * 8 * 4);
        assert_eq!(&response.bytes[..4], &200.0f32.to_le_bytes());
    }

    #[test]
    fn test_tile_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let tile = TileCoord::new(14, 8852, 5549).unwrap();
        let diag = service.tile_diagnostics(&tile).unwrap();
        assert_eq!(diag.tile, "14/8852/5549");
        assert_eq!(diag.native_epsg, 32633);
        assert!(diag.lonlat_bounds.contains(14.51, 50.1));
        assert!(diag.overlapping.is_empty());
        assert!(diag.unreachable.is_empty());

        let cells = vec![300.0; 100];
        let stray = ElevationGrid::new(0.0, 100.0, 10.0, 10, 10, 1, DEFAULT_NODATA, cells).unwrap();
        service.catalog().register(CoverageEntry::from_grid("stray", stray)).unwrap();
        let diag = service.tile_diagnostics(&tile).unwrap();
        assert!(diag.overlapping.is_empty());
        assert_eq!(diag.unreachable.len(), 1);
        assert!(diag.unreachable[0].contains("entry stray"), "{}", diag.unreachable[0]);
    }
}
