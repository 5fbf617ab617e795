//! End-to-end tests over the public API.
//!
//! Remote services are replaced by counting mocks, so these run offline.

use relief_dem::composite::resample;
use relief_dem::encode::{decode_raw, encode_rgb_elevation};
use relief_dem::{
    rasterize, BoundingBox, CacheStore, CoverageCatalog, CoverageService, DestinationWindow,
    ElevationGrid, GrayImage, ImageService, PlausibleRange, Provenance, ReliefConfig, ReliefError,
    Result, Sample, TileCoord, TileFormat, TileQuery, TileService, DEFAULT_NODATA, SERVING_EPSG,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const NATIVE_EPSG: u16 = 32633;

#[derive(Default)]
struct CountingCoverage {
    calls: AtomicUsize,
}

impl CoverageService for CountingCoverage {
    fn fetch_coverage(
        &self,
        _: &BoundingBox,
        _: u16,
        _: usize,
        _: usize,
    ) -> Result<ElevationGrid> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ReliefError::RemoteUnavailable("offline".to_string()))
    }
}

#[derive(Default)]
struct CountingImage {
    calls: AtomicUsize,
}

impl ImageService for CountingImage {
    fn fetch_image(
        &self,
        _: &BoundingBox,
        _: u16,
        width: usize,
        height: usize,
    ) -> Result<GrayImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GrayImage {
            width,
            height,
            pixels: vec![255; width * height],
        })
    }
}

struct Harness {
    service: TileService,
    coverage: Arc<CountingCoverage>,
    image: Arc<CountingImage>,
}

fn harness(dir: &Path) -> Harness {
    harness_with(ReliefConfig {
        cache_dir: dir.to_path_buf(),
        native_epsg: NATIVE_EPSG,
        tile_size: 16,
        ..ReliefConfig::default()
    })
}

fn harness_with(config: ReliefConfig) -> Harness {
    let dir = config.cache_dir.clone();
    let store = CacheStore::open(&dir).expect("open store");
    let coverage = Arc::new(CountingCoverage::default());
    let image = Arc::new(CountingImage::default());
    let service = TileService::with_services(
        config,
        store,
        Arc::new(CoverageCatalog::new()),
        Some(coverage.clone() as Arc<dyn CoverageService>),
        image.clone(),
    )
    .expect("build service");
    Harness {
        service,
        coverage,
        image,
    }
}

fn test_tile() -> TileCoord {
    TileCoord::new(14, 8852, 5549).unwrap()
}

/// Flat 300 m samples in `epsg` covering `tile` with some margin.
///
/// Four samples per 10 m lattice node, so every 10 m cell receives one
/// sample well inside it whatever the rounding at cell edges.
fn samples_covering(tile: &TileCoord, epsg: u16) -> Vec<Sample> {
    let transforms = relief_dem::TransformCache::new();
    let native = transforms
        .get(SERVING_EPSG, epsg)
        .unwrap()
        .transform_bbox(&tile.mercator_bounds())
        .unwrap()
        .buffered(100.0);

    let (left, bottom) = (native.left.floor(), native.bottom.floor());
    let cols = (native.width() / 10.0).ceil() as usize;
    let rows = (native.height() / 10.0).ceil() as usize;

    let mut samples = Vec::with_capacity(cols * rows * 4);
    for j in 0..rows {
        for i in 0..cols {
            let (x, y) = (left + 10.0 * i as f64, bottom + 10.0 * j as f64);
            for (dx, dy) in [(2.0, 2.0), (7.0, 2.0), (2.0, 7.0), (7.0, 7.0)] {
                samples.push(Sample::new(x + dx, y + dy, 300.0));
            }
        }
    }
    samples
}

#[test]
fn test_identity_resample_preserves_cells() {
    let cells: Vec<f32> = (0..25).map(|i| 200.0 + i as f32).collect();
    let grid =
        ElevationGrid::new(0.0, 50.0, 10.0, 5, 5, NATIVE_EPSG, DEFAULT_NODATA, cells).unwrap();
    let window = DestinationWindow::new(grid.bounds(), 5, 5).unwrap();
    let out = resample(&grid, &window, DEFAULT_NODATA, PlausibleRange::default()).unwrap();
    assert_eq!(out.cells(), grid.cells());
}

#[test]
fn test_zoom_zero_covers_the_mercator_plane() {
    let bounds = TileCoord::new(0, 0, 0).unwrap().mercator_bounds();
    let edge = 20_037_508.342_789_244;
    for (actual, expected) in [
        (bounds.left, -edge),
        (bounds.bottom, -edge),
        (bounds.right, edge),
        (bounds.top, edge),
    ] {
        assert!((actual - expected).abs() < 1e-3, "{} != {}", actual, expected);
    }
}

#[test]
fn test_empty_catalog_is_approximated() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let query = TileQuery {
        tile: test_tile(),
        format: TileFormat::Raw,
        options: Default::default(),
    };

    let tile = h.service.read_tile(&query).unwrap();
    assert_eq!(tile.provenance, Provenance::Approximated);
    assert_eq!(h.image.calls.load(Ordering::SeqCst), 1);
    // Remote coverage is opt-in
    assert_eq!(h.coverage.calls.load(Ordering::SeqCst), 0);

    // Full intensity maps to the top of the pseudo-elevation range
    let cells = decode_raw(&tile.bytes).unwrap();
    assert_eq!(cells.len(), 16 * 16);
    assert!(cells.iter().all(|v| *v == 1000.0));
}

#[test]
fn test_covering_entry_is_measured_without_remote_calls() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let tile = test_tile();
    h.service
        .ingest("block", &samples_covering(&tile, NATIVE_EPSG), Some(10.0))
        .unwrap();

    let query = TileQuery {
        tile,
        format: TileFormat::Raw,
        options: Default::default(),
    };
    let response = h.service.read_tile(&query).unwrap();
    assert_eq!(response.provenance, Provenance::Measured);
    assert_eq!(response.source, "block");
    assert_eq!(h.coverage.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.image.calls.load(Ordering::SeqCst), 0);

    let cells = decode_raw(&response.bytes).unwrap();
    assert!(cells.iter().all(|v| (*v - 300.0).abs() < 1e-3));
}

#[test]
fn test_default_krovak_config_serves_measured_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReliefConfig {
        cache_dir: dir.path().to_path_buf(),
        tile_size: 16,
        ..ReliefConfig::default()
    };
    assert_eq!(config.native_epsg, 5514);
    let h = harness_with(config);

    // Prague old town
    let tile = TileCoord::from_lon_lat(14.42, 50.08, 14).unwrap();
    h.service
        .ingest("praha", &samples_covering(&tile, 5514), Some(10.0))
        .unwrap();

    let query = TileQuery {
        tile,
        format: TileFormat::Raw,
        options: Default::default(),
    };
    let response = h.service.read_tile(&query).unwrap();
    assert_eq!(response.provenance, Provenance::Measured);
    assert_eq!(response.source, "praha");
    assert_eq!(h.image.calls.load(Ordering::SeqCst), 0);
    let cells = decode_raw(&response.bytes).unwrap();
    assert!(cells.iter().all(|v| (*v - 300.0).abs() < 1e-3));

    let diag = h.service.tile_diagnostics(&tile).unwrap();
    assert_eq!(diag.overlapping, vec!["praha".to_string()]);
    assert!(diag.unreachable.is_empty());
    assert!(diag.native_bounds.left < -700_000.0 && diag.native_bounds.top < -1_000_000.0);

    let (lon, lat) = tile.lonlat_bounds().center();
    let profile = h.service.profile(&[(lon, lat), (lon + 0.0005, lat)]).unwrap();
    assert!(profile.len() >= 2);
    assert!(profile
        .iter()
        .all(|s| s.elevation_m.map_or(false, |v| (v - 300.0).abs() < 1e-3)));
}

#[test]
fn test_remote_coverage_failure_falls_through() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let options = relief_dem::ChainOptions {
        allow_remote_coverage: true,
        ..Default::default()
    };
    let query = TileQuery {
        tile: test_tile(),
        format: TileFormat::RgbElevation,
        options,
    };

    let response = h.service.read_tile(&query).unwrap();
    assert_eq!(response.provenance, Provenance::Approximated);
    assert_eq!(response.content_type, "image/png");
    assert_eq!(h.coverage.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_hundred_meter_profile() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let tile = test_tile();
    h.service
        .ingest("block", &samples_covering(&tile, NATIVE_EPSG), Some(10.0))
        .unwrap();

    let (lon, lat) = tile.lonlat_bounds().center();
    let transforms = relief_dem::TransformCache::new();
    let to_native = transforms.get(relief_dem::GEOGRAPHIC_EPSG, NATIVE_EPSG).unwrap();
    let (e, n) = to_native.forward(lon, lat).unwrap();
    let end = to_native.inverse(e + 100.0, n).unwrap();

    let profile = h.service.profile(&[(lon, lat), end]).unwrap();
    assert!((10..=50).contains(&profile.len()), "{} samples", profile.len());
    assert_eq!(profile[0].distance_m, 0.0);
    assert!((profile.last().unwrap().distance_m - 100.0).abs() < 1e-3);
    assert!(profile
        .iter()
        .all(|s| s.elevation_m.map_or(false, |v| (v - 300.0).abs() < 1e-3)));
}

#[test]
fn test_raw_encoding_keeps_nodata() {
    let cells = vec![312.5, DEFAULT_NODATA, -12.25, 0.0];
    let grid = ElevationGrid::new(0.0, 2.0, 1.0, 2, 2, SERVING_EPSG, DEFAULT_NODATA, cells.clone())
        .unwrap();
    let encoded = relief_dem::encode::encode(&grid, TileFormat::Raw).unwrap();
    assert_eq!(encoded.bytes.len(), 16);
    assert_eq!(decode_raw(&encoded.bytes).unwrap(), cells);
}

#[test]
fn test_rgb_elevation_is_deterministic() {
    let cells: Vec<f32> = (0..64).map(|i| 180.0 + i as f32 * 0.25).collect();
    let first = encode_rgb_elevation(&cells, 8, 8).unwrap();
    let second = encode_rgb_elevation(&cells, 8, 8).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_catalog_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let h = harness(dir.path());
        h.service
            .ingest("north", &[Sample::new(500_000.0, 5_550_000.0, 410.0)], None)
            .unwrap();
        h.service
            .ingest("south", &[Sample::new(500_000.0, 5_540_000.0, 390.0)], None)
            .unwrap();
    }

    let store = CacheStore::open(dir.path()).unwrap();
    let catalog = CoverageCatalog::open_store(&store, Default::default()).unwrap();
    assert_eq!(catalog.len(), 2);

    let north = catalog.get("north").unwrap();
    assert!(!north.is_loaded());
    assert_eq!(north.epsg(), NATIVE_EPSG);
    assert_eq!(north.grid().unwrap().cells(), &[410.0]);
}

#[test]
fn test_rasterize_single_sample_and_mean() {
    let grid = rasterize(&[Sample::new(10.0, 20.0, 5.0)], 1.0, NATIVE_EPSG).unwrap();
    assert_eq!(grid.dimensions(), (1, 1));
    assert_eq!(grid.cells(), &[5.0]);

    let samples = [
        Sample::new(0.0, 0.0, 100.0),
        Sample::new(0.2, 0.1, 104.0),
        Sample::new(0.4, 0.3, 108.0),
    ];
    let grid = rasterize(&samples, 1.0, NATIVE_EPSG).unwrap();
    assert_eq!(grid.dimensions(), (1, 1));
    assert_eq!(grid.get(0, 0), Some(104.0));

    assert!(matches!(rasterize(&[], 1.0, NATIVE_EPSG), Err(ReliefError::EmptyInput)));
}
