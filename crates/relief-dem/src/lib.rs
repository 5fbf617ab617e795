//! # relief-dem
//!
//! Elevation tiles synthesized from lidar point clouds and remote services.
//!
//! This crate turns raw point clouds into regular elevation grids, keeps
//! them in an on-disk cache with an in-memory catalog, and serves slippy-map
//! elevation tiles by resampling whatever source covers the tile:
//!
//! 1. Cached grids from the catalog (measured)
//! 2. A remote elevation coverage service, e.g. OGC WCS (measured)
//! 3. A remote shaded-relief image service, e.g. OGC WMS (approximated)
//!
//! ## Overview
//!
//! ### Grids
//!
//! An [`ElevationGrid`] is a row-major `f32` raster in one CRS, identified
//! by EPSG code, with a nodata sentinel (default `-32768`). Grids are stored
//! as single-band floating-point GeoTIFFs.
//!
//! ### Tiles
//!
//! Tiles follow the OpenStreetMap naming convention and are served in Web
//! Mercator (EPSG:3857). They are encoded either as raw little-endian `f32`
//! or as lossless RGB-packed elevation PNGs.
//!
//! ## Examples
//!
//! ### Ingesting a point cloud and reading a tile
//!
//! ```no_run
//! use relief_dem::{ReliefConfig, TileCoord, TileFormat, TileQuery, TileService};
//!
//! let service = TileService::open(ReliefConfig::default())?;
//! service.ingest_file("lidar/block_17.xyz", None, Some(2.0))?;
//!
//! let query = TileQuery {
//!     tile: TileCoord::new(14, 8852, 5549)?,
//!     format: TileFormat::RgbElevation,
//!     options: Default::default(),
//! };
//! let tile = service.read_tile(&query)?;
//! println!("{} bytes of {} ({})", tile.bytes.len(), tile.content_type, tile.provenance);
//! # Ok::<(), relief_dem::ReliefError>(())
//! ```
//!
//! ### Sampling a profile
//!
//! ```no_run
//! use relief_dem::{ReliefConfig, TileService};
//!
//! let service = TileService::open(ReliefConfig::default())?;
//! for sample in service.profile(&[(14.41, 50.08), (14.43, 50.09)])? {
//!     println!("{:8.1} m  {:?}", sample.distance_m, sample.elevation_m);
//! }
//! # Ok::<(), relief_dem::ReliefError>(())
//! ```

pub mod bounds;
pub mod catalog;
pub mod chain;
pub mod composite;
pub mod config;
pub mod crs;
pub mod encode;
mod error;
pub mod grid;
pub mod points;
pub mod profile;
pub mod raster;
pub mod remote;
pub mod service;
pub mod store;
pub mod tile;

pub use bounds::BoundingBox;
pub use catalog::{CoverageCatalog, CoverageEntry, EntrySummary};
pub use chain::{ChainOptions, ChainSettings, Provenance, ResolutionChain, ResolvedTile};
pub use composite::PlausibleRange;
pub use config::{ReliefConfig, RemoteConfig};
pub use crs::{CrsTransform, TransformCache, GEOGRAPHIC_EPSG, SERVING_EPSG};
pub use encode::{EncodedTile, TileFormat};
pub use error::ReliefError;
pub use grid::{ElevationGrid, DEFAULT_NODATA};
pub use profile::{ElevationSource, ProfileSample, ProfileSettings};
pub use raster::{rasterize, Sample};
pub use remote::{CoverageService, GrayImage, ImageService, WcsClient, WmsClient};
pub use service::{IngestReport, TileDiagnostics, TileQuery, TileResponse, TileService};
pub use store::CacheStore;
pub use tile::{DestinationWindow, TileCoord};

/// Result type for elevation operations.
pub type Result<T> = std::result::Result<T, ReliefError>;
