//! Source resolution for tile requests.
//!
//! A request moves through a fixed sequence of stages and never goes back:
//!
//! ```text
//! TryCache -> TryRemoteCoverage -> TryRemoteImage -> Done
//! ```
//!
//! Each stage either resolves the tile, passes it on, or aborts the request.
//! Reaching `Done` means no source had data.

use crate::catalog::CoverageCatalog;
use crate::composite::{self, PlausibleRange};
use crate::crs::SERVING_EPSG;
use crate::grid::ElevationGrid;
use crate::remote::{CoverageService, ImageService};
use crate::tile::{DestinationWindow, TileCoord};
use crate::{ReliefError, Result};
use relief_metrics::metric_defs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Source label of tiles built from the remote coverage service.
pub const REMOTE_COVERAGE_SOURCE: &str = "remote-coverage";

/// Source label of tiles built from the remote image service.
pub const REMOTE_IMAGE_SOURCE: &str = "remote-image";

/// Whether a tile holds measured elevations or an approximation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Elevations from lidar grids or an elevation coverage service.
    Measured,
    /// Elevations derived from shaded-relief intensities; for display only.
    Approximated,
}

impl Provenance {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Provenance::Measured => "measured",
            Provenance::Approximated => "approximated",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Linear mapping of 8-bit intensities onto elevations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PseudoElevationRange {
    /// Elevation for intensity 0.
    pub min: f32,
    /// Elevation for intensity 255.
    pub max: f32,
}

impl Default for PseudoElevationRange {
    fn default() -> Self {
        Self {
            min: 200.0,
            max: 1000.0,
        }
    }
}

impl PseudoElevationRange {
    /// Elevation standing in for an intensity.
    pub fn elevation(&self, intensity: u8) -> f32 {
        self.min + (intensity as f32 / 255.0) * (self.max - self.min)
    }
}

/// Fixed parameters of the chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainSettings {
    /// Tile edge length in pixels.
    pub tile_size: usize,
    /// CRS in which the coverage service is queried.
    pub native_epsg: u16,
    /// Elevations outside this range become nodata.
    pub plausible: PlausibleRange,
    /// Mapping used by the image stage.
    pub pseudo: PseudoElevationRange,
    /// Highest zoom for which the coverage service is tried.
    pub remote_coverage_max_zoom: u8,
}

/// Per-request switches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainOptions {
    /// Try the local catalog.
    pub allow_cache: bool,
    /// Try the remote coverage service.
    pub allow_remote_coverage: bool,
    /// Sentinel written into pixels without data.
    pub nodata: f32,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            allow_cache: true,
            allow_remote_coverage: false,
            nodata: crate::grid::DEFAULT_NODATA,
        }
    }
}

/// A tile grid in the serving CRS plus where it came from.
#[derive(Debug, Clone)]
pub struct ResolvedTile {
    pub grid: ElevationGrid,
    pub provenance: Provenance,
    /// Catalog entry id, [`REMOTE_COVERAGE_SOURCE`] or [`REMOTE_IMAGE_SOURCE`].
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    TryCache,
    TryRemoteCoverage,
    TryRemoteImage,
    Done,
}

impl Stage {
    fn next(self) -> Self {
        match self {
            Stage::TryCache => Stage::TryRemoteCoverage,
            Stage::TryRemoteCoverage => Stage::TryRemoteImage,
            Stage::TryRemoteImage | Stage::Done => Stage::Done,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Stage::TryCache => "cache",
            Stage::TryRemoteCoverage => "remote_coverage",
            Stage::TryRemoteImage => "remote_image",
            Stage::Done => "done",
        }
    }
}

enum StageOutcome {
    Resolved(ResolvedTile),
    /// Pass the request to the next stage; the reason is a short metric label.
    Continue(&'static str),
    /// Pass the request on after a recoverable error.
    Failed(&'static str, ReliefError),
    Fatal(ReliefError),
}

/// Resolves tile requests against the catalog and remote services.
pub struct ResolutionChain {
    catalog: Arc<CoverageCatalog>,
    coverage: Option<Arc<dyn CoverageService>>,
    image: Arc<dyn ImageService>,
    settings: ChainSettings,
}

impl fmt::Debug for ResolutionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionChain")
            .field("entries", &self.catalog.len())
            .field("has_coverage_service", &self.coverage.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

impl ResolutionChain {
    pub fn new(
        catalog: Arc<CoverageCatalog>,
        coverage: Option<Arc<dyn CoverageService>>,
        image: Arc<dyn ImageService>,
        settings: ChainSettings,
    ) -> Self {
        Self {
            catalog,
            coverage,
            image,
            settings,
        }
    }

    pub fn catalog(&self) -> &Arc<CoverageCatalog> {
        &self.catalog
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    /// Produce the tile grid for `tile`.
    ///
    /// Parameter errors are reported before any stage runs. Exhausting every
    /// stage yields [`ReliefError::NoCoverage`], carrying the last stage
    /// error if there was one.
    pub fn resolve(&self, tile: &TileCoord, options: &ChainOptions) -> Result<ResolvedTile> {
        let window = DestinationWindow::for_tile(tile, self.settings.tile_size)?;

        let mut last_failure: Option<ReliefError> = None;
        let mut stage = Stage::TryCache;
        loop {
            let outcome = match stage {
                Stage::TryCache => self.try_cache(&window, options),
                Stage::TryRemoteCoverage => self.try_remote_coverage(tile, &window, options),
                Stage::TryRemoteImage => self.try_remote_image(&window, options),
                Stage::Done => {
                    metrics::counter!(metric_defs::TILES_UNAVAILABLE.name).increment(1);
                    let detail = match last_failure {
                        Some(e) => format!("tile {}, last failure: {}", tile, e),
                        None => format!("tile {}", tile),
                    };
                    return Err(ReliefError::NoCoverage(detail));
                }
            };

            match outcome {
                StageOutcome::Resolved(resolved) => {
                    debug!(
                        %tile,
                        stage = stage.label(),
                        source = %resolved.source,
                        provenance = %resolved.provenance,
                        "Resolved tile"
                    );
                    return Ok(resolved);
                }
                StageOutcome::Continue(reason) => {
                    debug!(%tile, stage = stage.label(), reason, "Stage fell through");
                    record_fallthrough(stage, reason);
                    stage = stage.next();
                }
                StageOutcome::Failed(reason, e) => {
                    debug!(%tile, stage = stage.label(), reason, error = %e, "Stage failed");
                    record_fallthrough(stage, reason);
                    last_failure = Some(e);
                    stage = stage.next();
                }
                StageOutcome::Fatal(e) => return Err(e),
            }
        }
    }

    fn try_cache(&self, window: &DestinationWindow, options: &ChainOptions) -> StageOutcome {
        if !options.allow_cache {
            return StageOutcome::Continue("disabled");
        }

        let entries = match self.catalog.find_overlapping(window.bbox, SERVING_EPSG) {
            Ok(entries) => entries,
            Err(e) => return StageOutcome::Fatal(e),
        };

        let mut failure = None;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    failure = Some(("projection", e));
                    continue;
                }
            };

            let resampled = entry.grid().and_then(|grid| {
                let transform = self.catalog.transforms().get(SERVING_EPSG, entry.epsg())?;
                timed_resample(|| {
                    composite::reproject(
                        &grid,
                        window,
                        &transform,
                        options.nodata,
                        self.settings.plausible,
                    )
                })
            });

            match resampled {
                Ok(grid) if grid.valid_count() > 0 => {
                    return StageOutcome::Resolved(ResolvedTile {
                        grid,
                        provenance: Provenance::Measured,
                        source: entry.id().to_string(),
                    });
                }
                Ok(_) => debug!(id = entry.id(), "Overlapping entry has no valid pixels here"),
                Err(e) => {
                    warn!(id = entry.id(), error = %e, "Skipping unusable cache entry");
                    let reason = match e {
                        ReliefError::Projection(_) => "projection",
                        _ => "unusable_entry",
                    };
                    failure = Some((reason, e));
                }
            }
        }

        match failure {
            Some((reason, e)) => StageOutcome::Failed(reason, e),
            None => StageOutcome::Continue("no_valid_entry"),
        }
    }

    fn try_remote_coverage(
        &self,
        tile: &TileCoord,
        window: &DestinationWindow,
        options: &ChainOptions,
    ) -> StageOutcome {
        let service = match &self.coverage {
            Some(service) if options.allow_remote_coverage => service,
            _ => return StageOutcome::Continue("disabled"),
        };
        if tile.z > self.settings.remote_coverage_max_zoom {
            return StageOutcome::Continue("zoom");
        }

        let native = self.settings.native_epsg;
        let size = self.settings.tile_size;
        let fetched = self
            .catalog
            .transforms()
            .get(SERVING_EPSG, native)
            .and_then(|transform| {
                let native_bbox = transform.transform_bbox(&window.bbox)?;
                let grid = service.fetch_coverage(&native_bbox, native, size, size)?;
                timed_resample(|| {
                    composite::reproject(
                        &grid,
                        window,
                        &transform,
                        options.nodata,
                        self.settings.plausible,
                    )
                })
            });

        match fetched {
            Ok(grid) if grid.valid_count() > 0 => StageOutcome::Resolved(ResolvedTile {
                grid,
                provenance: Provenance::Measured,
                source: REMOTE_COVERAGE_SOURCE.to_string(),
            }),
            Ok(_) => StageOutcome::Continue("no_valid_pixels"),
            Err(e) => {
                debug!(%tile, error = %e, "Remote coverage failed");
                StageOutcome::Failed("error", e)
            }
        }
    }

    fn try_remote_image(&self, window: &DestinationWindow, options: &ChainOptions) -> StageOutcome {
        let image = match self
            .image
            .fetch_image(&window.bbox, SERVING_EPSG, window.width, window.height)
        {
            Ok(image) => image,
            Err(e) => {
                warn!(error = %e, "Remote image failed");
                return StageOutcome::Failed("error", e);
            }
        };

        if image.pixels.len() != window.len() {
            return StageOutcome::Continue("bad_dimensions");
        }

        let pseudo = self.settings.pseudo;
        let cells = image.pixels.iter().map(|v| pseudo.elevation(*v)).collect();
        match ElevationGrid::from_bounds(
            window.bbox,
            window.width,
            window.height,
            SERVING_EPSG,
            options.nodata,
            cells,
        ) {
            Ok(grid) => StageOutcome::Resolved(ResolvedTile {
                grid,
                provenance: Provenance::Approximated,
                source: REMOTE_IMAGE_SOURCE.to_string(),
            }),
            Err(e) => StageOutcome::Fatal(e),
        }
    }
}

fn record_fallthrough(stage: Stage, reason: &'static str) {
    metrics::counter!(
        metric_defs::STAGE_FALLTHROUGH.name,
        "stage" => stage.label(),
        "reason" => reason
    )
    .increment(1);
}

fn timed_resample<F>(f: F) -> Result<ElevationGrid>
where
    F: FnOnce() -> Result<ElevationGrid>,
{
    let start = Instant::now();
    let result = f();
    metrics::histogram!(metric_defs::RESAMPLE_TIME.name).record(start.elapsed().as_micros() as f64);
    result
}
