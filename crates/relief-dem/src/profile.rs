//! Elevation profiles along a path.
//!
//! The path is projected into the source's CRS, measured there, and sampled
//! at equal arc-length fractions. Each sample is mapped back to lon/lat.

use crate::catalog::CoverageCatalog;
use crate::crs::{TransformCache, GEOGRAPHIC_EPSG};
use crate::grid::ElevationGrid;
use crate::{ReliefError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One point of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProfileSample {
    /// Distance from the start of the path in meters.
    pub distance_m: f64,
    /// Elevation in meters, `None` where the source has no usable value.
    pub elevation_m: Option<f32>,
    pub lat: f64,
    pub lon: f64,
}

/// Sampling density and validity threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    /// Target spacing between samples in meters.
    pub spacing_m: f64,
    pub min_samples: usize,
    pub max_samples: usize,
    /// Elevations below this are reported as absent.
    pub nodata_threshold: f32,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            spacing_m: 2.0,
            min_samples: 10,
            max_samples: 200,
            nodata_threshold: -1000.0,
        }
    }
}

impl ProfileSettings {
    /// Number of samples for a path of `length_m` meters.
    pub fn sample_count(&self, length_m: f64) -> usize {
        let wanted = (length_m / self.spacing_m).floor();
        let wanted = if wanted.is_finite() && wanted > 0.0 {
            wanted as usize
        } else {
            0
        };
        wanted.clamp(self.min_samples, self.max_samples)
    }
}

/// Something that can be asked for elevations at points of one CRS.
pub trait ElevationSource {
    /// EPSG code of the coordinates passed to [`elevation_at`](Self::elevation_at).
    fn epsg(&self) -> u16;

    /// Elevation at a point, `None` if there is no data.
    fn elevation_at(&self, x: f64, y: f64) -> Option<f32>;
}

impl ElevationSource for ElevationGrid {
    fn epsg(&self) -> u16 {
        ElevationGrid::epsg(self)
    }

    fn elevation_at(&self, x: f64, y: f64) -> Option<f32> {
        self.sample_bilinear(x, y)
    }
}

/// Catalog entries queried in registration order; the first value wins.
#[derive(Debug)]
pub struct CatalogSource<'a> {
    catalog: &'a CoverageCatalog,
    epsg: u16,
}

impl<'a> CatalogSource<'a> {
    /// Query `catalog` with coordinates in `epsg`.
    pub fn new(catalog: &'a CoverageCatalog, epsg: u16) -> Self {
        Self { catalog, epsg }
    }
}

impl ElevationSource for CatalogSource<'_> {
    fn epsg(&self) -> u16 {
        self.epsg
    }

    fn elevation_at(&self, x: f64, y: f64) -> Option<f32> {
        let point = crate::bounds::BoundingBox {
            left: x,
            bottom: y,
            right: x,
            top: y,
        };
        let entries = self.catalog.find_overlapping(point, self.epsg).ok()?;
        for entry in entries.flatten() {
            let value = (|| {
                let (ex, ey) = self
                    .catalog
                    .transforms()
                    .get(self.epsg, entry.epsg())
                    .ok()?
                    .forward(x, y)
                    .ok()?;
                entry.grid().ok()?.sample_bilinear(ex, ey)
            })();
            if value.is_some() {
                return value;
            }
        }
        None
    }
}

/// Sample `source` along a path of `(lon, lat)` vertices.
///
/// Distances are non-decreasing, start at 0 and end at the projected path
/// length.
pub fn sample_profile(
    path: &[(f64, f64)],
    source: &dyn ElevationSource,
    transforms: &TransformCache,
    settings: &ProfileSettings,
) -> Result<Vec<ProfileSample>> {
    if path.len() < 2 {
        return Err(ReliefError::InvalidParameter(format!(
            "a profile needs at least 2 points, got {}",
            path.len()
        )));
    }
    if let Some((lon, lat)) = path
        .iter()
        .find(|(lon, lat)| !lon.is_finite() || !lat.is_finite() || lat.abs() > 90.0)
    {
        return Err(ReliefError::InvalidParameter(format!(
            "invalid path vertex ({}, {})",
            lon, lat
        )));
    }

    let transform = transforms.get(GEOGRAPHIC_EPSG, source.epsg())?;
    let projected = path
        .iter()
        .map(|(lon, lat)| transform.forward(*lon, *lat))
        .collect::<Result<Vec<_>>>()?;

    // Cumulative length at each vertex
    let mut cumulative = Vec::with_capacity(projected.len());
    let mut total = 0.0;
    cumulative.push(0.0);
    for pair in projected.windows(2) {
        let (dx, dy) = (pair[1].0 - pair[0].0, pair[1].1 - pair[0].1);
        total += dx.hypot(dy);
        cumulative.push(total);
    }

    let count = settings.sample_count(total);
    debug!(length_m = total, count, "Sampling profile");

    let mut samples = Vec::with_capacity(count);
    let mut segment = 0;
    for i in 0..count {
        let distance = if i + 1 == count {
            total
        } else {
            total * i as f64 / (count - 1) as f64
        };

        while segment + 2 < cumulative.len() && cumulative[segment + 1] < distance {
            segment += 1;
        }
        let seg_len = cumulative[segment + 1] - cumulative[segment];
        let t = if seg_len > 0.0 {
            ((distance - cumulative[segment]) / seg_len).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let (x0, y0) = projected[segment];
        let (x1, y1) = projected[segment + 1];
        let (x, y) = (x0 + t * (x1 - x0), y0 + t * (y1 - y0));

        let (lon, lat) = transform.inverse(x, y)?;
        let elevation = source
            .elevation_at(x, y)
            .filter(|v| *v >= settings.nodata_threshold);

        samples.push(ProfileSample {
            distance_m: distance,
            elevation_m: elevation,
            lat,
            lon,
        });
    }

    Ok(samples)
}
