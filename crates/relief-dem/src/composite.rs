//! Resampling source grids onto destination windows.
//!
//! Every destination pixel center is mapped into the source CRS and sampled
//! bilinearly from the four nearest source cells. Rows are independent and
//! processed in parallel.

use crate::crs::CrsTransform;
use crate::grid::ElevationGrid;
use crate::tile::DestinationWindow;
use crate::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Inclusive range of elevations accepted as real terrain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlausibleRange {
    /// Lowest accepted elevation in meters.
    pub min: f32,
    /// Highest accepted elevation in meters.
    pub max: f32,
}

impl Default for PlausibleRange {
    fn default() -> Self {
        Self {
            min: -1000.0,
            max: 3000.0,
        }
    }
}

impl PlausibleRange {
    /// Whether `value` falls inside the range.
    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Resample a grid already in the window's CRS.
pub fn resample(
    source: &ElevationGrid,
    window: &DestinationWindow,
    nodata: f32,
    range: PlausibleRange,
) -> Result<ElevationGrid> {
    if !source.bounds().overlaps(&window.bbox) {
        return empty(window, source.epsg(), nodata);
    }
    resample_with(source, window, source.epsg(), nodata, range, |x, y| Some((x, y)))
}

/// Resample a grid into a window in another CRS.
///
/// `transform` maps window coordinates into the source grid's CRS. A window
/// whose extent cannot be mapped is a [`ReliefError::Projection`] error.
pub fn reproject(
    source: &ElevationGrid,
    window: &DestinationWindow,
    transform: &CrsTransform,
    nodata: f32,
    range: PlausibleRange,
) -> Result<ElevationGrid> {
    let extent = transform.transform_bbox(&window.bbox)?;
    if !extent.overlaps(&source.bounds()) {
        return empty(window, transform.source_epsg(), nodata);
    }

    resample_with(
        source,
        window,
        transform.source_epsg(),
        nodata,
        range,
        |x, y| transform.forward(x, y).ok(),
    )
}

/// Resample with an arbitrary pixel-center mapping into source coordinates.
///
/// `to_source` returning `None` leaves that pixel as nodata. The result is a
/// grid over `window.bbox` tagged with `dest_epsg`.
pub fn resample_with<F>(
    source: &ElevationGrid,
    window: &DestinationWindow,
    dest_epsg: u16,
    nodata: f32,
    range: PlausibleRange,
    to_source: F,
) -> Result<ElevationGrid>
where
    F: Fn(f64, f64) -> Option<(f64, f64)> + Sync,
{
    let mut values = vec![nodata; window.len()];

    values
        .par_chunks_mut(window.width)
        .enumerate()
        .for_each(|(row, out)| {
            for (col, pixel) in out.iter_mut().enumerate() {
                let (x, y) = window.pixel_center(col, row);
                let sampled = to_source(x, y).and_then(|(sx, sy)| source.sample_bilinear(sx, sy));
                if let Some(v) = sampled {
                    if range.contains(v) {
                        *pixel = v;
                    }
                }
            }
        });

    trace!(
        width = window.width,
        height = window.height,
        "Resampled source grid"
    );

    ElevationGrid::from_bounds(window.bbox, window.width, window.height, dest_epsg, nodata, values)
}

fn empty(window: &DestinationWindow, epsg: u16, nodata: f32) -> Result<ElevationGrid> {
    ElevationGrid::from_bounds(
        window.bbox,
        window.width,
        window.height,
        epsg,
        nodata,
        vec![nodata; window.len()],
    )
}
