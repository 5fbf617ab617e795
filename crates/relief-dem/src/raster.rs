//! Point-cloud rasterization.
//!
//! Samples are binned into square cells anchored at the samples' minimum x
//! and maximum y. Each cell holds the running mean of the samples that fell
//! into it; cells that received none keep the nodata sentinel.

use crate::grid::{ElevationGrid, DEFAULT_NODATA};
use crate::{ReliefError, Result};
use tracing::debug;

/// Largest grid the rasterizer will allocate, in cells.
pub const MAX_GRID_CELLS: usize = 1 << 28;

/// A single lidar return in the native projected CRS; `z` is meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Sample {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Rasterize samples onto a grid with `DEFAULT_NODATA` as the sentinel.
pub fn rasterize(samples: &[Sample], cell_size: f64, epsg: u16) -> Result<ElevationGrid> {
    rasterize_with_nodata(samples, cell_size, epsg, DEFAULT_NODATA)
}

/// Rasterize samples onto a grid of `cell_size` cells.
///
/// The grid is `floor((maxx - minx) / cell_size) + 1` cells wide and
/// `floor((maxy - miny) / cell_size) + 1` cells tall. Non-finite samples
/// are ignored. Grids above [`MAX_GRID_CELLS`] are rejected with
/// [`ReliefError::InvalidParameter`].
pub fn rasterize_with_nodata(
    samples: &[Sample],
    cell_size: f64,
    epsg: u16,
    nodata: f32,
) -> Result<ElevationGrid> {
    if !(cell_size.is_finite() && cell_size > 0.0) {
        return Err(ReliefError::InvalidParameter(format!(
            "cell size must be a positive number, got {}",
            cell_size
        )));
    }

    let finite = || {
        samples
            .iter()
            .filter(|s| s.x.is_finite() && s.y.is_finite() && s.z.is_finite())
    };

    let (mut minx, mut miny) = (f64::INFINITY, f64::INFINITY);
    let (mut maxx, mut maxy) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for s in finite() {
        minx = minx.min(s.x);
        miny = miny.min(s.y);
        maxx = maxx.max(s.x);
        maxy = maxy.max(s.y);
    }
    if minx > maxx {
        return Err(ReliefError::EmptyInput);
    }

    let width = cells_along(maxx - minx, cell_size)?;
    let height = cells_along(maxy - miny, cell_size)?;
    let len = width
        .checked_mul(height)
        .filter(|len| *len <= MAX_GRID_CELLS)
        .ok_or_else(|| too_large(width as f64, height as f64, cell_size))?;

    let mut means = vec![0.0f64; len];
    let mut counts = vec![0u32; len];

    for s in finite() {
        let col = ((s.x - minx) / cell_size).floor();
        let row = ((maxy - s.y) / cell_size).floor();
        if col < 0.0 || row < 0.0 || col >= width as f64 || row >= height as f64 {
            continue;
        }
        let idx = row as usize * width + col as usize;
        let n = counts[idx] as f64;
        means[idx] = (means[idx] * n + s.z) / (n + 1.0);
        counts[idx] += 1;
    }

    let cells: Vec<f32> = means
        .iter()
        .zip(&counts)
        .map(|(mean, count)| if *count > 0 { *mean as f32 } else { nodata })
        .collect();

    let filled = counts.iter().filter(|c| **c > 0).count();
    debug!(
        samples = samples.len(),
        width,
        height,
        filled,
        "Rasterized point cloud"
    );

    ElevationGrid::new(minx, maxy, cell_size, width, height, epsg, nodata, cells)
}

/// Cells needed to span `extent` at `cell_size`, bounded by the grid budget.
fn cells_along(extent: f64, cell_size: f64) -> Result<usize> {
    let cells = (extent / cell_size).floor() + 1.0;
    if !(cells.is_finite() && cells <= MAX_GRID_CELLS as f64) {
        return Err(too_large(cells, 1.0, cell_size));
    }
    Ok(cells as usize)
}

fn too_large(width: f64, height: f64, cell_size: f64) -> ReliefError {
    ReliefError::InvalidParameter(format!(
        "a {}x{} grid at cell size {} exceeds {} cells",
        width, height, cell_size, MAX_GRID_CELLS
    ))
}
