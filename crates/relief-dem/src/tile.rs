//! Slippy-map tile addressing and destination windows.
//!
//! Uses the OpenStreetMap tile naming convention:
//! - `z` is the zoom level (0-30)
//! - `x` is the column (0 to 2^z - 1, from west to east)
//! - `y` is the row (0 to 2^z - 1, from north to south)
//!
//! Tile bounds are computed in degrees and then projected into Web Mercator,
//! the serving CRS.

use crate::bounds::BoundingBox;
use crate::crs::lonlat_to_mercator;
use crate::{ReliefError, Result};
use std::f64::consts::PI;
use std::fmt;

/// Maximum supported zoom level.
pub const MAX_ZOOM: u8 = 30;

/// Default tile edge length in pixels.
pub const DEFAULT_TILE_SIZE: usize = 256;

/// Latitude limit of Web Mercator, `atan(sinh(π))`.
const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// OSM-style tile coordinates (z, x, y).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    /// Zoom level.
    pub z: u8,
    /// X coordinate (column, 0 at 180°W, increases eastward).
    pub x: u32,
    /// Y coordinate (row, 0 at ~85.05°N, increases southward).
    pub y: u32,
}

impl TileCoord {
    /// Create a tile coordinate, rejecting negative or out-of-range values.
    pub fn new(z: i32, x: i64, y: i64) -> Result<Self> {
        if z < 0 || z > MAX_ZOOM as i32 {
            return Err(ReliefError::InvalidParameter(format!(
                "zoom {} outside 0..={}",
                z, MAX_ZOOM
            )));
        }
        let n = 1i64 << z;
        if !(0..n).contains(&x) || !(0..n).contains(&y) {
            return Err(ReliefError::InvalidParameter(format!(
                "tile {}/{}/{} outside the {}x{} grid of zoom {}",
                z, x, y, n, n, z
            )));
        }
        Ok(Self {
            z: z as u8,
            x: x as u32,
            y: y as u32,
        })
    }

    /// Tile containing a longitude/latitude point.
    ///
    /// - x = floor((lon + 180) / 360 * 2^z)
    /// - y = floor((1 - ln(tan(lat) + sec(lat)) / π) / 2 * 2^z)
    pub fn from_lon_lat(lon: f64, lat: f64, z: u8) -> Result<Self> {
        if z > MAX_ZOOM {
            return Err(ReliefError::InvalidParameter(format!(
                "zoom {} outside 0..={}",
                z, MAX_ZOOM
            )));
        }
        if !(lon.is_finite() && lat.is_finite()) {
            return Err(ReliefError::InvalidParameter(format!(
                "invalid coordinate ({}, {})",
                lon, lat
            )));
        }

        let lat_clamped = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
        let n = (1u64 << z) as f64;

        let x = ((lon + 180.0) / 360.0 * n).floor();
        let lat_rad = lat_clamped.to_radians();
        let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n).floor();

        // Clamp to valid range (handles edge cases at exactly ±180°)
        let max_coord = n - 1.0;
        Ok(Self {
            z,
            x: x.clamp(0.0, max_coord) as u32,
            y: y.clamp(0.0, max_coord) as u32,
        })
    }

    /// Tile extent in degrees as `(left=west, bottom=south, right=east, top=north)`.
    pub fn lonlat_bounds(&self) -> BoundingBox {
        let n = (1u64 << self.z) as f64;

        let west = self.x as f64 / n * 360.0 - 180.0;
        let east = (self.x + 1) as f64 / n * 360.0 - 180.0;

        // Inverse of the Slippy Map formula
        let north = (PI * (1.0 - 2.0 * self.y as f64 / n)).sinh().atan().to_degrees();
        let south = (PI * (1.0 - 2.0 * (self.y as f64 + 1.0) / n))
            .sinh()
            .atan()
            .to_degrees();

        BoundingBox {
            left: west,
            bottom: south,
            right: east,
            top: north,
        }
    }

    /// Tile extent in Web Mercator meters.
    pub fn mercator_bounds(&self) -> BoundingBox {
        let lonlat = self.lonlat_bounds();
        let (left, bottom) = lonlat_to_mercator(lonlat.left, lonlat.bottom);
        let (right, top) = lonlat_to_mercator(lonlat.right, lonlat.top);
        BoundingBox {
            left,
            bottom,
            right,
            top,
        }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// A destination raster: an extent in some CRS plus fixed pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DestinationWindow {
    /// Extent covered by the outer pixel edges.
    pub bbox: BoundingBox,
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
}

impl DestinationWindow {
    /// Create a window, rejecting empty dimensions or a malformed bbox.
    pub fn new(bbox: BoundingBox, width: usize, height: usize) -> Result<Self> {
        bbox.validate()?;
        if width == 0 || height == 0 {
            return Err(ReliefError::InvalidParameter(format!(
                "window dimensions must be positive, got {}x{}",
                width, height
            )));
        }
        Ok(Self {
            bbox,
            width,
            height,
        })
    }

    /// Square window covering a tile in the serving CRS.
    pub fn for_tile(tile: &TileCoord, size: usize) -> Result<Self> {
        Self::new(tile.mercator_bounds(), size, size)
    }

    /// Pixel spacing `(x, y)` in CRS units.
    pub fn resolution(&self) -> (f64, f64) {
        (
            self.bbox.width() / self.width as f64,
            self.bbox.height() / self.height as f64,
        )
    }

    /// CRS coordinate of a pixel center; row 0 is the top row.
    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        let (dx, dy) = self.resolution();
        (
            self.bbox.left + (col as f64 + 0.5) * dx,
            self.bbox.top - (row as f64 + 0.5) * dy,
        )
    }

    /// Number of pixels.
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    /// Always false for a constructed window.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
