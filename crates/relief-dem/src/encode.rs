//! Wire formats for tile grids.
//!
//! - `raw`: row-major little-endian `f32`, nodata written verbatim.
//! - `rgb-elevation`: lossless PNG where each pixel packs the elevation as
//!   `(v + 32768) = r * 256 + g + b / 256`.

use crate::grid::ElevationGrid;
use crate::{ReliefError, Result};
use image::{DynamicImage, ImageOutputFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

/// Content type of `raw` tiles.
pub const RAW_CONTENT_TYPE: &str = "application/octet-stream";

/// Content type of `rgb-elevation` tiles.
pub const PNG_CONTENT_TYPE: &str = "image/png";

/// Tile serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TileFormat {
    /// Little-endian `f32` cells.
    Raw,
    /// Elevation packed into RGB channels of a PNG.
    #[default]
    RgbElevation,
}

impl TileFormat {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TileFormat::Raw => "raw",
            TileFormat::RgbElevation => "rgb-elevation",
        }
    }

    pub const fn content_type(&self) -> &'static str {
        match self {
            TileFormat::Raw => RAW_CONTENT_TYPE,
            TileFormat::RgbElevation => PNG_CONTENT_TYPE,
        }
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TileFormat {
    type Err = ReliefError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" | "float32" => Ok(TileFormat::Raw),
            "rgb-elevation" | "terrarium" => Ok(TileFormat::RgbElevation),
            other => Err(ReliefError::InvalidParameter(format!(
                "unknown tile format {:?}",
                other
            ))),
        }
    }
}

/// An encoded tile ready for transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTile {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

/// Encode a grid in the requested format.
pub fn encode(grid: &ElevationGrid, format: TileFormat) -> Result<EncodedTile> {
    let bytes = match format {
        TileFormat::Raw => encode_raw(grid.cells()),
        TileFormat::RgbElevation => {
            let (width, height) = grid.dimensions();
            encode_rgb_elevation(grid.cells(), width, height)?
        }
    };
    Ok(EncodedTile {
        bytes,
        content_type: format.content_type(),
    })
}

/// Row-major little-endian `f32`.
pub fn encode_raw(cells: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(cells.len() * 4);
    for v in cells {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Inverse of [`encode_raw`].
pub fn decode_raw(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(ReliefError::DecodeError(format!(
            "raw tile length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Pack one elevation into `(r, g, b)`.
///
/// All arithmetic is `f32` and the final casts truncate, so the byte
/// values are exactly reproducible by clients decoding with
/// `r * 256 + g + b / 256 - 32768`.
pub fn rgb_elevation_pixel(v: f32) -> [u8; 3] {
    let shifted = (v + 32768.0).clamp(0.0, 65535.0);
    let r = (shifted / 256.0).floor();
    let g = shifted - r * 256.0;
    let b = ((shifted - shifted.floor()) * 256.0).floor();
    [r as u8, g as u8, b as u8]
}

/// Unpack `(r, g, b)` into an elevation.
pub fn rgb_elevation_value(rgb: [u8; 3]) -> f32 {
    rgb[0] as f32 * 256.0 + rgb[1] as f32 + rgb[2] as f32 / 256.0 - 32768.0
}

/// PNG of packed elevations.
pub fn encode_rgb_elevation(cells: &[f32], width: usize, height: usize) -> Result<Vec<u8>> {
    if cells.len() != width * height {
        return Err(ReliefError::InvalidParameter(format!(
            "expected {} cells for a {}x{} tile, got {}",
            width * height,
            width,
            height,
            cells.len()
        )));
    }

    let mut pixels = Vec::with_capacity(cells.len() * 3);
    for v in cells {
        // NaN clamps to NaN and casts to 0
        pixels.extend_from_slice(&rgb_elevation_pixel(*v));
    }

    let image = RgbImage::from_raw(width as u32, height as u32, pixels).ok_or_else(|| {
        ReliefError::InvalidParameter(format!("cannot build a {}x{} image", width, height))
    })?;

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image).write_to(&mut out, ImageOutputFormat::Png)?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::BoundingBox;
    use crate::grid::DEFAULT_NODATA;

    #[test]
    fn test_pixel_packing() {
        assert_eq!(rgb_elevation_pixel(0.0), [128, 0, 0]);
        assert_eq!(rgb_elevation_pixel(312.5), [129, 56, 128]);
        assert_eq!(rgb_elevation_pixel(-32768.0), [0, 0, 0]);
        // Clamped at both ends
        assert_eq!(rgb_elevation_pixel(-40000.0), [0, 0, 0]);
        assert_eq!(rgb_elevation_pixel(40000.0), [255, 255, 0]);
    }

    #[test]
    fn test_pixel_unpacking() {
        for v in [0.0f32, 312.5, 1602.25, -12.75] {
            assert_eq!(rgb_elevation_value(rgb_elevation_pixel(v)), v);
        }
    }

    #[test]
    fn test_raw_decode_rejects_partial() {
        assert!(decode_raw(&[0, 0, 0]).is_err());
        assert_eq!(decode_raw(&[]).unwrap(), Vec::<f32>::new());
    }

    #[test]
    fn test_png_is_deterministic() {
        let cells: Vec<f32> = (0..16).map(|i| 250.0 + i as f32 * 0.5).collect();
        let a = encode_rgb_elevation(&cells, 4, 4).unwrap();
        let b = encode_rgb_elevation(&cells, 4, 4).unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[..8], b"\x89PNG\r\n\x1a\n");

        let decoded = image::load_from_memory(&a).unwrap().to_rgb8();
        assert_eq!(decoded.get_pixel(1, 0).0, rgb_elevation_pixel(250.5));
    }

    #[test]
    fn test_encode_content_types() {
        let bbox = BoundingBox::new(0.0, 0.0, 2.0, 2.0).unwrap();
        let grid = ElevationGrid::from_bounds(bbox, 2, 2, 3857, DEFAULT_NODATA, vec![1.0, 2.0, 3.0, DEFAULT_NODATA]).unwrap();

        let raw = encode(&grid, TileFormat::Raw).unwrap();
        assert_eq!(raw.content_type, "application/octet-stream");
        assert_eq!(decode_raw(&raw.bytes).unwrap(), grid.cells());

        let png = encode(&grid, TileFormat::RgbElevation).unwrap();
        assert_eq!(png.content_type, "image/png");
    }

    #[test]
    fn test_format_names() {
        assert_eq!("raw".parse::<TileFormat>().unwrap(), TileFormat::Raw);
        assert_eq!("terrarium".parse::<TileFormat>().unwrap(), TileFormat::RgbElevation);
        assert!("jpeg".parse::<TileFormat>().is_err());
        assert_eq!(TileFormat::RgbElevation.to_string(), "rgb-elevation");
    }
}
