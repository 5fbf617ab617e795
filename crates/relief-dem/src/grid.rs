//! Regular elevation grids and their GeoTIFF representation.

use crate::bounds::BoundingBox;
use crate::crs::is_geographic;
use crate::{ReliefError, Result};
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::Gray32Float;
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;

/// Sentinel written into cells without a valid elevation.
pub const DEFAULT_NODATA: f32 = -32768.0;

// GeoTIFF tag IDs (not in the standard tiff crate)
const GEOTIFF_MODELPIXELSCALE: u16 = 33550;
const GEOTIFF_MODELTIEPOINT: u16 = 33922;
const GEOTIFF_GEOKEYDIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

// GeoKey IDs and values
const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// A regular grid of elevations in a projected (or geographic) CRS.
///
/// Cells are stored row-major, north to south, west to east: row 0 is the
/// top of the image even though the CRS y-axis grows northward. The cell at
/// `(col, row)` is centered on
/// `(left + (col + 0.5) * cell_width, top - (row + 0.5) * cell_height)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ElevationGrid {
    /// West edge of the grid.
    left: f64,
    /// North edge of the grid.
    top: f64,
    /// Cell spacing along x, in CRS units.
    cell_width: f64,
    /// Cell spacing along y, in CRS units.
    cell_height: f64,
    width: usize,
    height: usize,
    /// EPSG code of the grid's CRS.
    epsg: u16,
    /// The magic value used for "no measurement in this cell".
    nodata: f32,
    cells: Vec<f32>,
}

/// Georeferencing read from a GeoTIFF without decoding its pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridHeader {
    /// Extent in the file's CRS.
    pub bounds: BoundingBox,
    /// Width in cells.
    pub width: usize,
    /// Height in cells.
    pub height: usize,
    /// EPSG code of the file's CRS.
    pub epsg: u16,
    /// No-data sentinel.
    pub nodata: f32,
}

impl ElevationGrid {
    /// Create a grid with square cells anchored at its top-left corner.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        left: f64,
        top: f64,
        cell_size: f64,
        width: usize,
        height: usize,
        epsg: u16,
        nodata: f32,
        cells: Vec<f32>,
    ) -> Result<Self> {
        Self::with_resolution(left, top, (cell_size, cell_size), width, height, epsg, nodata, cells)
    }

    /// Create a grid whose cells span `bounds` exactly.
    pub fn from_bounds(
        bounds: BoundingBox,
        width: usize,
        height: usize,
        epsg: u16,
        nodata: f32,
        cells: Vec<f32>,
    ) -> Result<Self> {
        bounds.validate()?;
        if width == 0 || height == 0 {
            return Err(ReliefError::InvalidParameter(format!(
                "grid dimensions must be positive, got {}x{}",
                width, height
            )));
        }
        let resolution = (
            bounds.width() / width as f64,
            bounds.height() / height as f64,
        );
        Self::with_resolution(bounds.left, bounds.top, resolution, width, height, epsg, nodata, cells)
    }

    /// Create a grid with independent x and y cell spacing.
    #[allow(clippy::too_many_arguments)]
    pub fn with_resolution(
        left: f64,
        top: f64,
        resolution: (f64, f64),
        width: usize,
        height: usize,
        epsg: u16,
        nodata: f32,
        cells: Vec<f32>,
    ) -> Result<Self> {
        let (cell_width, cell_height) = resolution;
        if !(cell_width.is_finite() && cell_width > 0.0 && cell_height.is_finite() && cell_height > 0.0)
        {
            return Err(ReliefError::InvalidParameter(format!(
                "cell size must be positive, got {}x{}",
                cell_width, cell_height
            )));
        }
        if width == 0 || height == 0 {
            return Err(ReliefError::InvalidParameter(format!(
                "grid dimensions must be positive, got {}x{}",
                width, height
            )));
        }
        if cells.len() != width * height {
            return Err(ReliefError::InvalidParameter(format!(
                "expected {} cells for a {}x{} grid, got {}",
                width * height,
                width,
                height,
                cells.len()
            )));
        }

        Ok(Self {
            left,
            top,
            cell_width,
            cell_height,
            width,
            height,
            epsg,
            nodata,
            cells,
        })
    }

    /// Get the dimensions of this grid in cells `(width, height)`.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Cell spacing `(x, y)` in CRS units.
    pub fn resolution(&self) -> (f64, f64) {
        (self.cell_width, self.cell_height)
    }

    /// Cell spacing along x. Grids produced by the rasterizer have square cells.
    pub fn cell_size(&self) -> f64 {
        self.cell_width
    }

    /// EPSG code of the grid's CRS.
    pub fn epsg(&self) -> u16 {
        self.epsg
    }

    /// The no-data sentinel.
    pub fn nodata(&self) -> f32 {
        self.nodata
    }

    /// Row-major cell values.
    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    /// Extent of the grid (outer cell edges).
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox {
            left: self.left,
            bottom: self.top - self.height as f64 * self.cell_height,
            right: self.left + self.width as f64 * self.cell_width,
            top: self.top,
        }
    }

    /// Whether `value` marks a missing measurement in this grid.
    pub fn is_nodata(&self, value: f32) -> bool {
        value == self.nodata || value.is_nan()
    }

    /// Raw cell value, including the sentinel.
    ///
    /// # Panics
    /// Panics if `col` or `row` are out of range.
    pub fn value(&self, col: usize, row: usize) -> f32 {
        self.cells[row * self.width + col]
    }

    /// Valid elevation at a cell, `None` for nodata or out-of-range indices.
    pub fn get(&self, col: usize, row: usize) -> Option<f32> {
        if col >= self.width || row >= self.height {
            return None;
        }
        let value = self.value(col, row);
        (!self.is_nodata(value)).then_some(value)
    }

    /// CRS coordinate of a cell's center.
    pub fn cell_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.left + (col as f64 + 0.5) * self.cell_width,
            self.top - (row as f64 + 0.5) * self.cell_height,
        )
    }

    /// Number of cells holding a valid elevation.
    pub fn valid_count(&self) -> usize {
        self.cells.iter().filter(|v| !self.is_nodata(**v)).count()
    }

    /// Elevation at a CRS coordinate using bilinear interpolation of cell centers.
    ///
    /// Returns `None` outside the grid or when any cell contributing a
    /// non-zero weight is nodata.
    pub fn sample_bilinear(&self, x: f64, y: f64) -> Option<f32> {
        let fx = snap((x - self.left) / self.cell_width - 0.5);
        let fy = snap((self.top - y) / self.cell_height - 0.5);

        // Half a cell of slack on each side: the outer half of an edge cell
        // belongs to the grid.
        let max_x = self.width as f64 - 0.5;
        let max_y = self.height as f64 - 0.5;
        if !(fx >= -0.5 && fx <= max_x && fy >= -0.5 && fy <= max_y) {
            return None;
        }

        let fx = fx.clamp(0.0, (self.width - 1) as f64);
        let fy = fy.clamp(0.0, (self.height - 1) as f64);

        let x0 = fx.floor() as usize;
        let y0 = fy.floor() as usize;
        let tx = fx - x0 as f64;
        let ty = fy - y0 as f64;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);

        let taps = [
            (x0, y0, (1.0 - tx) * (1.0 - ty)),
            (x1, y0, tx * (1.0 - ty)),
            (x0, y1, (1.0 - tx) * ty),
            (x1, y1, tx * ty),
        ];

        let mut acc = 0.0f64;
        for (col, row, weight) in taps {
            if weight == 0.0 {
                continue;
            }
            let value = self.get(col, row)?;
            acc += value as f64 * weight;
        }

        Some(acc as f32)
    }

    /// Load a grid from a GeoTIFF carrying georeferencing, CRS and nodata tags.
    pub fn from_geotiff<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::from_geotiff_reader(file)
    }

    /// Load a self-describing GeoTIFF from any seekable reader.
    pub fn from_geotiff_reader<R: Read + Seek>(reader: R) -> Result<Self> {
        let mut decoder = open_decoder(reader)?;
        let header = read_header(&mut decoder)?;
        let cells = decode_elevation_data(&mut decoder)?;
        Self::from_bounds(
            header.bounds,
            header.width,
            header.height,
            header.epsg,
            header.nodata,
            cells,
        )
    }

    /// Load a GeoTIFF from memory with an extent and CRS supplied by the caller.
    ///
    /// Use this for rasters whose georeferencing is known from the request
    /// that produced them (e.g., a coverage service answering for a bbox).
    /// A GDAL_NODATA tag, when present, is honoured.
    pub fn from_geotiff_bytes_with_bounds(
        bytes: &[u8],
        bounds: BoundingBox,
        epsg: u16,
        default_nodata: f32,
    ) -> Result<Self> {
        let mut decoder =
            open_decoder(Cursor::new(bytes)).map_err(|e| ReliefError::DecodeError(e.to_string()))?;
        let (width, height) = decoder
            .dimensions()
            .map_err(|e| ReliefError::DecodeError(e.to_string()))?;
        let nodata = read_nodata_value(&mut decoder).unwrap_or(default_nodata);
        let cells =
            decode_elevation_data(&mut decoder).map_err(|e| ReliefError::DecodeError(e.to_string()))?;
        Self::from_bounds(bounds, width as usize, height as usize, epsg, nodata, cells)
            .map_err(|e| ReliefError::DecodeError(e.to_string()))
    }

    /// Read only the georeferencing of a GeoTIFF file.
    pub fn read_geotiff_header<P: AsRef<Path>>(path: P) -> Result<GridHeader> {
        let file = File::open(path.as_ref())?;
        let mut decoder = open_decoder(file)?;
        read_header(&mut decoder)
    }

    /// Write the grid as a single-band Float32 GeoTIFF.
    pub fn write_geotiff<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        self.write_geotiff_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Write the grid as a GeoTIFF to any seekable writer.
    pub fn write_geotiff_to<W: Write + Seek>(&self, writer: W) -> Result<()> {
        let mut encoder = TiffEncoder::new(writer)?;
        let mut image = encoder.new_image::<Gray32Float>(self.width as u32, self.height as u32)?;

        let dir = image.encoder();
        let pixel_scale = [self.cell_width, self.cell_height, 0.0];
        dir.write_tag(Tag::Unknown(GEOTIFF_MODELPIXELSCALE), &pixel_scale[..])?;

        // Ties pixel (0, 0) to the top-left corner
        let tiepoint = [0.0, 0.0, 0.0, self.left, self.top, 0.0];
        dir.write_tag(Tag::Unknown(GEOTIFF_MODELTIEPOINT), &tiepoint[..])?;

        let geokeys = geokey_directory(self.epsg);
        dir.write_tag(Tag::Unknown(GEOTIFF_GEOKEYDIRECTORY), &geokeys[..])?;

        let nodata = format!("{}", self.nodata);
        dir.write_tag(Tag::Unknown(GDAL_NODATA), nodata.as_str())?;

        image.write_data(&self.cells)?;
        Ok(())
    }
}

/// Remove floating-point fuzz from pixel coordinates that land on a cell center.
fn snap(v: f64) -> f64 {
    let rounded = v.round();
    if (v - rounded).abs() < 1e-6 {
        rounded
    } else {
        v
    }
}

fn open_decoder<R: Read + Seek>(reader: R) -> Result<Decoder<R>> {
    let decoder = Decoder::new(reader)?;

    // Allow large lidar-derived grids
    let mut limits = Limits::default();
    limits.decoding_buffer_size = 1024 * 1024 * 1024; // 1 GB
    limits.intermediate_buffer_size = 1024 * 1024 * 1024; // 1 GB
    limits.ifd_value_size = 1024 * 1024 * 1024;
    Ok(decoder.with_limits(limits))
}

fn read_header<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<GridHeader> {
    let (width, height) = decoder.dimensions()?;
    let bounds = read_geotransform(decoder, width, height)?;
    let epsg = read_epsg(decoder)?;
    let nodata = read_nodata_value(decoder).unwrap_or(DEFAULT_NODATA);

    Ok(GridHeader {
        bounds,
        width: width as usize,
        height: height as usize,
        epsg,
        nodata,
    })
}

/// Read the extent from ModelTiepoint and ModelPixelScale.
fn read_geotransform<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    width: u32,
    height: u32,
) -> Result<BoundingBox> {
    let tiepoint = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(GEOTIFF_MODELTIEPOINT));
    let pixel_scale = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(GEOTIFF_MODELPIXELSCALE));

    match (tiepoint, pixel_scale) {
        (Ok(tiepoint), Ok(scale)) if tiepoint.len() >= 6 && scale.len() >= 2 => {
            // Tiepoint format: [i, j, k, x, y, z]; pixel (i, j) maps to (x, y)
            let left = tiepoint[3] - tiepoint[0] * scale[0];
            let top = tiepoint[4] + tiepoint[1] * scale[1];
            BoundingBox::new(
                left,
                top - height as f64 * scale[1],
                left + width as f64 * scale[0],
                top,
            )
        }
        _ => Err(ReliefError::DecodeError(
            "GeoTIFF is missing ModelTiepoint/ModelPixelScale tags".to_string(),
        )),
    }
}

/// Read the EPSG code from the GeoKeyDirectory, preferring the projected key.
fn read_epsg<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<u16> {
    let keys = decoder
        .get_tag_u16_vec(Tag::from_u16_exhaustive(GEOTIFF_GEOKEYDIRECTORY))
        .map_err(|_| ReliefError::DecodeError("GeoTIFF has no GeoKeyDirectory".to_string()))?;

    let count = keys.get(3).copied().unwrap_or(0) as usize;
    let mut projected = None;
    let mut geographic = None;
    for entry in keys.get(4..).unwrap_or(&[]).chunks_exact(4).take(count) {
        let (key_id, location, value) = (entry[0], entry[1], entry[3]);
        // Location 0 means the value is stored inline
        if location != 0 {
            continue;
        }
        match key_id {
            PROJECTED_CS_TYPE_GEO_KEY => projected = Some(value),
            GEOGRAPHIC_TYPE_GEO_KEY => geographic = Some(value),
            _ => {}
        }
    }

    projected
        .or(geographic)
        .ok_or_else(|| ReliefError::DecodeError("GeoTIFF does not declare an EPSG code".to_string()))
}

/// Try to read the no-data value from the GDAL_NODATA tag.
fn read_nodata_value<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f32> {
    let nodata = decoder.get_tag_ascii_string(Tag::from_u16_exhaustive(GDAL_NODATA)).ok()?;
    nodata.trim_matches(char::from(0)).trim().parse().ok()
}

fn geokey_directory(epsg: u16) -> Vec<u16> {
    let (model_type, crs_key) = if is_geographic(epsg) {
        (MODEL_TYPE_GEOGRAPHIC, GEOGRAPHIC_TYPE_GEO_KEY)
    } else {
        (MODEL_TYPE_PROJECTED, PROJECTED_CS_TYPE_GEO_KEY)
    };

    vec![
        1, 1, 0, 3, // version, revision, minor revision, number of keys
        GT_MODEL_TYPE_GEO_KEY, 0, 1, model_type,
        GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA,
        crs_key, 0, 1, epsg,
    ]
}

/// Decode elevation data from the TIFF decoder.
fn decode_elevation_data<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Vec<f32>> {
    let result = decoder.read_image()?;

    match result {
        DecodingResult::F32(data) => Ok(data),
        DecodingResult::F64(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::I16(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::I32(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::U16(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::U32(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::U8(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::I8(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::U64(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::I64(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
    }
}
