//! Point-cloud file readers.
//!
//! Supports ASCII XYZ (whitespace or comma separated) and uncompressed LAS
//! 1.0-1.4. Compressed LAZ files are recognised and rejected.

use crate::raster::Sample;
use crate::{ReliefError, Result};
use bytes::Buf;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::debug;

/// Size of the LAS 1.0-1.3 public header block fields we read.
const LAS_MIN_HEADER: usize = 227;

/// Offset of the 64-bit point count in LAS 1.4 headers.
const LAS14_POINT_COUNT_OFFSET: usize = 247;

/// Read samples from a point-cloud file, choosing the reader by extension.
pub fn read_points<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let samples = match extension.as_str() {
        "las" | "laz" => {
            let mut data = Vec::new();
            File::open(path)?.read_to_end(&mut data)?;
            parse_las(&data)?
        }
        _ => read_xyz(BufReader::new(File::open(path)?))?,
    };

    debug!(path = %path.display(), samples = samples.len(), "Read point cloud");
    Ok(samples)
}

/// Parse `x y z` lines. Blank lines and lines starting with `#` are skipped;
/// columns beyond the third are ignored.
pub fn read_xyz<R: BufRead>(reader: R) -> Result<Vec<Sample>> {
    let mut samples = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut fields = trimmed
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|f| !f.is_empty())
            .map(str::parse::<f64>);

        let mut next = || -> Result<f64> {
            fields
                .next()
                .and_then(|f| f.ok())
                .ok_or_else(|| ReliefError::DecodeError(format!("line {}: expected x y z", index + 1)))
        };
        let (x, y, z) = (next()?, next()?, next()?);
        samples.push(Sample::new(x, y, z));
    }
    Ok(samples)
}

/// Parse an in-memory LAS file.
pub fn parse_las(data: &[u8]) -> Result<Vec<Sample>> {
    if data.len() < LAS_MIN_HEADER || &data[..4] != b"LASF" {
        return Err(ReliefError::DecodeError("not a LAS file".to_string()));
    }

    let mut header = &data[24..];
    let version = (header.get_u8(), header.get_u8());

    let mut header = &data[94..];
    let header_size = header.get_u16_le() as usize;
    let point_offset = header.get_u32_le() as usize;
    let _vlr_count = header.get_u32_le();
    let point_format = header.get_u8();
    let record_length = header.get_u16_le() as usize;
    let legacy_count = header.get_u32_le() as u64;

    // LAZ marks compressed point formats with the two high bits
    if point_format & 0xC0 != 0 {
        return Err(ReliefError::DecodeError(
            "compressed LAZ point data is not supported".to_string(),
        ));
    }
    if record_length < 12 {
        return Err(ReliefError::DecodeError(format!(
            "point record length {} is too short",
            record_length
        )));
    }

    let mut scales = &data[131..];
    let (sx, sy, sz) = (scales.get_f64_le(), scales.get_f64_le(), scales.get_f64_le());
    let (ox, oy, oz) = (scales.get_f64_le(), scales.get_f64_le(), scales.get_f64_le());

    let extended_header = header_size >= LAS14_POINT_COUNT_OFFSET + 8
        && data.len() >= LAS14_POINT_COUNT_OFFSET + 8;
    let count = if legacy_count == 0 && version >= (1, 4) && extended_header {
        let mut extended = &data[LAS14_POINT_COUNT_OFFSET..];
        extended.get_u64_le()
    } else {
        legacy_count
    };

    let needed = (count as usize)
        .checked_mul(record_length)
        .and_then(|n| n.checked_add(point_offset));
    if needed.map_or(true, |n| n > data.len()) {
        return Err(ReliefError::DecodeError(format!(
            "file holds fewer than the {} points its header declares",
            count
        )));
    }

    let mut samples = Vec::with_capacity(count as usize);
    for record in data[point_offset..].chunks_exact(record_length).take(count as usize) {
        let mut record = record;
        let x = record.get_i32_le() as f64 * sx + ox;
        let y = record.get_i32_le() as f64 * sy + oy;
        let z = record.get_i32_le() as f64 * sz + oz;
        samples.push(Sample::new(x, y, z));
    }

    debug!(
        version = %format!("{}.{}", version.0, version.1),
        point_format,
        count,
        "Parsed LAS points"
    );
    Ok(samples)
}
