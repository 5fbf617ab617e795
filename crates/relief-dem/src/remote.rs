//! Remote elevation services.
//!
//! Two kinds of service back the resolution chain when the local cache has
//! nothing: a coverage service answering with real elevation grids (OGC WCS
//! 1.0.0, GeoTIFF) and an image service answering with a grayscale shaded
//! relief (OGC WMS 1.3.0, PNG). Both are behind traits so the chain can be
//! driven by other implementations.

use crate::bounds::BoundingBox;
use crate::grid::{ElevationGrid, DEFAULT_NODATA};
use crate::{ReliefError, Result};
use image::imageops::FilterType;
use relief_metrics::metric_defs;
use std::time::Duration;
use tracing::{debug, warn};

/// A service returning elevation grids for a bbox.
pub trait CoverageService: Send + Sync {
    /// Fetch a `width`x`height` elevation grid covering `bbox` in `epsg`.
    fn fetch_coverage(
        &self,
        bbox: &BoundingBox,
        epsg: u16,
        width: usize,
        height: usize,
    ) -> Result<ElevationGrid>;
}

/// A service returning grayscale images for a bbox.
pub trait ImageService: Send + Sync {
    /// Fetch a `width`x`height` grayscale image covering `bbox` in `epsg`.
    fn fetch_image(
        &self,
        bbox: &BoundingBox,
        epsg: u16,
        width: usize,
        height: usize,
    ) -> Result<GrayImage>;
}

/// Row-major 8-bit intensities, row 0 at the top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl GrayImage {
    /// Decode a PNG (or any format the `image` crate reads) to grayscale,
    /// resizing to `width`x`height` if the server answered with another size.
    pub fn decode(bytes: &[u8], width: usize, height: usize) -> Result<Self> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| ReliefError::DecodeError(format!("image response: {e}")))?;
        let mut luma = decoded.to_luma8();
        if luma.width() as usize != width || luma.height() as usize != height {
            debug!(
                got_width = luma.width(),
                got_height = luma.height(),
                width,
                height,
                "Resizing image response"
            );
            luma = image::imageops::resize(&luma, width as u32, height as u32, FilterType::Triangle);
        }
        Ok(Self {
            width,
            height,
            pixels: luma.into_raw(),
        })
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("relief/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

fn record_request(service: &'static str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    metrics::counter!(
        metric_defs::REMOTE_REQUESTS.name,
        "service" => service,
        "outcome" => outcome
    )
    .increment(1);
}

fn get_bytes(
    client: &reqwest::blocking::Client,
    url: &str,
    params: &[(&str, String)],
) -> Result<Vec<u8>> {
    let response = client.get(url).query(params).send()?;
    if !response.status().is_success() {
        return Err(ReliefError::RemoteUnavailable(format!(
            "{} answered HTTP {}",
            url,
            response.status()
        )));
    }
    Ok(response.bytes()?.to_vec())
}

/// OGC WCS 1.0.0 client requesting GeoTIFF coverages.
#[derive(Debug, Clone)]
pub struct WcsClient {
    url: String,
    coverage: String,
    client: reqwest::blocking::Client,
}

impl WcsClient {
    /// Create a client for `coverage` at `url`.
    pub fn new(url: impl Into<String>, coverage: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            coverage: coverage.into(),
            client: build_client(timeout)?,
        })
    }

    /// Query parameters of a GetCoverage request.
    pub fn query(&self, bbox: &BoundingBox, epsg: u16, width: usize, height: usize) -> Vec<(&'static str, String)> {
        let crs = format!("EPSG:{epsg}");
        vec![
            ("SERVICE", "WCS".to_string()),
            ("VERSION", "1.0.0".to_string()),
            ("REQUEST", "GetCoverage".to_string()),
            ("COVERAGE", self.coverage.clone()),
            (
                "BBOX",
                format!("{},{},{},{}", bbox.left, bbox.bottom, bbox.right, bbox.top),
            ),
            ("CRS", crs.clone()),
            ("RESPONSE_CRS", crs),
            ("FORMAT", "GeoTIFF".to_string()),
            ("WIDTH", width.to_string()),
            ("HEIGHT", height.to_string()),
        ]
    }
}

impl CoverageService for WcsClient {
    fn fetch_coverage(
        &self,
        bbox: &BoundingBox,
        epsg: u16,
        width: usize,
        height: usize,
    ) -> Result<ElevationGrid> {
        let params = self.query(bbox, epsg, width, height);
        let result = get_bytes(&self.client, &self.url, &params).and_then(|bytes| {
            // The response is georeferenced by the request
            ElevationGrid::from_geotiff_bytes_with_bounds(&bytes, *bbox, epsg, DEFAULT_NODATA)
        });

        record_request("coverage", result.is_ok());
        if let Err(e) = &result {
            warn!(url = %self.url, error = %e, "Coverage request failed");
        }
        result
    }
}

/// OGC WMS 1.3.0 client requesting PNG maps.
#[derive(Debug, Clone)]
pub struct WmsClient {
    url: String,
    layer: String,
    client: reqwest::blocking::Client,
}

impl WmsClient {
    /// Create a client for `layer` at `url`.
    pub fn new(url: impl Into<String>, layer: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            layer: layer.into(),
            client: build_client(timeout)?,
        })
    }

    /// Query parameters of a GetMap request.
    ///
    /// Projected CRS use easting/northing axis order, so the bbox is sent
    /// as `minx,miny,maxx,maxy`.
    pub fn query(&self, bbox: &BoundingBox, epsg: u16, width: usize, height: usize) -> Vec<(&'static str, String)> {
        vec![
            ("SERVICE", "WMS".to_string()),
            ("VERSION", "1.3.0".to_string()),
            ("REQUEST", "GetMap".to_string()),
            ("LAYERS", self.layer.clone()),
            ("STYLES", String::new()),
            (
                "BBOX",
                format!("{},{},{},{}", bbox.left, bbox.bottom, bbox.right, bbox.top),
            ),
            ("CRS", format!("EPSG:{epsg}")),
            ("WIDTH", width.to_string()),
            ("HEIGHT", height.to_string()),
            ("FORMAT", "image/png".to_string()),
            ("TRANSPARENT", "FALSE".to_string()),
        ]
    }
}

impl ImageService for WmsClient {
    fn fetch_image(
        &self,
        bbox: &BoundingBox,
        epsg: u16,
        width: usize,
        height: usize,
    ) -> Result<GrayImage> {
        let params = self.query(bbox, epsg, width, height);
        let result = get_bytes(&self.client, &self.url, &params)
            .and_then(|bytes| GrayImage::decode(&bytes, width, height));

        record_request("image", result.is_ok());
        if let Err(e) = &result {
            warn!(url = %self.url, error = %e, "Image request failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageOutputFormat, Luma};
    use std::io::Cursor;

    fn png(width: u32, height: u32, value: u8) -> Vec<u8> {
        let img = image::ImageBuffer::from_pixel(width, height, Luma([value]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img)
            .write_to(&mut out, ImageOutputFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_gray_decode() {
        let image = GrayImage::decode(&png(4, 4, 128), 4, 4).unwrap();
        assert_eq!(image.pixels.len(), 16);
        assert!(image.pixels.iter().all(|p| *p == 128));
    }

    #[test]
    fn test_gray_decode_resizes() {
        let image = GrayImage::decode(&png(8, 8, 77), 4, 4).unwrap();
        assert_eq!((image.width, image.height), (4, 4));
        assert!(image.pixels.iter().all(|p| *p == 77));
    }

    #[test]
    fn test_gray_decode_garbage() {
        assert!(matches!(
            GrayImage::decode(b"<ServiceException/>", 4, 4),
            Err(ReliefError::DecodeError(_))
        ));
    }

    #[test]
    fn test_wcs_query() {
        let client = WcsClient::new("http://localhost/wcs", "dmr5g", Duration::from_secs(1)).unwrap();
        let bbox = BoundingBox::new(-740_000.0, -1_041_000.0, -739_000.0, -1_040_000.0).unwrap();
        let params = client.query(&bbox, 5514, 256, 256);
        let get = |k: &str| params.iter().find(|(key, _)| *key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("COVERAGE"), Some("dmr5g"));
        assert_eq!(get("BBOX"), Some("-740000,-1041000,-739000,-1040000"));
        assert_eq!(get("RESPONSE_CRS"), Some("EPSG:5514"));
        assert_eq!(get("WIDTH"), Some("256"));
    }

    #[test]
    fn test_wms_query_axis_order() {
        let client = WmsClient::new("http://localhost/wms", "dmr5g:GrayscaleHillshade", Duration::from_secs(1)).unwrap();
        let bbox = BoundingBox::new(1_600_000.0, 6_440_000.0, 1_602_000.0, 6_442_000.0).unwrap();
        let params = client.query(&bbox, 3857, 256, 256);
        let bbox_param = params.iter().find(|(k, _)| *k == "BBOX").unwrap();
        assert_eq!(bbox_param.1, "1600000,6440000,1602000,6442000");
    }

    #[test]
    fn test_unreachable_service() {
        // Nothing listens on port 9 of the loopback interface
        let client = WmsClient::new("http://127.0.0.1:9/wms", "layer", Duration::from_millis(500)).unwrap();
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap();
        assert!(matches!(
            client.fetch_image(&bbox, 3857, 2, 2),
            Err(ReliefError::RemoteUnavailable(_))
        ));
    }
}
