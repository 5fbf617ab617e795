//! Coordinate transforms between the serving, geographic and native CRS.
//!
//! A [`CrsTransform`] is built once per CRS pair and reused; the
//! [`TransformCache`] hands out shared instances keyed by `(from, to)`.
//! Geographic coordinates are always degrees in the public API, ordered
//! `(lon, lat)`.

use crate::bounds::BoundingBox;
use crate::{ReliefError, Result};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Web Mercator, the tiling projection.
pub const SERVING_EPSG: u16 = 3857;

/// WGS 84 longitude/latitude.
pub const GEOGRAPHIC_EPSG: u16 = 4326;

/// S-JTSK / Krovak East North, the native CRS of the lidar archive.
pub const DEFAULT_NATIVE_EPSG: u16 = 5514;

/// Radius of the Web Mercator sphere in meters.
const EARTH_RADIUS: f64 = 6_378_137.0;

/// Points sampled along each bbox edge when transforming extents.
const BBOX_DENSIFY_POINTS: usize = 21;

/// PROJ string for an EPSG code from the crs-definitions database.
pub fn proj_string(epsg: u16) -> Option<&'static str> {
    crs_definitions::from_code(epsg).map(|def| def.proj4)
}

/// Check if an EPSG code is a geographic (lon/lat) CRS.
pub fn is_geographic(epsg: u16) -> bool {
    match proj_string(epsg) {
        Some(proj) => proj.contains("+proj=longlat"),
        None => epsg == GEOGRAPHIC_EPSG || (4000..5000).contains(&epsg),
    }
}

/// How one side's coordinates enter and leave proj4rs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axes {
    Projected,
    /// Degrees in the API, radians inside proj4rs.
    Geographic,
    /// Web Mercator meters, converted in closed form around a lon/lat definition.
    WebMercator,
}

struct Side {
    proj: Proj,
    axes: Axes,
}

impl Side {
    fn build(epsg: u16, override_def: Option<&str>) -> Result<Self> {
        if epsg == SERVING_EPSG && override_def.is_none() {
            let def = resolve_definition(GEOGRAPHIC_EPSG, None)?;
            return Ok(Self {
                proj: parse_proj(epsg, def)?,
                axes: Axes::WebMercator,
            });
        }

        let def = resolve_definition(epsg, override_def)?;
        let axes = if def.contains("+proj=longlat") {
            Axes::Geographic
        } else {
            Axes::Projected
        };
        Ok(Self {
            proj: parse_proj(epsg, def)?,
            axes,
        })
    }

    /// API coordinates to proj4rs input.
    fn enter(&self, x: f64, y: f64) -> (f64, f64) {
        match self.axes {
            Axes::Projected => (x, y),
            Axes::Geographic => (x.to_radians(), y.to_radians()),
            Axes::WebMercator => {
                let (lon, lat) = mercator_to_lonlat(x, y);
                (lon.to_radians(), lat.to_radians())
            }
        }
    }

    /// proj4rs output to API coordinates.
    fn leave(&self, x: f64, y: f64) -> (f64, f64) {
        match self.axes {
            Axes::Projected => (x, y),
            Axes::Geographic => (x.to_degrees(), y.to_degrees()),
            Axes::WebMercator => lonlat_to_mercator(x.to_degrees(), y.to_degrees()),
        }
    }
}

enum Engine {
    Identity,
    /// Closed-form spherical Mercator; `to_mercator` is the forward direction.
    WebMercator { to_mercator: bool },
    Proj { source: Side, target: Side },
}

/// A bidirectional transform between two CRS.
pub struct CrsTransform {
    from: u16,
    to: u16,
    engine: Engine,
}

impl std::fmt::Debug for CrsTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrsTransform")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

impl CrsTransform {
    /// Build a transform between two EPSG codes known to crs-definitions.
    pub fn new(from: u16, to: u16) -> Result<Self> {
        Self::with_definitions(from, None, to, None)
    }

    /// Build a transform, overriding either side's PROJ definition.
    pub fn with_definitions(
        from: u16,
        from_def: Option<&str>,
        to: u16,
        to_def: Option<&str>,
    ) -> Result<Self> {
        let engine = if from == to {
            Engine::Identity
        } else if from_def.is_none() && to_def.is_none() && is_mercator_pair(from, to) {
            Engine::WebMercator {
                to_mercator: to == SERVING_EPSG,
            }
        } else {
            Engine::Proj {
                source: Side::build(from, from_def)?,
                target: Side::build(to, to_def)?,
            }
        };

        debug!(from, to, "Built CRS transform");
        Ok(Self { from, to, engine })
    }

    /// Source EPSG code.
    pub fn source_epsg(&self) -> u16 {
        self.from
    }

    /// Target EPSG code.
    pub fn target_epsg(&self) -> u16 {
        self.to
    }

    /// Transform a point from the source to the target CRS.
    pub fn forward(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        match &self.engine {
            Engine::Identity => Ok((x, y)),
            Engine::WebMercator { to_mercator: true } => Ok(lonlat_to_mercator(x, y)),
            Engine::WebMercator { to_mercator: false } => Ok(mercator_to_lonlat(x, y)),
            Engine::Proj { source, target } => run_proj(source, target, x, y),
        }
    }

    /// Transform a point from the target back to the source CRS.
    pub fn inverse(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        match &self.engine {
            Engine::Identity => Ok((x, y)),
            Engine::WebMercator { to_mercator: true } => Ok(mercator_to_lonlat(x, y)),
            Engine::WebMercator { to_mercator: false } => Ok(lonlat_to_mercator(x, y)),
            Engine::Proj { source, target } => run_proj(target, source, x, y),
        }
    }

    /// Transform an extent, densifying its edges so curved edges stay enclosed.
    pub fn transform_bbox(&self, bbox: &BoundingBox) -> Result<BoundingBox> {
        self.map_bbox(bbox, |x, y| self.forward(x, y))
    }

    /// Inverse of [`transform_bbox`](Self::transform_bbox).
    pub fn inverse_bbox(&self, bbox: &BoundingBox) -> Result<BoundingBox> {
        self.map_bbox(bbox, |x, y| self.inverse(x, y))
    }

    fn map_bbox<F>(&self, bbox: &BoundingBox, f: F) -> Result<BoundingBox>
    where
        F: Fn(f64, f64) -> Result<(f64, f64)>,
    {
        if matches!(self.engine, Engine::Identity) {
            return Ok(*bbox);
        }

        let steps = (BBOX_DENSIFY_POINTS - 1) as f64;
        let mut points = Vec::with_capacity(BBOX_DENSIFY_POINTS * 4);
        for i in 0..BBOX_DENSIFY_POINTS {
            let t = i as f64 / steps;
            let x = bbox.left + t * bbox.width();
            let y = bbox.bottom + t * bbox.height();
            points.push(f(x, bbox.bottom)?);
            points.push(f(x, bbox.top)?);
            points.push(f(bbox.left, y)?);
            points.push(f(bbox.right, y)?);
        }

        BoundingBox::from_points(points)
            .ok_or_else(|| ReliefError::Projection("empty bbox outline".to_string()))
    }
}

fn is_mercator_pair(a: u16, b: u16) -> bool {
    matches!((a, b), (SERVING_EPSG, GEOGRAPHIC_EPSG) | (GEOGRAPHIC_EPSG, SERVING_EPSG))
}

fn resolve_definition(epsg: u16, override_def: Option<&str>) -> Result<&str> {
    match override_def {
        Some(def) => Ok(def),
        None => proj_string(epsg).ok_or_else(|| {
            ReliefError::Projection(format!("EPSG:{epsg} is not in the crs-definitions database"))
        }),
    }
}

fn parse_proj(epsg: u16, def: &str) -> Result<Proj> {
    Proj::from_proj_string(def)
        .map_err(|e| ReliefError::Projection(format!("Invalid projection EPSG:{epsg}: {e:?}")))
}

fn run_proj(source: &Side, target: &Side, x: f64, y: f64) -> Result<(f64, f64)> {
    let (px, py) = source.enter(x, y);
    let mut point = (px, py, 0.0);

    transform(&source.proj, &target.proj, &mut point)
        .map_err(|e| ReliefError::Projection(format!("Transform failed: {e:?}")))?;

    let out = target.leave(point.0, point.1);
    if !(out.0.is_finite() && out.1.is_finite()) {
        return Err(ReliefError::Projection(format!(
            "({x}, {y}) has no finite image in the target CRS"
        )));
    }
    Ok(out)
}

/// Longitude/latitude in degrees to Web Mercator meters.
pub fn lonlat_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let x = EARTH_RADIUS * lon.to_radians();
    let y = EARTH_RADIUS * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

/// Web Mercator meters to longitude/latitude in degrees.
pub fn mercator_to_lonlat(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS).to_degrees();
    let lat = (y / EARTH_RADIUS).sinh().atan().to_degrees();
    (lon, lat)
}

/// Shared transforms keyed by `(from, to)`, with per-EPSG definition overrides.
#[derive(Debug, Default)]
pub struct TransformCache {
    overrides: HashMap<u16, String>,
    transforms: RwLock<HashMap<(u16, u16), Arc<CrsTransform>>>,
}

impl TransformCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `definition` instead of the database entry for `epsg`.
    pub fn with_override(mut self, epsg: u16, definition: impl Into<String>) -> Self {
        self.overrides.insert(epsg, definition.into());
        self
    }

    /// Get (or build) the transform from `from` to `to`.
    pub fn get(&self, from: u16, to: u16) -> Result<Arc<CrsTransform>> {
        {
            let transforms = self.transforms.read().map_err(|_| ReliefError::LockPoisoned)?;
            if let Some(t) = transforms.get(&(from, to)) {
                return Ok(Arc::clone(t));
            }
        }

        let built = Arc::new(CrsTransform::with_definitions(
            from,
            self.overrides.get(&from).map(String::as_str),
            to,
            self.overrides.get(&to).map(String::as_str),
        )?);

        let mut transforms = self.transforms.write().map_err(|_| ReliefError::LockPoisoned)?;
        Ok(Arc::clone(transforms.entry((from, to)).or_insert(built)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const MERCATOR_MAX: f64 = 20_037_508.342_789_244;

    #[test]
    fn test_mercator_extremes() {
        let (x, _) = lonlat_to_mercator(180.0, 0.0);
        assert_relative_eq!(x, MERCATOR_MAX, epsilon = 1e-6);

        let (_, y) = lonlat_to_mercator(0.0, 85.051_128_779_806_59);
        assert_relative_eq!(y, MERCATOR_MAX, epsilon = 1e-3);
    }

    #[test]
    fn test_mercator_roundtrip() {
        let t = CrsTransform::new(GEOGRAPHIC_EPSG, SERVING_EPSG).unwrap();
        let (x, y) = t.forward(14.42, 50.08).unwrap();
        let (lon, lat) = t.inverse(x, y).unwrap();
        assert_relative_eq!(lon, 14.42, epsilon = 1e-9);
        assert_relative_eq!(lat, 50.08, epsilon = 1e-9);
    }

    #[test]
    fn test_identity() {
        let t = CrsTransform::new(5514, 5514).unwrap();
        assert_eq!(t.forward(-740_000.0, -1_040_000.0).unwrap(), (-740_000.0, -1_040_000.0));
    }

    #[test]
    fn test_utm_roundtrip_under_a_millimeter() {
        let t = CrsTransform::new(GEOGRAPHIC_EPSG, 32633).unwrap();
        let (e, n) = t.forward(15.0, 50.0).unwrap();
        // Central meridian of zone 33 maps to the false easting
        assert_relative_eq!(e, 500_000.0, epsilon = 1e-3);
        let (lon, lat) = t.inverse(e, n).unwrap();
        assert_relative_eq!(lon, 15.0, epsilon = 1e-8);
        assert_relative_eq!(lat, 50.0, epsilon = 1e-8);
    }

    #[test]
    fn test_mercator_to_utm() {
        let t = CrsTransform::new(SERVING_EPSG, 32633).unwrap();
        let (x, y) = lonlat_to_mercator(15.0, 50.0);
        let (e, n) = t.forward(x, y).unwrap();
        let to_utm = CrsTransform::new(GEOGRAPHIC_EPSG, 32633).unwrap();
        let direct = to_utm.forward(15.0, 50.0).unwrap();
        assert_relative_eq!(e, direct.0, epsilon = 1e-6);
        assert_relative_eq!(n, direct.1, epsilon = 1e-6);

        let (bx, by) = t.inverse(e, n).unwrap();
        assert_relative_eq!(bx, x, epsilon = 1e-4);
        assert_relative_eq!(by, y, epsilon = 1e-4);
    }

    #[test]
    fn test_krovak_prague() {
        let t = CrsTransform::new(GEOGRAPHIC_EPSG, DEFAULT_NATIVE_EPSG).unwrap();
        let (e, n) = t.forward(14.42, 50.08).unwrap();
        assert_relative_eq!(e, -743_018.0, epsilon = 5.0);
        assert_relative_eq!(n, -1_043_831.0, epsilon = 5.0);

        let (lon, lat) = t.inverse(e, n).unwrap();
        let (e2, n2) = t.forward(lon, lat).unwrap();
        assert!((e2 - e).hypot(n2 - n) < 0.01, "drifted to ({e2}, {n2})");
        assert_relative_eq!(lon, 14.42, epsilon = 1e-7);
        assert_relative_eq!(lat, 50.08, epsilon = 1e-7);
    }

    #[test]
    fn test_mercator_to_krovak() {
        let t = CrsTransform::new(SERVING_EPSG, DEFAULT_NATIVE_EPSG).unwrap();
        let (x, y) = lonlat_to_mercator(14.42, 50.08);
        let (e, n) = t.forward(x, y).unwrap();
        assert_relative_eq!(e, -743_018.0, epsilon = 5.0);
        assert_relative_eq!(n, -1_043_831.0, epsilon = 5.0);

        let bbox = BoundingBox::new(x - 500.0, y - 500.0, x + 500.0, y + 500.0).unwrap();
        let native = t.transform_bbox(&bbox).unwrap();
        assert!(native.contains(e, n));
        assert!(native.width() > 400.0 && native.width() < 900.0);
    }

    #[test]
    fn test_bbox_is_enclosed() {
        let t = CrsTransform::new(SERVING_EPSG, 32633).unwrap();
        let merc = BoundingBox::new(1_600_000.0, 6_440_000.0, 1_610_000.0, 6_450_000.0).unwrap();
        let utm = t.transform_bbox(&merc).unwrap();
        for (x, y) in [
            (merc.left, merc.bottom),
            (merc.right, merc.top),
            (merc.left, merc.top),
        ] {
            let (e, n) = t.forward(x, y).unwrap();
            assert!(utm.contains(e, n));
        }
    }

    #[test]
    fn test_cache_reuses_transforms() {
        let cache = TransformCache::new();
        let a = cache.get(SERVING_EPSG, GEOGRAPHIC_EPSG).unwrap();
        let b = cache.get(SERVING_EPSG, GEOGRAPHIC_EPSG).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unknown_epsg() {
        assert!(matches!(
            CrsTransform::new(1, SERVING_EPSG),
            Err(ReliefError::Projection(_))
        ));
    }

    #[test]
    fn test_is_geographic() {
        assert!(is_geographic(GEOGRAPHIC_EPSG));
        assert!(!is_geographic(SERVING_EPSG));
        assert!(!is_geographic(32633));
    }
}
