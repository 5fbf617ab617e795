//! Service configuration.
//!
//! Every field has a default, so an empty document is a valid
//! configuration. The binary reads it from YAML.

use crate::chain::{ChainSettings, PseudoElevationRange};
use crate::composite::PlausibleRange;
use crate::crs::{TransformCache, DEFAULT_NATIVE_EPSG};
use crate::profile::ProfileSettings;
use crate::remote::{WcsClient, WmsClient};
use crate::tile::DEFAULT_TILE_SIZE;
use crate::{ReliefError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// DMR 5G elevation coverage of the Czech cadastral office.
pub const DEFAULT_WCS_URL: &str = "https://ags.cuzk.gov.cz/arcgis2/services/dmr5g/ImageServer/WCSServer";

/// Shaded relief rendering of the same data.
pub const DEFAULT_WMS_URL: &str = "https://ags.cuzk.gov.cz/arcgis2/services/dmr5g/ImageServer/WMSServer";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliefConfig {
    /// Directory holding cached grids.
    pub cache_dir: PathBuf,
    /// EPSG code of the lidar data and of remote coverage requests.
    pub native_epsg: u16,
    /// PROJ definition replacing the database entry for `native_epsg`.
    pub native_proj: Option<String>,
    /// Tile edge length in pixels.
    pub tile_size: usize,
    /// Elevations outside this range are treated as missing.
    pub plausible: PlausibleRange,
    /// Elevation range the shaded-relief intensities are stretched over.
    pub pseudo_elevation: PseudoElevationRange,
    /// Highest zoom for which the remote coverage service is queried.
    pub remote_coverage_max_zoom: u8,
    /// Rasterization cell size in native CRS units.
    pub default_cell_size: f64,
    pub profile: ProfileSettings,
    pub remote: RemoteConfig,
}

impl Default for ReliefConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("dem_cache"),
            native_epsg: DEFAULT_NATIVE_EPSG,
            native_proj: None,
            tile_size: DEFAULT_TILE_SIZE,
            plausible: PlausibleRange::default(),
            pseudo_elevation: PseudoElevationRange::default(),
            remote_coverage_max_zoom: 14,
            default_cell_size: 5.0,
            profile: ProfileSettings::default(),
            remote: RemoteConfig::default(),
        }
    }
}

/// Remote service endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub coverage_url: String,
    /// Coverage name passed to GetCoverage.
    pub coverage_name: String,
    pub coverage_timeout_secs: u64,
    pub image_url: String,
    /// Layer passed to GetMap.
    pub image_layer: String,
    pub image_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            coverage_url: DEFAULT_WCS_URL.to_string(),
            coverage_name: "dmr5g".to_string(),
            coverage_timeout_secs: 20,
            image_url: DEFAULT_WMS_URL.to_string(),
            image_layer: "dmr5g:GrayscaleHillshade".to_string(),
            image_timeout_secs: 30,
        }
    }
}

impl ReliefConfig {
    /// Check ranges and sizes.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ReliefError::InvalidParameter(msg));

        if self.tile_size == 0 {
            return invalid("tile_size must be positive".to_string());
        }
        if !(self.default_cell_size.is_finite() && self.default_cell_size > 0.0) {
            return invalid(format!(
                "default_cell_size must be positive, got {}",
                self.default_cell_size
            ));
        }
        if !(self.plausible.min < self.plausible.max) {
            return invalid(format!(
                "plausible range {}..{} is empty",
                self.plausible.min, self.plausible.max
            ));
        }
        if !(self.pseudo_elevation.min.is_finite() && self.pseudo_elevation.max.is_finite()) {
            return invalid("pseudo_elevation bounds must be finite".to_string());
        }
        if self.profile.min_samples < 2 || self.profile.min_samples > self.profile.max_samples {
            return invalid(format!(
                "profile sample bounds {}..{} are invalid",
                self.profile.min_samples, self.profile.max_samples
            ));
        }
        if !(self.profile.spacing_m > 0.0) {
            return invalid("profile spacing must be positive".to_string());
        }
        Ok(())
    }

    /// Transform cache with the native CRS override applied.
    pub fn transform_cache(&self) -> TransformCache {
        match &self.native_proj {
            Some(def) => TransformCache::new().with_override(self.native_epsg, def.clone()),
            None => TransformCache::new(),
        }
    }

    /// Fixed parameters of the resolution chain.
    pub fn chain_settings(&self) -> ChainSettings {
        ChainSettings {
            tile_size: self.tile_size,
            native_epsg: self.native_epsg,
            plausible: self.plausible,
            pseudo: self.pseudo_elevation,
            remote_coverage_max_zoom: self.remote_coverage_max_zoom,
        }
    }

    /// Client for the remote coverage service.
    pub fn coverage_client(&self) -> Result<WcsClient> {
        WcsClient::new(
            &self.remote.coverage_url,
            &self.remote.coverage_name,
            Duration::from_secs(self.remote.coverage_timeout_secs),
        )
    }

    /// Client for the remote image service.
    pub fn image_client(&self) -> Result<WmsClient> {
        WmsClient::new(
            &self.remote.image_url,
            &self.remote.image_layer,
            Duration::from_secs(self.remote.image_timeout_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReliefConfig::default();
        assert_eq!(config.native_epsg, 5514);
        assert_eq!(config.tile_size, 256);
        assert_eq!(config.plausible, PlausibleRange { min: -1000.0, max: 3000.0 });
        assert_eq!(config.profile.nodata_threshold, -1000.0);
        assert_eq!(config.remote.coverage_timeout_secs, 20);
        assert_eq!(config.remote.image_timeout_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = "
cache_dir: /var/cache/relief
native_epsg: 32633
plausible:
  min: -50
  max: 2000
remote:
  image_layer: hillshade
";
        let config: ReliefConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/relief"));
        assert_eq!(config.native_epsg, 32633);
        assert_eq!(config.plausible.max, 2000.0);
        assert_eq!(config.remote.image_layer, "hillshade");
        // Untouched fields keep their defaults
        assert_eq!(config.remote.coverage_name, "dmr5g");
        assert_eq!(config.tile_size, 256);
    }

    #[test]
    fn test_empty_document() {
        let config: ReliefConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, ReliefConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ReliefConfig {
            tile_size: 0,
            ..ReliefConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ReliefConfig {
            plausible: PlausibleRange { min: 10.0, max: -10.0 },
            ..ReliefConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
