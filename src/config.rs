//! Pipeline configuration, loadable from JSON.

use crate::core::classify::ForestParams;
use crate::core::coastline::CoastlineParams;
use crate::core::indices::SpectralIndex;
use crate::core::loader::LoadParams;
use crate::core::mask::SensorConfig;
use crate::core::tide::TideFilterParams;
use crate::io::catalog::{CatalogQuery, StacEndpoint, StacOptions};
use crate::types::{EoError, EoResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// How the time axis is reduced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositeMode {
    /// One median over the whole period
    Median,
    /// One median per calendar year
    Annual,
}

impl Default for CompositeMode {
    fn default() -> Self {
        Self::Median
    }
}

/// Training and prediction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationConfig {
    /// Composite bands used as features, in order
    pub feature_bands: Vec<String>,
    /// GeoJSON property holding the integer class
    pub label_field: String,
    #[serde(default)]
    pub forest: ForestParams,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            feature_bands: vec!["red".into(), "green".into(), "blue".into(), "nir".into()],
            label_field: "class".to_string(),
            forest: ForestParams::default(),
        }
    }
}

fn default_sensor() -> SensorConfig {
    SensorConfig::sentinel2_l2a()
}

fn default_endpoint() -> String {
    "earth-search".to_string()
}

/// Everything a [`crate::pipeline::CompositePipeline`] run needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// STAC API shorthand (`es`, `pc`, `deafrica`) or root URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub stac: StacOptions,
    pub query: CatalogQuery,
    pub load: LoadParams,
    #[serde(default = "default_sensor")]
    pub sensor: SensorConfig,
    /// Drop time-steps with a larger share of masked pixels
    #[serde(default)]
    pub max_cloud_fraction: Option<f64>,
    #[serde(default)]
    pub indices: Vec<SpectralIndex>,
    #[serde(default)]
    pub tide: Option<TideFilterParams>,
    #[serde(default)]
    pub composite: CompositeMode,
    #[serde(default)]
    pub classification: ClassificationConfig,
    /// Shoreline change analysis; needs `composite: Annual`
    #[serde(default)]
    pub coastline: Option<CoastlineParams>,
}

impl PipelineConfig {
    pub fn new(query: CatalogQuery, load: LoadParams) -> Self {
        Self {
            endpoint: default_endpoint(),
            stac: StacOptions::default(),
            query,
            load,
            sensor: default_sensor(),
            max_cloud_fraction: None,
            indices: Vec::new(),
            tide: None,
            composite: CompositeMode::default(),
            classification: ClassificationConfig::default(),
            coastline: None,
        }
    }

    pub fn from_json_str(text: &str) -> EoResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> EoResult<Self> {
        log::info!("Reading pipeline configuration: {}", path.as_ref().display());
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> EoResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn stac_endpoint(&self) -> StacEndpoint {
        StacEndpoint::from_str_or_url(&self.endpoint)
    }

    /// Band names of the normalized dataset, derived indices included
    pub fn output_bands(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self
            .load
            .bands
            .iter()
            .map(|b| self.load.output_name(b).to_string())
            .filter(|b| *b != self.sensor.quality_band)
            .collect();
        names.extend(self.indices.iter().map(|i| i.name().to_string()));
        names
    }

    /// Check the pieces fit together before any network traffic
    pub fn validate(&self) -> EoResult<()> {
        if !self.query.bbox.is_valid() {
            return Err(EoError::InvalidInput(format!(
                "invalid bounding box {:?}",
                self.query.bbox
            )));
        }
        self.query.date_range()?;
        self.sensor.validate()?;

        if self.load.bands.is_empty() {
            return Err(EoError::InvalidInput("no bands to load".to_string()));
        }
        let loaded: BTreeSet<&str> = self
            .load
            .bands
            .iter()
            .map(|b| self.load.output_name(b))
            .collect();
        if !loaded.contains(self.sensor.quality_band.as_str()) {
            return Err(EoError::InvalidInput(format!(
                "quality band '{}' is not among the loaded bands {:?}",
                self.sensor.quality_band, loaded
            )));
        }
        for index in &self.indices {
            if let Some(missing) = index
                .required_bands()
                .iter()
                .find(|b| !loaded.contains(**b))
            {
                return Err(EoError::InvalidInput(format!(
                    "index {} needs band '{}', which is not loaded",
                    index, missing
                )));
            }
        }

        if let Some(f) = self.max_cloud_fraction {
            if !(0.0..=1.0).contains(&f) {
                return Err(EoError::InvalidInput(format!(
                    "max_cloud_fraction must be in [0, 1], got {}",
                    f
                )));
            }
        }
        if let Some(tide) = &self.tide {
            if !(tide.central_fraction > 0.0 && tide.central_fraction <= 1.0) {
                return Err(EoError::InvalidInput(format!(
                    "tide central_fraction must be in (0, 1], got {}",
                    tide.central_fraction
                )));
            }
            if tide.resolution == 0 {
                return Err(EoError::InvalidInput(
                    "tide resolution must be positive".to_string(),
                ));
            }
        }

        if self.classification.forest.n_trees == 0 {
            return Err(EoError::InvalidInput("forest needs at least one tree".to_string()));
        }

        if let Some(coast) = &self.coastline {
            if self.composite != CompositeMode::Annual {
                return Err(EoError::InvalidInput(
                    "coastline analysis needs annual composites".to_string(),
                ));
            }
            if !self.output_bands().contains(&coast.band) {
                return Err(EoError::InvalidInput(format!(
                    "coastline band '{}' is neither loaded nor derived",
                    coast.band
                )));
            }
            if !(coast.spacing > 0.0) || !(coast.p_cutoff > 0.0 && coast.p_cutoff <= 1.0) {
                return Err(EoError::InvalidInput(format!(
                    "coastline spacing {} / p cutoff {} invalid",
                    coast.spacing, coast.p_cutoff
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "endpoint": "deafrica",
        "query": {
            "bbox": {"min_x": 18.40, "min_y": -33.95, "max_x": 18.45, "max_y": -33.90},
            "datetime": "2019/2023",
            "collection": "s2_l2a",
            "max_cloud_cover": 30.0,
            "limit": 100
        },
        "load": {
            "bands": ["green", "nir", "swir16", "scl"],
            "grid": {
                "width": 100, "height": 100, "epsg": 32734,
                "transform": {"top_left_x": 260000.0, "pixel_width": 10.0, "rotation_x": 0.0,
                              "top_left_y": 6245000.0, "rotation_y": 0.0, "pixel_height": -10.0}
            },
            "chunk_size": [512, 512],
            "group_by_day": true,
            "merge_policy": "LeastCloudy",
            "skip_failures": true,
            "rename": {"swir16": "swir1"}
        },
        "indices": ["Mndwi", "Ndwi"],
        "composite": "Annual",
        "coastline": {"band": "mndwi", "threshold": 0.0, "spacing": 30.0, "p_cutoff": 0.01}
    }"#;

    #[test]
    fn test_parse_and_validate() {
        let config = PipelineConfig::from_json_str(CONFIG).unwrap();
        assert_eq!(config.stac_endpoint(), StacEndpoint::DigitalEarthAfrica);
        assert_eq!(config.sensor.quality_band, "scl");
        assert!(config.output_bands().contains("swir1"));
        assert!(config.output_bands().contains("mndwi"));
        assert!(!config.output_bands().contains("scl"));
        assert_eq!(config.classification.forest.n_trees, 100);
    }

    #[test]
    fn test_json_round_trip_keeps_validity() {
        let config = PipelineConfig::from_json_str(CONFIG).unwrap();
        let again = PipelineConfig::from_json_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(again.indices, config.indices);
    }

    #[test]
    fn test_rejects_inconsistent_config() {
        let mut config = PipelineConfig::from_json_str(CONFIG).unwrap();
        config.indices.push(SpectralIndex::Evi);
        assert!(config.validate().is_err(), "EVI needs red and blue");

        let mut config = PipelineConfig::from_json_str(CONFIG).unwrap();
        config.composite = CompositeMode::Median;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::from_json_str(CONFIG).unwrap();
        config.load.bands.retain(|b| b != "scl");
        assert!(config.validate().is_err());
    }
}
