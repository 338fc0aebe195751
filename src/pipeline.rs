//! End-to-end orchestration: search, load, mask, derive, filter, composite.

use crate::config::{CompositeMode, PipelineConfig};
use crate::core::classify::{
    accuracy, predict_grid, sample_training_set, Classifier, PredictionGrid, RandomForest,
    TrainingSet,
};
use crate::core::coastline::{annual_shorelines, rates_of_change, sample_points, Contour, RateOfChange};
use crate::core::composite::{composite_by_year, median_composite};
use crate::core::indices::add_indices;
use crate::core::loader::BandLoader;
use crate::core::mask::{drop_empty_steps, filter_cloud_fraction, mask_and_normalize};
use crate::core::tide::{filter_by_tide, pixel_tides, TideModel};
use crate::io::assets::AssetReader;
use crate::io::catalog::{Catalog, StacCatalog};
use crate::io::export;
use crate::io::points::TrainingPoint;
use crate::types::{Composite, Dataset, EoError, EoResult, Scene};
use std::path::Path;
use std::time::Instant;

/// Shorelines, sampled baseline points and their trends
#[derive(Debug, Clone)]
pub struct CoastlineOutput {
    pub shorelines: Vec<(i32, Vec<Contour>)>,
    pub points: Vec<(f64, f64)>,
    pub rates: Vec<RateOfChange>,
}

/// Products of one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Scenes returned by the catalog
    pub scenes: Vec<Scene>,
    /// Masked reflectance and indices that went into the composites
    pub dataset: Dataset,
    /// One composite, or one per year for annual runs
    pub composites: Vec<Composite>,
    pub coastline: Option<CoastlineOutput>,
}

/// A fitted model and what it produced
#[derive(Debug, Clone)]
pub struct ClassificationOutput {
    pub model: RandomForest,
    pub training: TrainingSet,
    /// Accuracy of the model on its own training rows
    pub training_accuracy: f64,
    pub prediction: PredictionGrid,
}

/// Runs the compositing pipeline described by a [`PipelineConfig`]
pub struct CompositePipeline {
    config: PipelineConfig,
}

impl CompositePipeline {
    pub fn new(config: PipelineConfig) -> EoResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// STAC client for the configured endpoint
    pub fn stac_catalog(&self) -> EoResult<StacCatalog> {
        StacCatalog::new(self.config.stac_endpoint(), self.config.stac.clone())
    }

    /// Load, mask and derive indices; no temporal reduction
    pub fn prepare(&self, catalog: &dyn Catalog, reader: &dyn AssetReader) -> EoResult<(Vec<Scene>, Dataset)> {
        let cfg = &self.config;

        let scenes = catalog.search(&cfg.query)?;
        if scenes.is_empty() {
            return Err(EoError::EmptyResult(format!(
                "no {} scenes for {} over {:?}",
                cfg.query.collection, cfg.query.datetime, cfg.query.bbox
            )));
        }
        log::info!("Found {} scenes", scenes.len());

        let lazy = BandLoader::lazy_load(&scenes, cfg.load.clone())?;
        let start = Instant::now();
        let raw = lazy.realize(reader)?;
        log::info!(
            "Loaded {} time-steps of {:?} in {:.2}s",
            raw.len_time(),
            raw.grid().shape(),
            start.elapsed().as_secs_f64()
        );

        let mut ds = mask_and_normalize(&raw, &cfg.sensor)?;
        ds = drop_empty_steps(&ds)?;
        if let Some(max_fraction) = cfg.max_cloud_fraction {
            ds = filter_cloud_fraction(&ds, max_fraction)?;
        }
        if !cfg.indices.is_empty() {
            ds = add_indices(&ds, &cfg.indices)?;
        }

        if let Some(tide) = &cfg.tide {
            let model = TideModel::from_directory(&tide.model_dir)?;
            ds = self.apply_tide_filter(&ds, &model)?;
        }
        Ok((scenes, ds))
    }

    /// Keep only observations inside the configured central tide range
    pub fn apply_tide_filter(&self, ds: &Dataset, model: &TideModel) -> EoResult<Dataset> {
        let params = self.config.tide.clone().unwrap_or_default();
        let tides = pixel_tides(model, ds, params.resolution)?;
        filter_by_tide(ds, &tides, params.central_fraction)
    }

    /// Full run: prepare, composite, and shoreline analysis when configured
    pub fn run(&self, catalog: &dyn Catalog, reader: &dyn AssetReader) -> EoResult<PipelineOutput> {
        log::info!("Starting pipeline for {}", self.config.query.collection);
        let start = Instant::now();

        let (scenes, dataset) = self.prepare(catalog, reader)?;
        let composites = match self.config.composite {
            CompositeMode::Median => vec![median_composite(&dataset)?],
            CompositeMode::Annual => composite_by_year(&dataset)?,
        };

        let coastline = match &self.config.coastline {
            Some(params) => {
                let shorelines = annual_shorelines(&composites, &params.band, params.threshold)?;
                let points = sample_points(&shorelines, params.spacing)?;
                let rates = rates_of_change(
                    &points,
                    &shorelines,
                    &composites,
                    &params.band,
                    params.threshold,
                    params.p_cutoff,
                )?;
                Some(CoastlineOutput {
                    shorelines,
                    points,
                    rates,
                })
            }
            None => None,
        };

        log::info!(
            "Pipeline finished in {:.2}s: {} composites",
            start.elapsed().as_secs_f64(),
            composites.len()
        );
        Ok(PipelineOutput {
            scenes,
            dataset,
            composites,
            coastline,
        })
    }

    /// Train a random forest on `points` sampled from `composite` and classify it
    pub fn classify(&self, composite: &Composite, points: &[TrainingPoint]) -> EoResult<ClassificationOutput> {
        let cfg = &self.config.classification;
        let training = sample_training_set(composite, points, &cfg.feature_bands)?;

        let mut model = RandomForest::new(cfg.forest.clone());
        model.fit(&training)?;
        let fitted = model.predict(training.features.view())?;
        let training_accuracy = accuracy(&fitted, &training.labels)?;
        log::info!("Training accuracy: {:.1}%", training_accuracy * 100.0);

        let prediction = predict_grid(composite, &model, &cfg.feature_bands)?;
        Ok(ClassificationOutput {
            model,
            training,
            training_accuracy,
            prediction,
        })
    }
}

/// Write vector products (and rasters, with GDAL) into `dir`
pub fn write_outputs<P: AsRef<Path>>(output: &PipelineOutput, dir: P) -> EoResult<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let epsg = output.dataset.grid().epsg;

    std::fs::write(
        dir.join("grid.json"),
        serde_json::to_string_pretty(&export::grid_to_json(output.dataset.grid()))?,
    )?;

    if let Some(coast) = &output.coastline {
        export::write_contours(&coast.shorelines, epsg, dir.join("shorelines.geojson"))?;
        export::write_rates(&coast.rates, epsg, dir.join("rates_of_change.geojson"))?;
    }

    #[cfg(feature = "gdal")]
    for composite in &output.composites {
        let suffix = composite
            .label
            .map(|y| format!("_{}", y))
            .unwrap_or_default();
        for (band, raster) in &composite.bands {
            let path = dir.join(format!("{}{}.tif", band, suffix));
            export::save_geotiff(raster, &composite.grid, path)?;
        }
    }
    Ok(())
}

/// Write the training points that produced a row, and with GDAL the class raster
pub fn write_classification<P: AsRef<Path>>(
    output: &ClassificationOutput,
    points: &[TrainingPoint],
    label_field: &str,
    dir: P,
) -> EoResult<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let epsg = output.prediction.grid.epsg;

    let used: Vec<TrainingPoint> = output
        .training
        .source_rows
        .iter()
        .filter_map(|&i| points.get(i).cloned())
        .collect();
    export::write_training_points(&used, label_field, epsg, dir.join("training_points.geojson"))?;

    #[cfg(feature = "gdal")]
    export::save_classes_geotiff(
        &output.prediction.classes,
        &output.prediction.grid,
        crate::core::classify::NODATA_CLASS,
        dir.join("classes.tif"),
    )?;
    Ok(())
}
