//! Core processing: loading, masking, indices, compositing, tides,
//! classification and coastline change

pub mod loader;
pub mod mask;
pub mod indices;
pub mod composite;
pub mod stats;
pub mod tide;
pub mod classify;
pub mod coastline;

// Re-export main types
pub use loader::{BandLoader, LazyDataset, LoadParams, MergePolicy, TimeStep};
pub use mask::{mask_and_normalize, MaskPolicy, SensorConfig};
pub use indices::{add_index, add_indices, normalized_difference, SpectralIndex};
pub use composite::{composite_by_year, count_valid, median_composite, percentile_composite};
pub use tide::{filter_by_tide, pixel_tides, select_scenes_by_tide, TideFilterParams, TideModel};
pub use classify::{
    predict_grid, sample_training_set, Classifier, ForestParams, PredictionGrid, RandomForest,
    TrainingSet, NODATA_CLASS,
};
pub use coastline::{
    annual_shorelines, extract_contour, rates_of_change, sample_points, CoastlineParams, Contour,
    RateOfChange, Trend,
};
