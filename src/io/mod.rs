//! Input/output: catalog search, asset reading, point files and exports

pub mod catalog;
pub mod assets;
pub mod points;
pub mod export;

pub use catalog::{Catalog, CatalogQuery, StacCatalog, StacEndpoint, StacOptions, StaticCatalog};
pub use assets::{AssetReader, MemoryAssetReader, Window};
#[cfg(feature = "gdal")]
pub use assets::GdalAssetReader;
pub use points::{read_training_points, TrainingPoint};
