use chrono::{DateTime, NaiveDate, Utc};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pixel value type for reflectance and index data. Absent pixels are `NaN`.
pub type Sample = f32;

/// 2D raster (y x x)
pub type Raster = Array2<Sample>;

/// 3D band stack (time x y x x)
pub type BandStack = Array3<Sample>;

/// Geospatial bounding box in the coordinates of whatever CRS it is used with
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// STAC ordering: `[west, south, east, north]`
    pub fn to_stac(&self) -> [f64; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }

    pub fn from_stac(values: &[f64]) -> Option<Self> {
        match values {
            [w, s, e, n] => Some(Self::new(*w, *s, *e, *n)),
            // 3D bbox: [w, s, zmin, e, n, zmax]
            [w, s, _, e, n, _] => Some(Self::new(*w, *s, *e, *n)),
            _ => None,
        }
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn is_valid(&self) -> bool {
        self.min_x.is_finite()
            && self.min_y.is_finite()
            && self.max_x.is_finite()
            && self.max_y.is_finite()
            && self.min_x < self.max_x
            && self.min_y < self.max_y
    }
}

/// Affine transform from pixel (col, row) to map (x, y), GDAL ordering
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square-ish pixels
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_size: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: pixel_size,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_size,
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Map coordinates of a fractional pixel position (col, row)
    pub fn pixel_to_map(&self, col: f64, row: f64) -> (f64, f64) {
        let x = self.top_left_x + col * self.pixel_width + row * self.rotation_x;
        let y = self.top_left_y + col * self.rotation_y + row * self.pixel_height;
        (x, y)
    }

    /// Map coordinates of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.pixel_to_map(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Fractional pixel position (col, row) of a map coordinate. `None` for
    /// degenerate transforms.
    pub fn map_to_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let det = self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y;
        if det == 0.0 {
            return None;
        }
        let dx = x - self.top_left_x;
        let dy = y - self.top_left_y;
        let col = (dx * self.pixel_height - dy * self.rotation_x) / det;
        let row = (dy * self.pixel_width - dx * self.rotation_y) / det;
        Some((col, row))
    }
}

/// Spatial grid shared by every band of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    /// EPSG code of the coordinate reference system
    pub epsg: u32,
}

impl GridSpec {
    pub fn new(width: usize, height: usize, transform: GeoTransform, epsg: u32) -> Self {
        Self { width, height, transform, epsg }
    }

    /// Build a north-up grid covering `bbox` at `resolution` map units per pixel
    pub fn from_bbox(bbox: &BoundingBox, resolution: f64, epsg: u32) -> EoResult<Self> {
        if !bbox.is_valid() || resolution <= 0.0 {
            return Err(EoError::InvalidInput(format!(
                "cannot build grid from bbox {:?} at resolution {}",
                bbox, resolution
            )));
        }
        let width = ((bbox.max_x - bbox.min_x) / resolution).ceil() as usize;
        let height = ((bbox.max_y - bbox.min_y) / resolution).ceil() as usize;
        Ok(Self::new(
            width.max(1),
            height.max(1),
            GeoTransform::north_up(bbox.min_x, bbox.max_y, resolution),
            epsg,
        ))
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Pixel size along x in map units
    pub fn resolution(&self) -> f64 {
        self.transform.pixel_width.abs()
    }

    pub fn bounds(&self) -> BoundingBox {
        let (x0, y0) = self.transform.pixel_to_map(0.0, 0.0);
        let (x1, y1) = self
            .transform
            .pixel_to_map(self.width as f64, self.height as f64);
        BoundingBox::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }

    /// Nearest pixel (row, col) for a map coordinate, if it falls on the grid
    pub fn nearest_pixel(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let (col, row) = self.transform.map_to_pixel(x, y)?;
        if col < 0.0 || row < 0.0 {
            return None;
        }
        let (col, row) = (col.floor() as usize, row.floor() as usize);
        if row < self.height && col < self.width {
            Some((row, col))
        } else {
            None
        }
    }
}

/// One satellite acquisition as returned by a catalog query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub collection: String,
    pub datetime: DateTime<Utc>,
    pub footprint: BoundingBox,
    /// Cloud cover in percent (0-100), when the catalog reports it
    pub cloud_cover: Option<f64>,
    pub platform: Option<String>,
    /// Band name -> retrievable asset href
    pub assets: BTreeMap<String, String>,
}

impl Scene {
    pub fn date(&self) -> NaiveDate {
        self.datetime.date_naive()
    }

    pub fn asset(&self, band: &str) -> Option<&str> {
        self.assets.get(band).map(String::as_str)
    }
}

/// A set of co-registered band stacks sharing time and spatial coordinates
#[derive(Debug, Clone)]
pub struct Dataset {
    times: Vec<DateTime<Utc>>,
    grid: GridSpec,
    bands: BTreeMap<String, BandStack>,
}

impl Dataset {
    pub fn new(times: Vec<DateTime<Utc>>, grid: GridSpec) -> Self {
        Self {
            times,
            grid,
            bands: BTreeMap::new(),
        }
    }

    /// Construct from existing stacks, validating every shape
    pub fn from_bands(
        times: Vec<DateTime<Utc>>,
        grid: GridSpec,
        bands: BTreeMap<String, BandStack>,
    ) -> EoResult<Self> {
        let mut dataset = Self::new(times, grid);
        for (name, stack) in bands {
            dataset.insert_band(name, stack)?;
        }
        Ok(dataset)
    }

    pub fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    /// Expected `(time, y, x)` shape of every band
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.times.len(), self.grid.height, self.grid.width)
    }

    pub fn len_time(&self) -> usize {
        self.times.len()
    }

    pub fn band(&self, name: &str) -> Option<&BandStack> {
        self.bands.get(name)
    }

    /// Like [`Dataset::band`] but missing bands are an error
    pub fn require_band(&self, name: &str) -> EoResult<&BandStack> {
        self.bands.get(name).ok_or_else(|| {
            EoError::InvalidInput(format!(
                "band '{}' not present (available: {:?})",
                name,
                self.band_names()
            ))
        })
    }

    pub fn band_names(&self) -> Vec<String> {
        self.bands.keys().cloned().collect()
    }

    pub fn bands(&self) -> impl Iterator<Item = (&String, &BandStack)> {
        self.bands.iter()
    }

    pub fn insert_band(&mut self, name: impl Into<String>, stack: BandStack) -> EoResult<()> {
        let name = name.into();
        if stack.dim() != self.shape() {
            return Err(EoError::ShapeMismatch(format!(
                "band '{}' has shape {:?}, dataset expects {:?}",
                name,
                stack.dim(),
                self.shape()
            )));
        }
        self.bands.insert(name, stack);
        Ok(())
    }

    pub fn remove_band(&mut self, name: &str) -> Option<BandStack> {
        self.bands.remove(name)
    }

    /// New dataset holding only the given time-steps, in the given order
    pub fn select_times(&self, indices: &[usize]) -> EoResult<Dataset> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.times.len()) {
            return Err(EoError::InvalidInput(format!(
                "time index {} out of range ({} steps)",
                bad,
                self.times.len()
            )));
        }
        let times = indices.iter().map(|&i| self.times[i]).collect();
        let bands = self
            .bands
            .iter()
            .map(|(name, stack)| (name.clone(), stack.select(ndarray::Axis(0), indices)))
            .collect();
        Ok(Dataset {
            times,
            grid: self.grid.clone(),
            bands,
        })
    }
}

/// A dataset reduced over time: one value per band per pixel
#[derive(Debug, Clone)]
pub struct Composite {
    pub grid: GridSpec,
    pub bands: BTreeMap<String, Raster>,
    /// Optional grouping label, e.g. the calendar year
    pub label: Option<i32>,
}

impl Composite {
    pub fn band(&self, name: &str) -> Option<&Raster> {
        self.bands.get(name)
    }

    pub fn require_band(&self, name: &str) -> EoResult<&Raster> {
        self.bands.get(name).ok_or_else(|| {
            EoError::InvalidInput(format!(
                "composite has no band '{}' (available: {:?})",
                name,
                self.bands.keys().collect::<Vec<_>>()
            ))
        })
    }
}

/// Error types for compositing and classification
#[derive(Debug, thiserror::Error)]
pub enum EoError {
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Asset fetch error for {href}: {reason}")]
    AssetFetch { href: String, reason: String },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Empty result: {0}")]
    EmptyResult(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// Result type for pipeline operations
pub type EoResult<T> = Result<T, EoError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn grid() -> GridSpec {
        GridSpec::new(4, 3, GeoTransform::north_up(100.0, 200.0, 10.0), 32633)
    }

    #[test]
    fn test_geotransform_roundtrip() {
        let gt = GeoTransform::north_up(100.0, 200.0, 10.0);
        let (x, y) = gt.pixel_center(1, 2);
        assert_eq!((x, y), (125.0, 185.0));
        let (col, row) = gt.map_to_pixel(x, y).unwrap();
        assert!((col - 2.5).abs() < 1e-12);
        assert!((row - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_nearest_pixel_bounds() {
        let g = grid();
        assert_eq!(g.nearest_pixel(101.0, 199.0), Some((0, 0)));
        assert_eq!(g.nearest_pixel(139.9, 170.1), Some((2, 3)));
        assert_eq!(g.nearest_pixel(140.1, 190.0), None);
        assert_eq!(g.nearest_pixel(99.0, 190.0), None);
    }

    #[test]
    fn test_grid_from_bbox() {
        let bbox = BoundingBox::new(0.0, 0.0, 95.0, 40.0);
        let g = GridSpec::from_bbox(&bbox, 10.0, 4326).unwrap();
        assert_eq!(g.shape(), (4, 10));
        assert!(GridSpec::from_bbox(&BoundingBox::new(1.0, 0.0, 0.0, 1.0), 10.0, 4326).is_err());
    }

    #[test]
    fn test_dataset_rejects_mismatched_band() {
        let times = vec![Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()];
        let mut ds = Dataset::new(times, grid());
        assert!(ds.insert_band("red", Array3::zeros((1, 3, 4))).is_ok());
        let err = ds.insert_band("nir", Array3::zeros((1, 4, 3))).unwrap_err();
        assert!(matches!(err, EoError::ShapeMismatch(_)));
    }

    #[test]
    fn test_select_times_reorders() {
        let times = vec![
            Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 1, 2, 0, 0, 0).unwrap(),
        ];
        let mut ds = Dataset::new(times.clone(), grid());
        let mut stack = Array3::zeros((2, 3, 4));
        stack.index_axis_mut(ndarray::Axis(0), 1).fill(1.0);
        ds.insert_band("red", stack).unwrap();

        let picked = ds.select_times(&[1]).unwrap();
        assert_eq!(picked.times(), &times[1..]);
        assert_eq!(picked.band("red").unwrap()[[0, 0, 0]], 1.0);
        assert!(ds.select_times(&[2]).is_err());
    }
}
