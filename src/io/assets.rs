use crate::types::{EoError, EoResult, GridSpec, Raster};
use ndarray::s;
#[cfg(feature = "gdal")]
use ndarray::Array2;
use std::collections::HashMap;

/// Rectangular pixel window on a target grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub row: usize,
    pub col: usize,
    pub height: usize,
    pub width: usize,
}

impl Window {
    pub fn new(row: usize, col: usize, height: usize, width: usize) -> Self {
        Self { row, col, height, width }
    }

    /// Split a grid into chunks of at most `chunk` (rows, cols)
    pub fn tiles(grid: &GridSpec, chunk: (usize, usize)) -> Vec<Window> {
        let chunk_rows = chunk.0.max(1);
        let chunk_cols = chunk.1.max(1);
        let mut windows = Vec::new();
        for row in (0..grid.height).step_by(chunk_rows) {
            for col in (0..grid.width).step_by(chunk_cols) {
                windows.push(Window::new(
                    row,
                    col,
                    chunk_rows.min(grid.height - row),
                    chunk_cols.min(grid.width - col),
                ));
            }
        }
        windows
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

/// Source of pixel data for scene assets.
///
/// `read_window` returns the window of the asset resampled onto `grid`,
/// with no-data pixels as `NaN`. Implementations must be shareable across
/// tile worker threads.
pub trait AssetReader: Sync {
    fn read_window(&self, href: &str, grid: &GridSpec, window: &Window) -> EoResult<Raster>;
}

/// Assets held in memory, already on the target grid
#[derive(Debug, Clone, Default)]
pub struct MemoryAssetReader {
    assets: HashMap<String, Raster>,
}

impl MemoryAssetReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, href: impl Into<String>, data: Raster) {
        self.assets.insert(href.into(), data);
    }

    pub fn with_asset(mut self, href: impl Into<String>, data: Raster) -> Self {
        self.insert(href, data);
        self
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

impl AssetReader for MemoryAssetReader {
    fn read_window(&self, href: &str, grid: &GridSpec, window: &Window) -> EoResult<Raster> {
        let data = self.assets.get(href).ok_or_else(|| EoError::AssetFetch {
            href: href.to_string(),
            reason: "asset not found".to_string(),
        })?;
        if data.dim() != grid.shape() {
            return Err(EoError::ShapeMismatch(format!(
                "asset {} is {:?}, target grid is {:?}",
                href,
                data.dim(),
                grid.shape()
            )));
        }
        let view = data.slice(s![
            window.row..window.row + window.height,
            window.col..window.col + window.width
        ]);
        Ok(view.to_owned())
    }
}

/// GDAL-backed reader for local files and cloud-optimized GeoTIFFs over HTTP.
///
/// The target window is mapped into the asset's pixel space through both
/// geotransforms and read with nearest-neighbour resampling, so assets at a
/// different resolution (e.g. 20 m quality bands under a 10 m grid) land on
/// the same grid as the reflectance bands. Both must share a CRS.
#[cfg(feature = "gdal")]
pub struct GdalAssetReader {
    /// Prefix for remote hrefs, `/vsicurl/` by default
    pub remote_prefix: String,
}

#[cfg(feature = "gdal")]
impl Default for GdalAssetReader {
    fn default() -> Self {
        Self {
            remote_prefix: "/vsicurl/".to_string(),
        }
    }
}

#[cfg(feature = "gdal")]
impl GdalAssetReader {
    fn gdal_path(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            format!("{}{}", self.remote_prefix, href)
        } else if let Some(rest) = href.strip_prefix("s3://") {
            format!("/vsis3/{}", rest)
        } else {
            href.to_string()
        }
    }

    fn fetch(&self, href: &str, grid: &GridSpec, window: &Window) -> EoResult<Raster> {
        use crate::types::GeoTransform;

        let dataset = gdal::Dataset::open(self.gdal_path(href))?;
        let asset_transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let (asset_width, asset_height) = dataset.raster_size();
        let band = dataset.rasterband(1)?;
        let nodata = band.no_data_value();

        // asset pixel bounds covered by the window
        let (x0, y0) = grid
            .transform
            .pixel_to_map(window.col as f64, window.row as f64);
        let (x1, y1) = grid.transform.pixel_to_map(
            (window.col + window.width) as f64,
            (window.row + window.height) as f64,
        );
        let (c0, r0) = asset_transform
            .map_to_pixel(x0, y0)
            .ok_or_else(|| EoError::InvalidInput(format!("degenerate transform in {}", href)))?;
        let (c1, r1) = asset_transform
            .map_to_pixel(x1, y1)
            .ok_or_else(|| EoError::InvalidInput(format!("degenerate transform in {}", href)))?;

        let col_start = c0.min(c1).floor().max(0.0) as usize;
        let row_start = r0.min(r1).floor().max(0.0) as usize;
        let col_end = (c0.max(c1).ceil() as usize).min(asset_width);
        let row_end = (r0.max(r1).ceil() as usize).min(asset_height);

        let mut out = Array2::from_elem(window.shape(), f32::NAN);
        if col_start >= col_end || row_start >= row_end {
            log::debug!("Window {:?} does not overlap {}", window, href);
            return Ok(out);
        }

        let read_w = col_end - col_start;
        let read_h = row_end - row_start;
        let buffer = band.read_as::<f32>(
            (col_start as isize, row_start as isize),
            (read_w, read_h),
            (read_w, read_h),
            None,
        )?;
        let source = Array2::from_shape_vec((read_h, read_w), buffer.data)
            .map_err(|e| EoError::ShapeMismatch(format!("reshaping {}: {}", href, e)))?;

        for ((r, c), value) in out.indexed_iter_mut() {
            let (x, y) = grid.transform.pixel_center(window.row + r, window.col + c);
            if let Some((ac, ar)) = asset_transform.map_to_pixel(x, y) {
                if ac < 0.0 || ar < 0.0 {
                    continue;
                }
                let (ac, ar) = (ac.floor() as usize, ar.floor() as usize);
                if ac < col_start || ar < row_start || ac >= col_end || ar >= row_end {
                    continue;
                }
                let v = source[[ar - row_start, ac - col_start]];
                let is_nodata = nodata.map_or(false, |nd| (v as f64 - nd).abs() < f64::EPSILON);
                if !is_nodata {
                    *value = v;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(feature = "gdal")]
impl AssetReader for GdalAssetReader {
    fn read_window(&self, href: &str, grid: &GridSpec, window: &Window) -> EoResult<Raster> {
        self.fetch(href, grid, window).map_err(|e| match e {
            EoError::Gdal(inner) => EoError::AssetFetch {
                href: href.to_string(),
                reason: inner.to_string(),
            },
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use ndarray::Array2;

    fn grid(width: usize, height: usize) -> GridSpec {
        GridSpec::new(width, height, GeoTransform::north_up(0.0, 100.0, 10.0), 32601)
    }

    #[test]
    fn test_tiles_cover_grid_exactly() {
        let g = grid(10, 7);
        let tiles = Window::tiles(&g, (4, 4));
        assert_eq!(tiles.len(), 6);
        let covered: usize = tiles.iter().map(|w| w.height * w.width).sum();
        assert_eq!(covered, 70);
        assert_eq!(tiles.last().unwrap(), &Window::new(4, 8, 3, 2));
    }

    #[test]
    fn test_memory_reader_window() {
        let g = grid(3, 2);
        let data = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let reader = MemoryAssetReader::new().with_asset("a", data);
        let w = reader.read_window("a", &g, &Window::new(1, 1, 1, 2)).unwrap();
        assert_eq!(w, Array2::from_shape_vec((1, 2), vec![5.0, 6.0]).unwrap());

        let err = reader.read_window("missing", &g, &Window::new(0, 0, 1, 1)).unwrap_err();
        assert!(matches!(err, EoError::AssetFetch { .. }));
    }
}
