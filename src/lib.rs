//! coastcube: cloud- and tide-aware compositing for optical satellite imagery
//!
//! Searches a STAC catalog, loads and masks multi-band scenes onto a common
//! grid, derives spectral indices, reduces the time axis to median composites
//! (optionally restricted to a band of tide heights), trains a random forest
//! on labelled points, and measures shoreline change from annual composites.

pub mod types;
pub mod io;
pub mod core;
pub mod config;
pub mod pipeline;
pub mod viz;

// Re-export main types and functions for easier access
pub use types::{
    BandStack, BoundingBox, Composite, Dataset, EoError, EoResult, GeoTransform, GridSpec, Raster,
    Scene,
};
pub use config::{ClassificationConfig, CompositeMode, PipelineConfig};
pub use pipeline::{ClassificationOutput, CompositePipeline, PipelineOutput};
pub use io::{AssetReader, Catalog, CatalogQuery, MemoryAssetReader, StacCatalog, StaticCatalog};

#[cfg(feature = "python")]
mod python {
    use crate::core::{composite, indices, stats, tide};
    use crate::types::{Composite, Dataset, GeoTransform, GridSpec};
    use crate::viz::{render_layer, LayerStyle, Palette};
    use chrono::{TimeZone, Utc};
    use numpy::{IntoPyArray, PyArray2, PyArray3, PyReadonlyArray2, PyReadonlyArray3};
    use pyo3::prelude::*;

    fn to_py_err(e: crate::types::EoError) -> PyErr {
        PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e))
    }

    /// Wrap a bare `(time, y, x)` stack as a single-band dataset on a unit grid
    fn stack_dataset(stack: ndarray::Array3<f32>) -> PyResult<Dataset> {
        let (n_t, h, w) = stack.dim();
        let grid = GridSpec::new(w, h, GeoTransform::north_up(0.0, h as f64, 1.0), 4326);
        let times = (0..n_t)
            .map(|i| {
                Utc.timestamp_opt(i as i64 * 86_400, 0)
                    .single()
                    .ok_or_else(|| PyErr::new::<pyo3::exceptions::PyValueError, _>("bad time index"))
            })
            .collect::<PyResult<Vec<_>>>()?;
        let mut ds = Dataset::new(times, grid);
        ds.insert_band("values", stack).map_err(to_py_err)?;
        Ok(ds)
    }

    fn only_band(composite: Composite) -> PyResult<ndarray::Array2<f32>> {
        composite
            .bands
            .into_values()
            .next()
            .ok_or_else(|| PyErr::new::<pyo3::exceptions::PyRuntimeError, _>("empty composite"))
    }

    /// (a - b) / (a + b) over `(time, y, x)` stacks
    #[pyfunction]
    fn normalized_difference<'py>(
        py: Python<'py>,
        a: PyReadonlyArray3<f32>,
        b: PyReadonlyArray3<f32>,
    ) -> PyResult<&'py PyArray3<f32>> {
        let out = indices::normalized_difference(&a.as_array().to_owned(), &b.as_array().to_owned())
            .map_err(to_py_err)?;
        Ok(out.into_pyarray(py))
    }

    /// NaN-ignoring median over the first axis of a `(time, y, x)` stack
    #[pyfunction]
    fn median_composite<'py>(py: Python<'py>, stack: PyReadonlyArray3<f32>) -> PyResult<&'py PyArray2<f32>> {
        let ds = stack_dataset(stack.as_array().to_owned())?;
        let composite = composite::median_composite(&ds).map_err(to_py_err)?;
        Ok(only_band(composite)?.into_pyarray(py))
    }

    /// Mask tide-excluded pixels and drop emptied time-steps
    #[pyfunction]
    fn filter_by_tide<'py>(
        py: Python<'py>,
        stack: PyReadonlyArray3<f32>,
        tides: PyReadonlyArray3<f32>,
        central_fraction: f64,
    ) -> PyResult<&'py PyArray3<f32>> {
        let ds = stack_dataset(stack.as_array().to_owned())?;
        let filtered = tide::filter_by_tide(&ds, &tides.as_array().to_owned(), central_fraction)
            .map_err(to_py_err)?;
        let values = filtered
            .band("values")
            .cloned()
            .ok_or_else(|| PyErr::new::<pyo3::exceptions::PyRuntimeError, _>("band lost"))?;
        Ok(values.into_pyarray(py))
    }

    /// Indices of steps strictly inside the central tide quantile range
    #[pyfunction]
    fn select_scenes_by_tide(series: Vec<f32>, central_fraction: f64) -> PyResult<Vec<usize>> {
        tide::select_scenes_by_tide(&series, central_fraction).map_err(to_py_err)
    }

    /// Linear-interpolated quantile ignoring NaN
    #[pyfunction]
    fn quantile(values: Vec<f32>, q: f64) -> Option<f32> {
        stats::quantile(&values, q)
    }

    /// RGBA rendering of a 2-D array
    #[pyfunction]
    #[pyo3(signature = (values, palette = "viridis", vmin = 0.0, vmax = 1.0, opacity = 1.0))]
    fn render<'py>(
        py: Python<'py>,
        values: PyReadonlyArray2<f32>,
        palette: &str,
        vmin: f32,
        vmax: f32,
        opacity: f32,
    ) -> PyResult<&'py PyArray3<u8>> {
        let style = LayerStyle {
            palette: palette.parse::<Palette>().map_err(to_py_err)?,
            vmin,
            vmax,
            opacity,
        };
        let img = render_layer(&values.as_array().to_owned(), &style).map_err(to_py_err)?;
        Ok(img.into_pyarray(py))
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(normalized_difference, m)?)?;
        m.add_function(wrap_pyfunction!(median_composite, m)?)?;
        m.add_function(wrap_pyfunction!(filter_by_tide, m)?)?;
        m.add_function(wrap_pyfunction!(select_scenes_by_tide, m)?)?;
        m.add_function(wrap_pyfunction!(quantile, m)?)?;
        m.add_function(wrap_pyfunction!(render, m)?)?;
        Ok(())
    }
}
