//! Tide modelling and tide-aware scene selection.
//!
//! A [`TideModel`] is a set of stations, each described by harmonic
//! constituents. Heights are predicted at stations, spread to arbitrary
//! locations by inverse-distance weighting, and resampled to the image grid
//! from a coarse lattice of model points.

use crate::core::stats::{quantile, quantile_sorted};
use crate::types::{Dataset, EoError, EoResult};
use chrono::{DateTime, Utc};
use ndarray::{Array2, Array3, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Unix timestamp of 1900-01-01T00:00:00Z, the phase reference of the constituents
const TIDE_EPOCH_UNIX_SECONDS: f64 = -2_208_988_800.0;

/// Inverse-distance weighting exponent
const IDW_POWER: i32 = 2;

/// One harmonic constituent of a station's tide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constituent {
    pub name: String,
    pub amplitude_m: f64,
    /// Phase lag relative to the 1900 epoch
    pub phase_deg: f64,
    pub speed_deg_per_hour: f64,
}

/// Harmonic description of the tide at one location (dataset CRS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TideStation {
    #[serde(default)]
    pub name: Option<String>,
    pub x: f64,
    pub y: f64,
    /// Added to every prediction, e.g. to shift from mean sea level to a chart datum
    #[serde(default)]
    pub datum_offset_m: f64,
    pub constituents: Vec<Constituent>,
}

impl TideStation {
    /// Predicted water level at `time`, metres
    pub fn height(&self, time: &DateTime<Utc>) -> f64 {
        let t = hours_since_epoch(time);
        self.datum_offset_m
            + self
                .constituents
                .iter()
                .map(|c| {
                    let arg = (c.speed_deg_per_hour * t - c.phase_deg).to_radians();
                    c.amplitude_m * arg.cos()
                })
                .sum::<f64>()
    }
}

fn hours_since_epoch(time: &DateTime<Utc>) -> f64 {
    let seconds = time.timestamp() as f64 + f64::from(time.timestamp_subsec_nanos()) * 1e-9;
    (seconds - TIDE_EPOCH_UNIX_SECONDS) / 3600.0
}

/// Parameters for tide-based filtering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TideFilterParams {
    /// Directory of station JSON files
    pub model_dir: String,
    /// Fraction of the tide distribution to keep, centred on the median
    pub central_fraction: f64,
    /// Spacing of model points, in pixels
    pub resolution: usize,
}

impl Default for TideFilterParams {
    fn default() -> Self {
        Self {
            model_dir: "tide_models".to_string(),
            central_fraction: 0.4, // middle 40%
            resolution: 10,
        }
    }
}

/// A collection of tide stations
#[derive(Debug, Clone)]
pub struct TideModel {
    stations: Vec<TideStation>,
}

impl TideModel {
    pub fn from_stations(stations: Vec<TideStation>) -> EoResult<Self> {
        if stations.is_empty() {
            return Err(EoError::InvalidInput(
                "tide model has no stations".to_string(),
            ));
        }
        Ok(Self { stations })
    }

    /// Load every `*.json` station file in `dir`
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> EoResult<Self> {
        let dir = dir.as_ref();
        log::info!("Loading tide model from {}", dir.display());

        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
            .collect();
        paths.sort();

        let stations = paths
            .iter()
            .map(|p| -> EoResult<TideStation> {
                let text = std::fs::read_to_string(p)?;
                let station: TideStation = serde_json::from_str(&text)?;
                log::debug!(
                    "Station {} at ({}, {}) with {} constituents",
                    p.display(),
                    station.x,
                    station.y,
                    station.constituents.len()
                );
                Ok(station)
            })
            .collect::<EoResult<Vec<_>>>()?;

        if stations.is_empty() {
            return Err(EoError::InvalidInput(format!(
                "no tide station files in {}",
                dir.display()
            )));
        }
        log::info!("Loaded {} tide stations", stations.len());
        Self::from_stations(stations)
    }

    pub fn stations(&self) -> &[TideStation] {
        &self.stations
    }

    /// Tide height at `(x, y)`, inverse-distance weighted over all stations
    pub fn height_at(&self, x: f64, y: f64, time: &DateTime<Utc>) -> f64 {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for station in &self.stations {
            let d2 = (station.x - x).powi(2) + (station.y - y).powi(2);
            if d2 == 0.0 {
                return station.height(time);
            }
            let w = 1.0 / d2.sqrt().powi(IDW_POWER);
            weighted += w * station.height(time);
            total_weight += w;
        }
        weighted / total_weight
    }
}

/// Heights at each point for each time, shaped `(time, point)`
pub fn tide_heights_at_points(
    model: &TideModel,
    points: &[(f64, f64)],
    times: &[DateTime<Utc>],
) -> Array2<f32> {
    Array2::from_shape_fn((times.len(), points.len()), |(t, p)| {
        let (x, y) = points[p];
        model.height_at(x, y, &times[t]) as f32
    })
}

/// One tide value per time-step, taken at the centre of the dataset grid
pub fn scene_tides(model: &TideModel, ds: &Dataset) -> Vec<f32> {
    let grid = ds.grid();
    let centre = grid
        .transform
        .pixel_to_map(grid.width as f64 / 2.0, grid.height as f64 / 2.0);
    tide_heights_at_points(model, &[centre], ds.times())
        .index_axis(Axis(1), 0)
        .to_vec()
}

/// Model-point indices along one axis: every `step` pixels plus the last one
fn lattice(len: usize, step: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..len).step_by(step).collect();
    if let Some(&last) = idx.last() {
        if last + 1 != len {
            idx.push(len - 1);
        }
    }
    idx
}

/// Position of `i` within the sorted lattice: lower node, upper node, fraction
fn bracket(nodes: &[usize], i: usize) -> (usize, usize, f32) {
    let upper = nodes.partition_point(|&n| n < i).min(nodes.len() - 1);
    if nodes[upper] == i || upper == 0 {
        return (upper, upper, 0.0);
    }
    let lower = upper - 1;
    let frac = (i - nodes[lower]) as f32 / (nodes[upper] - nodes[lower]) as f32;
    (lower, upper, frac)
}

/// Bilinear resampling of a lattice of values to the full `(height, width)` grid
fn resample_bilinear(
    coarse: &Array2<f32>,
    rows: &[usize],
    cols: &[usize],
    height: usize,
    width: usize,
) -> Array2<f32> {
    let row_brackets: Vec<_> = (0..height).map(|r| bracket(rows, r)).collect();
    let col_brackets: Vec<_> = (0..width).map(|c| bracket(cols, c)).collect();
    Array2::from_shape_fn((height, width), |(r, c)| {
        let (r0, r1, fy) = row_brackets[r];
        let (c0, c1, fx) = col_brackets[c];
        let top = coarse[[r0, c0]] * (1.0 - fx) + coarse[[r0, c1]] * fx;
        let bottom = coarse[[r1, c0]] * (1.0 - fx) + coarse[[r1, c1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

/// Per-pixel tide heights shaped like the dataset, `(time, y, x)`.
///
/// The model is evaluated every `resolution` pixels and bilinearly
/// interpolated in between.
pub fn pixel_tides(model: &TideModel, ds: &Dataset, resolution: usize) -> EoResult<Array3<f32>> {
    if resolution == 0 {
        return Err(EoError::InvalidInput(
            "tide model resolution must be at least one pixel".to_string(),
        ));
    }
    let (n_t, height, width) = ds.shape();
    if n_t == 0 || height == 0 || width == 0 {
        return Ok(Array3::zeros((n_t, height, width)));
    }

    let grid = ds.grid();
    let rows = lattice(height, resolution);
    let cols = lattice(width, resolution);
    log::info!(
        "Modelling tides at {}x{} points for {} time-steps",
        rows.len(),
        cols.len(),
        n_t
    );

    let slice_for = |time: &DateTime<Utc>| {
        let coarse = Array2::from_shape_fn((rows.len(), cols.len()), |(i, j)| {
            let (x, y) = grid.transform.pixel_center(rows[i], cols[j]);
            model.height_at(x, y, time) as f32
        });
        resample_bilinear(&coarse, &rows, &cols, height, width)
    };

    #[cfg(feature = "parallel")]
    let slices: Vec<Array2<f32>> = ds.times().par_iter().map(slice_for).collect();
    #[cfg(not(feature = "parallel"))]
    let slices: Vec<Array2<f32>> = ds.times().iter().map(slice_for).collect();

    let views: Vec<_> = slices.iter().map(|s| s.view()).collect();
    ndarray::stack(Axis(0), &views).map_err(|e| EoError::ShapeMismatch(e.to_string()))
}

/// Values at the `lower_q` and `upper_q` quantiles, ignoring NaN
pub fn quantile_range(values: &[f32], lower_q: f64, upper_q: f64) -> Option<(f32, f32)> {
    Some((quantile(values, lower_q)?, quantile(values, upper_q)?))
}

fn central_bounds(central_fraction: f64) -> EoResult<(f64, f64)> {
    if !(central_fraction > 0.0 && central_fraction <= 1.0) {
        return Err(EoError::InvalidInput(format!(
            "central tide fraction must be in (0, 1], got {}",
            central_fraction
        )));
    }
    Ok(((1.0 - central_fraction) / 2.0, (1.0 + central_fraction) / 2.0))
}

/// Indices of the steps whose tide lies strictly inside the central
/// `central_fraction` of `series`
pub fn select_scenes_by_tide(series: &[f32], central_fraction: f64) -> EoResult<Vec<usize>> {
    let (lo_q, hi_q) = central_bounds(central_fraction)?;
    let (lo, hi) = quantile_range(series, lo_q, hi_q)
        .ok_or_else(|| EoError::EmptyResult("tide series has no values".to_string()))?;
    log::debug!("Tide window ({:.3}, {:.3}) m", lo, hi);

    let keep: Vec<usize> = series
        .iter()
        .enumerate()
        .filter(|(_, &v)| v > lo && v < hi)
        .map(|(i, _)| i)
        .collect();
    if keep.is_empty() {
        return Err(EoError::EmptyResult(
            "no scene falls inside the tide window".to_string(),
        ));
    }
    Ok(keep)
}

/// Mask every pixel observed outside its own central tide range, then drop
/// time-steps left with no qualifying pixel.
pub fn filter_by_tide(
    ds: &Dataset,
    tides: &Array3<f32>,
    central_fraction: f64,
) -> EoResult<Dataset> {
    if tides.dim() != ds.shape() {
        return Err(EoError::ShapeMismatch(format!(
            "tide array {:?} does not match dataset {:?}",
            tides.dim(),
            ds.shape()
        )));
    }
    let (lo_q, hi_q) = central_bounds(central_fraction)?;

    let bounds = tides.map_axis(Axis(0), |series| {
        let mut present: Vec<f32> = series.iter().copied().filter(|v| !v.is_nan()).collect();
        if present.is_empty() {
            return (f32::NAN, f32::NAN);
        }
        present.sort_by(|a, b| a.total_cmp(b));
        (quantile_sorted(&present, lo_q), quantile_sorted(&present, hi_q))
    });

    let mut excluded = Array3::from_elem(tides.dim(), true);
    for (mut excl_t, tide_t) in excluded.outer_iter_mut().zip(tides.outer_iter()) {
        Zip::from(&mut excl_t)
            .and(&tide_t)
            .and(&bounds)
            .for_each(|e, &h, &(lo, hi)| *e = !(h > lo && h < hi));
    }

    let keep: Vec<usize> = excluded
        .outer_iter()
        .enumerate()
        .filter(|(_, step)| step.iter().any(|&e| !e))
        .map(|(t, _)| t)
        .collect();
    if keep.is_empty() {
        return Err(EoError::EmptyResult(
            "tide filter removed every time-step".to_string(),
        ));
    }
    log::info!(
        "Tide filter keeps {} of {} time-steps",
        keep.len(),
        ds.len_time()
    );

    let mut masked = Dataset::new(ds.times().to_vec(), ds.grid().clone());
    for (name, stack) in ds.bands() {
        let mut stack = stack.clone();
        Zip::from(&mut stack).and(&excluded).for_each(|v, &e| {
            if e {
                *v = f32::NAN;
            }
        });
        masked.insert_band(name.clone(), stack)?;
    }
    masked.select_times(&keep)
}
