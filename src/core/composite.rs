//! Temporal reductions of a [`Dataset`] into per-pixel [`Composite`]s.

use crate::core::stats::quantile_sorted;
use crate::types::{BandStack, Composite, Dataset, EoError, EoResult, Raster};
use chrono::Datelike;
use ndarray::{Array2, ArrayView1, Axis, Zip};
use std::collections::BTreeMap;

/// Reduce every time series of `stack` with `reduce`, which receives the
/// present (non-NaN) values sorted ascending and never an empty slice.
fn reduce_time<F>(stack: &BandStack, reduce: F) -> Raster
where
    F: Fn(&[f32]) -> f32 + Sync,
{
    let (_, height, width) = stack.dim();
    let mut out = Array2::<f32>::from_elem((height, width), f32::NAN);

    let zip = Zip::from(&mut out).and(stack.lanes(Axis(0)));
    #[cfg(feature = "parallel")]
    zip.par_for_each(|px, series| *px = reduce_lane(series, &reduce));
    #[cfg(not(feature = "parallel"))]
    zip.for_each(|px, series| *px = reduce_lane(series, &reduce));

    out
}

fn reduce_lane<F>(series: ArrayView1<f32>, reduce: &F) -> f32
where
    F: Fn(&[f32]) -> f32,
{
    let mut present: Vec<f32> = series.iter().copied().filter(|v| !v.is_nan()).collect();
    if present.is_empty() {
        return f32::NAN;
    }
    present.sort_by(|a, b| a.total_cmp(b));
    reduce(&present)
}

fn reduce_dataset<F>(ds: &Dataset, label: Option<i32>, reduce: F) -> EoResult<Composite>
where
    F: Fn(&[f32]) -> f32 + Sync + Copy,
{
    if ds.len_time() == 0 {
        return Err(EoError::EmptyResult(
            "cannot composite a dataset with no time-steps".to_string(),
        ));
    }
    let bands = ds
        .bands()
        .map(|(name, stack)| (name.clone(), reduce_time(stack, reduce)))
        .collect();
    Ok(Composite {
        grid: ds.grid().clone(),
        bands,
        label,
    })
}

fn median_of_sorted(sorted: &[f32]) -> f32 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Per-pixel median over time, ignoring absent values.
///
/// Even counts take the mean of the two middle values; a pixel with no
/// present value stays absent. The result does not depend on time-step order.
pub fn median_composite(ds: &Dataset) -> EoResult<Composite> {
    log::info!(
        "Median composite over {} time-steps, {} bands",
        ds.len_time(),
        ds.band_names().len()
    );
    reduce_dataset(ds, None, median_of_sorted)
}

/// One median composite per calendar year, ascending, labelled with the year
pub fn composite_by_year(ds: &Dataset) -> EoResult<Vec<Composite>> {
    if ds.len_time() == 0 {
        return Err(EoError::EmptyResult(
            "cannot composite a dataset with no time-steps".to_string(),
        ));
    }
    let mut by_year: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    for (i, t) in ds.times().iter().enumerate() {
        by_year.entry(t.year()).or_default().push(i);
    }

    by_year
        .into_iter()
        .map(|(year, indices)| {
            log::debug!("Year {}: {} time-steps", year, indices.len());
            let subset = ds.select_times(&indices)?;
            reduce_dataset(&subset, Some(year), median_of_sorted)
        })
        .collect()
}

/// Per-pixel quantile over time, `q` in [0, 1], linear interpolation
pub fn percentile_composite(ds: &Dataset, q: f64) -> EoResult<Composite> {
    if !(0.0..=1.0).contains(&q) {
        return Err(EoError::InvalidInput(format!(
            "quantile must lie in [0, 1], got {}",
            q
        )));
    }
    reduce_dataset(ds, None, move |sorted| quantile_sorted(sorted, q))
}

/// Number of present observations per pixel for one band
pub fn count_valid(ds: &Dataset, band: &str) -> EoResult<Array2<u32>> {
    let stack = ds.require_band(band)?;
    Ok(stack.map_axis(Axis(0), |series| {
        series.iter().filter(|v| !v.is_nan()).count() as u32
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoTransform, GridSpec};
    use approx::assert_abs_diff_eq;
    use chrono::{DateTime, TimeZone, Utc};
    use ndarray::Array3;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()
    }

    fn series_dataset(times: Vec<DateTime<Utc>>, values: Vec<f32>) -> Dataset {
        let n = times.len();
        let grid = GridSpec::new(1, 1, GeoTransform::north_up(0.0, 1.0, 1.0), 32633);
        let mut ds = Dataset::new(times, grid);
        ds.insert_band("red", Array3::from_shape_vec((n, 1, 1), values).unwrap())
            .unwrap();
        ds
    }

    #[test]
    fn test_median_ignores_absent() {
        let nan = f32::NAN;
        let times = (1..=5).map(|d| day(2021, 1, d)).collect();
        let ds = series_dataset(times, vec![0.4, nan, 0.1, 0.3, nan]);
        let comp = median_composite(&ds).unwrap();
        assert_abs_diff_eq!(comp.band("red").unwrap()[[0, 0]], 0.3);
    }

    #[test]
    fn test_median_even_count_and_all_absent() {
        let times = (1..=4).map(|d| day(2021, 1, d)).collect();
        let ds = series_dataset(times, vec![0.4, 0.1, 0.2, 0.3]);
        let comp = median_composite(&ds).unwrap();
        assert_abs_diff_eq!(comp.band("red").unwrap()[[0, 0]], 0.25, epsilon = 1e-7);

        let times = (1..=2).map(|d| day(2021, 1, d)).collect();
        let ds = series_dataset(times, vec![f32::NAN, f32::NAN]);
        assert!(median_composite(&ds).unwrap().band("red").unwrap()[[0, 0]].is_nan());
    }

    #[test]
    fn test_median_order_invariant() {
        let times: Vec<_> = (1..=5).map(|d| day(2021, 1, d)).collect();
        let a = series_dataset(times.clone(), vec![0.5, 0.2, 0.9, f32::NAN, 0.1]);
        let b = a.select_times(&[3, 1, 4, 0, 2]).unwrap();
        let ma = median_composite(&a).unwrap();
        let mb = median_composite(&b).unwrap();
        assert_eq!(ma.band("red").unwrap(), mb.band("red").unwrap());
    }

    #[test]
    fn test_empty_dataset() {
        let ds = series_dataset(vec![], vec![]);
        assert!(matches!(median_composite(&ds), Err(EoError::EmptyResult(_))));
        assert!(composite_by_year(&ds).is_err());
    }

    #[test]
    fn test_composite_by_year() {
        let times = vec![day(2020, 3, 1), day(2019, 5, 1), day(2020, 7, 1), day(2019, 6, 1)];
        let ds = series_dataset(times, vec![1.0, 10.0, 3.0, 20.0]);
        let comps = composite_by_year(&ds).unwrap();
        assert_eq!(comps.len(), 2);
        assert_eq!(comps[0].label, Some(2019));
        assert_abs_diff_eq!(comps[0].band("red").unwrap()[[0, 0]], 15.0);
        assert_eq!(comps[1].label, Some(2020));
        assert_abs_diff_eq!(comps[1].band("red").unwrap()[[0, 0]], 2.0);
    }

    #[test]
    fn test_percentile_and_count() {
        let times = (1..=5).map(|d| day(2021, 1, d)).collect();
        let ds = series_dataset(times, vec![0.0, 1.0, f32::NAN, 2.0, 3.0]);
        let p = percentile_composite(&ds, 0.25).unwrap();
        assert_abs_diff_eq!(p.band("red").unwrap()[[0, 0]], 0.75);
        assert!(percentile_composite(&ds, 1.5).is_err());
        assert_eq!(count_valid(&ds, "red").unwrap()[[0, 0]], 4);
    }
}
