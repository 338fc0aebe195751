//! Shoreline extraction and rates of coastal change.
//!
//! Annual water-index composites are contoured at a threshold with marching
//! squares. Points are spaced along the most recent shoreline, and for each
//! point a linear trend is fitted to its signed distance from every year's
//! shoreline.

use crate::core::stats::linear_regression;
use crate::types::{Composite, EoError, EoResult, GeoTransform, Raster};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Shoreline and trend parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoastlineParams {
    /// Water index to contour
    pub band: String,
    /// Index value separating land (below) from water (above)
    pub threshold: f32,
    /// Distance between sampled points along the baseline, map units
    pub spacing: f64,
    /// Trends with a p-value at or below this are significant
    pub p_cutoff: f64,
}

impl Default for CoastlineParams {
    fn default() -> Self {
        Self {
            band: "mndwi".to_string(),
            threshold: 0.0,
            spacing: 30.0,
            p_cutoff: 0.01,
        }
    }
}

/// A polyline in map coordinates. Closed rings repeat their first point.
#[derive(Debug, Clone, PartialEq)]
pub struct Contour {
    pub points: Vec<(f64, f64)>,
}

impl Contour {
    pub fn length(&self) -> f64 {
        self.points
            .windows(2)
            .map(|w| ((w[1].0 - w[0].0).powi(2) + (w[1].1 - w[0].1).powi(2)).sqrt())
            .sum()
    }

    pub fn is_closed(&self) -> bool {
        self.points.len() > 2 && self.points.first() == self.points.last()
    }

    /// Shortest distance from `(x, y)` to any segment of the line
    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        match self.points.as_slice() {
            [] => f64::INFINITY,
            [p] => ((p.0 - x).powi(2) + (p.1 - y).powi(2)).sqrt(),
            pts => pts
                .windows(2)
                .map(|w| segment_distance((x, y), w[0], w[1]))
                .fold(f64::INFINITY, f64::min),
        }
    }
}

fn segment_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len2 = dx * dx + dy * dy;
    let t = if len2 == 0.0 {
        0.0
    } else {
        (((p.0 - a.0) * dx + (p.1 - a.1) * dy) / len2).clamp(0.0, 1.0)
    };
    let (cx, cy) = (a.0 + t * dx, a.1 + t * dy);
    ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt()
}

/// Cell edge crossed by a contour, keyed by the corner it starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Edge {
    /// Between (row, col) and (row, col + 1)
    Horizontal(usize, usize),
    /// Between (row, col) and (row + 1, col)
    Vertical(usize, usize),
}

struct Tracer<'a> {
    raster: &'a Raster,
    transform: &'a GeoTransform,
    threshold: f32,
}

impl<'a> Tracer<'a> {
    /// Map position where the contour crosses `edge`, linearly interpolated
    /// between the two pixel centres.
    fn crossing(&self, edge: Edge) -> (f64, f64) {
        let ((r0, c0), (r1, c1)) = match edge {
            Edge::Horizontal(r, c) => ((r, c), (r, c + 1)),
            Edge::Vertical(r, c) => ((r, c), (r + 1, c)),
        };
        let v0 = self.raster[[r0, c0]] as f64;
        let v1 = self.raster[[r1, c1]] as f64;
        let t = if v1 == v0 {
            0.5
        } else {
            ((self.threshold as f64 - v0) / (v1 - v0)).clamp(0.0, 1.0)
        };
        let row = r0 as f64 + t * (r1 as f64 - r0 as f64) + 0.5;
        let col = c0 as f64 + t * (c1 as f64 - c0 as f64) + 0.5;
        self.transform.pixel_to_map(col, row)
    }

    /// Segments of one cell whose top-left pixel is (r, c)
    fn cell_segments(&self, r: usize, c: usize, out: &mut Vec<(Edge, Edge)>) {
        let tl = self.raster[[r, c]];
        let tr = self.raster[[r, c + 1]];
        let br = self.raster[[r + 1, c + 1]];
        let bl = self.raster[[r + 1, c]];
        if tl.is_nan() || tr.is_nan() || br.is_nan() || bl.is_nan() {
            return;
        }

        let above = |v: f32| v > self.threshold;
        let case = (above(tl) as u8) << 3
            | (above(tr) as u8) << 2
            | (above(br) as u8) << 1
            | above(bl) as u8;

        let top = Edge::Horizontal(r, c);
        let bottom = Edge::Horizontal(r + 1, c);
        let left = Edge::Vertical(r, c);
        let right = Edge::Vertical(r, c + 1);
        let centre_above = above((tl + tr + br + bl) / 4.0);

        match case {
            0 | 15 => {}
            1 | 14 => out.push((left, bottom)),
            2 | 13 => out.push((bottom, right)),
            3 | 12 => out.push((left, right)),
            4 | 11 => out.push((top, right)),
            6 | 9 => out.push((top, bottom)),
            7 | 8 => out.push((left, top)),
            5 => {
                if centre_above {
                    out.push((left, top));
                    out.push((bottom, right));
                } else {
                    out.push((top, right));
                    out.push((left, bottom));
                }
            }
            10 => {
                if centre_above {
                    out.push((top, right));
                    out.push((left, bottom));
                } else {
                    out.push((left, top));
                    out.push((bottom, right));
                }
            }
            _ => unreachable!("marching squares case is four bits"),
        }
    }

    fn trace(&self) -> Vec<Contour> {
        let (height, width) = self.raster.dim();
        let mut segments = Vec::new();
        for r in 0..height.saturating_sub(1) {
            for c in 0..width.saturating_sub(1) {
                self.cell_segments(r, c, &mut segments);
            }
        }

        let mut incident: HashMap<Edge, Vec<usize>> = HashMap::new();
        for (i, &(a, b)) in segments.iter().enumerate() {
            incident.entry(a).or_default().push(i);
            incident.entry(b).or_default().push(i);
        }

        let mut used = vec![false; segments.len()];
        let mut lines = Vec::new();

        // open lines first, starting from their ends, then the remaining rings
        let mut starts: Vec<(usize, Edge)> = Vec::new();
        for (i, &(a, b)) in segments.iter().enumerate() {
            if incident[&a].len() == 1 {
                starts.push((i, a));
            } else if incident[&b].len() == 1 {
                starts.push((i, b));
            }
        }
        starts.extend(segments.iter().enumerate().map(|(i, &(a, _))| (i, a)));

        for (first, start) in starts {
            if used[first] {
                continue;
            }
            let mut path = vec![start];
            let mut current = start;
            let mut next_seg = Some(first);
            while let Some(seg) = next_seg {
                used[seg] = true;
                let (a, b) = segments[seg];
                current = if a == current { b } else { a };
                path.push(current);
                next_seg = incident[&current].iter().copied().find(|&s| !used[s]);
            }
            lines.push(Contour {
                points: path.into_iter().map(|e| self.crossing(e)).collect(),
            });
        }
        lines
    }
}

/// Iso-lines of `band` at `threshold`, through pixel centres in map coordinates.
///
/// Cells touching an absent value produce no segment.
pub fn extract_contour(composite: &Composite, band: &str, threshold: f32) -> EoResult<Vec<Contour>> {
    let raster = composite.require_band(band)?;
    if raster.dim() != composite.grid.shape() {
        return Err(EoError::ShapeMismatch(format!(
            "band '{}' is {:?}, grid is {:?}",
            band,
            raster.dim(),
            composite.grid.shape()
        )));
    }
    let tracer = Tracer {
        raster,
        transform: &composite.grid.transform,
        threshold,
    };
    let contours = tracer.trace();
    log::debug!(
        "Contoured '{}' at {}: {} lines",
        band,
        threshold,
        contours.len()
    );
    Ok(contours)
}

fn composite_year(composite: &Composite) -> EoResult<i32> {
    composite.label.ok_or_else(|| {
        EoError::InvalidInput("shoreline composites must be labelled with a year".to_string())
    })
}

/// One set of shoreline contours per labelled composite, ascending by year
pub fn annual_shorelines(
    composites: &[Composite],
    band: &str,
    threshold: f32,
) -> EoResult<Vec<(i32, Vec<Contour>)>> {
    let mut shorelines = composites
        .iter()
        .map(|c| -> EoResult<_> { Ok((composite_year(c)?, extract_contour(c, band, threshold)?)) })
        .collect::<EoResult<Vec<_>>>()?;
    shorelines.sort_by_key(|(year, _)| *year);
    log::info!("Extracted shorelines for {} years", shorelines.len());
    Ok(shorelines)
}

/// Points every `spacing` map units along each contour of the most recent
/// year, starting at distance zero on every contour
pub fn sample_points(shorelines: &[(i32, Vec<Contour>)], spacing: f64) -> EoResult<Vec<(f64, f64)>> {
    if !(spacing > 0.0) {
        return Err(EoError::InvalidInput(format!(
            "point spacing must be positive, got {}",
            spacing
        )));
    }
    let (year, baseline) = shorelines
        .iter()
        .max_by_key(|(year, _)| *year)
        .filter(|(_, lines)| !lines.is_empty())
        .ok_or_else(|| EoError::EmptyResult("no baseline shoreline to sample".to_string()))?;

    let mut points = Vec::new();
    for line in baseline {
        let mut offset = 0.0;
        for w in line.points.windows(2) {
            let (a, b) = (w[0], w[1]);
            let len = ((b.0 - a.0).powi(2) + (b.1 - a.1).powi(2)).sqrt();
            if len == 0.0 {
                continue;
            }
            while offset <= len {
                let t = offset / len;
                points.push((a.0 + t * (b.0 - a.0), a.1 + t * (b.1 - a.1)));
                offset += spacing;
            }
            offset -= len;
        }
    }
    log::info!("Sampled {} points along the {} shoreline", points.len(), year);
    Ok(points)
}

/// Outcome of the trend test at one point
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trend {
    /// Rate in map units per year
    Significant(f64),
    NotSignificant,
}

/// Linear trend of shoreline position at one sampled point
#[derive(Debug, Clone, PartialEq)]
pub struct RateOfChange {
    pub x: f64,
    pub y: f64,
    /// Regression slope; negative values mean the shoreline moved landward
    pub rate_m_per_year: f64,
    pub std_error: f64,
    pub p_value: f64,
    pub n_years: usize,
    pub trend: Trend,
}

/// Signed distance from a point to each year's shoreline and its linear trend.
///
/// Distances are positive when the point lies on land in that year (the
/// shoreline is seaward of it) and negative when it is in water. Years where
/// the point has no index value are skipped; points with fewer than three
/// usable years get `NaN` statistics.
pub fn rates_of_change(
    points: &[(f64, f64)],
    shorelines: &[(i32, Vec<Contour>)],
    composites: &[Composite],
    band: &str,
    threshold: f32,
    p_cutoff: f64,
) -> EoResult<Vec<RateOfChange>> {
    if shorelines.len() < 3 {
        return Err(EoError::EmptyResult(format!(
            "rates of change need at least 3 years of shorelines, got {}",
            shorelines.len()
        )));
    }

    let mut by_year: HashMap<i32, &Composite> = HashMap::new();
    for c in composites {
        by_year.insert(composite_year(c)?, c);
    }
    let years = shorelines
        .iter()
        .map(|(year, lines)| -> EoResult<_> {
            let composite = by_year.get(year).ok_or_else(|| {
                EoError::InvalidInput(format!("no composite for shoreline year {}", year))
            })?;
            Ok((*year, lines.as_slice(), composite.require_band(band)?, *composite))
        })
        .collect::<EoResult<Vec<_>>>()?;

    let rate_at = |&(x, y): &(f64, f64)| {
        let mut t = Vec::with_capacity(years.len());
        let mut d = Vec::with_capacity(years.len());
        for &(year, lines, index, composite) in &years {
            let Some((row, col)) = composite.grid.nearest_pixel(x, y) else {
                continue;
            };
            let value = index[[row, col]];
            if value.is_nan() || lines.is_empty() {
                continue;
            }
            let distance = lines
                .iter()
                .map(|l| l.distance_to(x, y))
                .fold(f64::INFINITY, f64::min);
            let sign = if value < threshold { 1.0 } else { -1.0 };
            t.push(year as f64);
            d.push(sign * distance);
        }

        match linear_regression(&t, &d) {
            Ok(fit) => RateOfChange {
                x,
                y,
                rate_m_per_year: fit.slope,
                std_error: fit.std_error,
                p_value: fit.p_value,
                n_years: t.len(),
                trend: if fit.p_value <= p_cutoff {
                    Trend::Significant(fit.slope)
                } else {
                    Trend::NotSignificant
                },
            },
            Err(_) => RateOfChange {
                x,
                y,
                rate_m_per_year: f64::NAN,
                std_error: f64::NAN,
                p_value: f64::NAN,
                n_years: t.len(),
                trend: Trend::NotSignificant,
            },
        }
    };

    #[cfg(feature = "parallel")]
    let rates: Vec<RateOfChange> = points.par_iter().map(rate_at).collect();
    #[cfg(not(feature = "parallel"))]
    let rates: Vec<RateOfChange> = points.iter().map(rate_at).collect();

    let significant = rates
        .iter()
        .filter(|r| matches!(r.trend, Trend::Significant(_)))
        .count();
    log::info!(
        "Rates of change at {} points, {} significant at p <= {}",
        rates.len(),
        significant,
        p_cutoff
    );
    Ok(rates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GridSpec;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};
    use std::collections::BTreeMap;

    fn composite(values: Raster, label: Option<i32>) -> Composite {
        let (h, w) = values.dim();
        let grid = GridSpec::new(w, h, GeoTransform::north_up(0.0, h as f64 * 10.0, 10.0), 32756);
        let mut bands = BTreeMap::new();
        bands.insert("mndwi".to_string(), values);
        Composite { grid, bands, label }
    }

    #[test]
    fn test_straight_contour() {
        let c = composite(array![[-1.0, -1.0, 1.0], [-1.0, -1.0, 1.0]], None);
        let lines = extract_contour(&c, "mndwi", 0.0).unwrap();
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert_eq!(line.points.len(), 2);
        for &(x, _) in &line.points {
            assert_abs_diff_eq!(x, 20.0, epsilon = 1e-9);
        }
        assert_abs_diff_eq!(line.length(), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_closed_ring_around_peak() {
        let c = composite(
            array![[-1.0, -1.0, -1.0], [-1.0, 1.0, -1.0], [-1.0, -1.0, -1.0]],
            None,
        );
        let lines = extract_contour(&c, "mndwi", 0.0).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].is_closed());
        assert_eq!(lines[0].points.len(), 5);
    }

    #[test]
    fn test_absent_cells_skipped() {
        let c = composite(array![[-1.0, f32::NAN, 1.0], [-1.0, f32::NAN, 1.0]], None);
        assert!(extract_contour(&c, "mndwi", 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_sample_points_spacing() {
        let shorelines = vec![
            (2019, vec![Contour { points: vec![(0.0, 0.0), (100.0, 0.0)] }]),
            (2020, vec![Contour { points: vec![(0.0, 0.0), (0.0, 25.0), (0.0, 50.0)] }]),
        ];
        let pts = sample_points(&shorelines, 20.0).unwrap();
        assert_eq!(pts.len(), 3);
        for (p, expected) in pts.iter().zip([0.0, 20.0, 40.0]) {
            assert_abs_diff_eq!(p.0, 0.0);
            assert_abs_diff_eq!(p.1, expected, epsilon = 1e-9);
        }
        assert!(sample_points(&shorelines, 0.0).is_err());
    }

    /// Vertical shoreline, water to the east, retreating one pixel per year
    fn retreating_coast(n_years: i32) -> Vec<Composite> {
        (0..n_years)
            .map(|k| {
                let values = Array2::from_shape_fn((4, 10), |(_, c)| c as f32 - (7 - k) as f32);
                composite(values, Some(2018 + k))
            })
            .collect()
    }

    #[test]
    fn test_rates_of_change_erosion() {
        let composites = retreating_coast(5);
        let shorelines = annual_shorelines(&composites, "mndwi", 0.0).unwrap();
        assert_eq!(shorelines.first().unwrap().0, 2018);

        let points = sample_points(&shorelines, 10.0).unwrap();
        assert_eq!(points.len(), 4);
        let rates = rates_of_change(&points, &shorelines, &composites, "mndwi", 0.0, 0.01).unwrap();
        for rate in &rates {
            assert_eq!(rate.n_years, 5);
            assert_abs_diff_eq!(rate.rate_m_per_year, -10.0, epsilon = 1e-6);
            match rate.trend {
                Trend::Significant(r) => assert_abs_diff_eq!(r, -10.0, epsilon = 1e-6),
                Trend::NotSignificant => panic!("exact trend should be significant"),
            }
        }
    }

    #[test]
    fn test_rates_need_three_years() {
        let composites = retreating_coast(2);
        let shorelines = annual_shorelines(&composites, "mndwi", 0.0).unwrap();
        let points = sample_points(&shorelines, 10.0).unwrap();
        assert!(matches!(
            rates_of_change(&points, &shorelines, &composites, "mndwi", 0.0, 0.01),
            Err(EoError::EmptyResult(_))
        ));
    }
}
