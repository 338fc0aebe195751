//! Spectral indices over band stacks.
//!
//! Indices read canonical band names (`blue`, `green`, `red`, `nir`, `swir1`,
//! `swir2`); use `LoadParams::rename` to map sensor asset keys onto them.
//! Absent inputs and divisions by zero yield `NaN`, which the temporal
//! reductions treat as "no observation".

use crate::types::{BandStack, Dataset, EoError, EoResult};
use ndarray::Zip;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported derived bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpectralIndex {
    /// (nir - red) / (nir + red)
    Ndvi,
    /// McFeeters water index, (green - nir) / (green + nir)
    Ndwi,
    /// Xu modified water index, (green - swir1) / (green + swir1)
    Mndwi,
    /// Moisture index, (nir - swir1) / (nir + swir1)
    Ndmi,
    /// Mangrove vegetation index, (nir - green) / (swir1 - green)
    Mvi,
    /// 2.5 (nir - red) / (nir + 6 red - 7.5 blue + 1), clipped to [-1, 1]
    Evi,
    /// 1.5 (nir - red) / (nir + red + 0.5)
    Savi,
}

impl SpectralIndex {
    pub const ALL: [SpectralIndex; 7] = [
        Self::Ndvi,
        Self::Ndwi,
        Self::Mndwi,
        Self::Ndmi,
        Self::Mvi,
        Self::Evi,
        Self::Savi,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ndvi => "ndvi",
            Self::Ndwi => "ndwi",
            Self::Mndwi => "mndwi",
            Self::Ndmi => "ndmi",
            Self::Mvi => "mvi",
            Self::Evi => "evi",
            Self::Savi => "savi",
        }
    }

    pub fn required_bands(&self) -> &'static [&'static str] {
        match self {
            Self::Ndvi | Self::Savi => &["nir", "red"],
            Self::Ndwi => &["green", "nir"],
            Self::Mndwi => &["green", "swir1"],
            Self::Ndmi => &["nir", "swir1"],
            Self::Mvi => &["nir", "green", "swir1"],
            Self::Evi => &["nir", "red", "blue"],
        }
    }

    /// Compute the index from a dataset's canonical bands
    pub fn compute(&self, ds: &Dataset) -> EoResult<BandStack> {
        let bands = self
            .required_bands()
            .iter()
            .map(|b| ds.require_band(b))
            .collect::<EoResult<Vec<_>>>()?;

        Ok(match self {
            Self::Ndvi | Self::Ndwi | Self::Mndwi | Self::Ndmi => {
                normalized_difference(bands[0], bands[1])?
            }
            Self::Savi => binary(bands[0], bands[1], |nir, red| {
                1.5 * (nir - red) / (nir + red + 0.5)
            })?,
            Self::Mvi => ternary(bands[0], bands[1], bands[2], |nir, green, swir1| {
                (nir - green) / (swir1 - green)
            })?,
            Self::Evi => ternary(bands[0], bands[1], bands[2], |nir, red, blue| {
                let evi = 2.5 * (nir - red) / (nir + 6.0 * red - 7.5 * blue + 1.0);
                if evi.is_nan() {
                    evi
                } else {
                    evi.clamp(-1.0, 1.0)
                }
            })?,
        })
    }
}

impl fmt::Display for SpectralIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SpectralIndex {
    type Err = EoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|i| i.name() == lower)
            .ok_or_else(|| EoError::InvalidInput(format!("unknown index '{}'", s)))
    }
}

fn finite_or_nan(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        f32::NAN
    }
}

fn check_shapes(a: &BandStack, b: &BandStack) -> EoResult<()> {
    if a.dim() != b.dim() {
        return Err(EoError::ShapeMismatch(format!(
            "band shapes differ: {:?} vs {:?}",
            a.dim(),
            b.dim()
        )));
    }
    Ok(())
}

fn binary(a: &BandStack, b: &BandStack, f: impl Fn(f32, f32) -> f32 + Sync) -> EoResult<BandStack> {
    check_shapes(a, b)?;
    let zip = Zip::from(a).and(b);
    #[cfg(feature = "parallel")]
    let out = zip.par_map_collect(|&x, &y| finite_or_nan(f(x, y)));
    #[cfg(not(feature = "parallel"))]
    let out = zip.map_collect(|&x, &y| finite_or_nan(f(x, y)));
    Ok(out)
}

fn ternary(
    a: &BandStack,
    b: &BandStack,
    c: &BandStack,
    f: impl Fn(f32, f32, f32) -> f32 + Sync,
) -> EoResult<BandStack> {
    check_shapes(a, b)?;
    check_shapes(a, c)?;
    let zip = Zip::from(a).and(b).and(c);
    #[cfg(feature = "parallel")]
    let out = zip.par_map_collect(|&x, &y, &z| finite_or_nan(f(x, y, z)));
    #[cfg(not(feature = "parallel"))]
    let out = zip.map_collect(|&x, &y, &z| finite_or_nan(f(x, y, z)));
    Ok(out)
}

/// `(a - b) / (a + b)`, elementwise. Swapping `a` and `b` negates the result.
pub fn normalized_difference(a: &BandStack, b: &BandStack) -> EoResult<BandStack> {
    binary(a, b, |x, y| (x - y) / (x + y))
}

/// New dataset with `index` added as a band named `index.name()`
pub fn add_index(ds: &Dataset, index: SpectralIndex) -> EoResult<Dataset> {
    add_indices(ds, &[index])
}

pub fn add_indices(ds: &Dataset, indices: &[SpectralIndex]) -> EoResult<Dataset> {
    let mut out = ds.clone();
    for index in indices {
        log::debug!("Computing {}", index);
        let values = index.compute(ds)?;
        out.insert_band(index.name(), values)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoTransform, GridSpec};
    use approx::assert_abs_diff_eq;
    use chrono::{TimeZone, Utc};
    use ndarray::Array3;

    fn stack(values: &[f32]) -> BandStack {
        Array3::from_shape_vec((1, 1, values.len()), values.to_vec()).unwrap()
    }

    fn dataset(bands: &[(&str, &[f32])]) -> Dataset {
        let n = bands[0].1.len();
        let grid = GridSpec::new(n, 1, GeoTransform::north_up(0.0, 0.0, 1.0), 4326);
        let mut ds = Dataset::new(vec![Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()], grid);
        for (name, values) in bands {
            ds.insert_band(*name, stack(values)).unwrap();
        }
        ds
    }

    #[test]
    fn test_normalized_difference_antisymmetric() {
        let a = stack(&[0.3, 0.05, 0.7, 0.0, f32::NAN, 0.123]);
        let b = stack(&[0.1, 0.25, 0.7, 0.0, 0.2, 0.987]);
        let ab = normalized_difference(&a, &b).unwrap();
        let ba = normalized_difference(&b, &a).unwrap();
        for (x, y) in ab.iter().zip(ba.iter()) {
            if x.is_nan() {
                assert!(y.is_nan());
            } else {
                assert_eq!(*x, -*y);
            }
        }
        assert_abs_diff_eq!(ab[[0, 0, 0]], 0.5, epsilon = 1e-6);
        assert!(ab[[0, 0, 3]].is_nan(), "0/0 propagates as absent");
    }

    #[test]
    fn test_index_values() {
        let ds = dataset(&[
            ("blue", &[0.05]),
            ("green", &[0.1]),
            ("red", &[0.1]),
            ("nir", &[0.4]),
            ("swir1", &[0.2]),
        ]);
        let out = add_indices(&ds, &SpectralIndex::ALL).unwrap();
        assert_abs_diff_eq!(out.band("ndvi").unwrap()[[0, 0, 0]], 0.6, epsilon = 1e-6);
        assert_abs_diff_eq!(out.band("mndwi").unwrap()[[0, 0, 0]], -1.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out.band("mvi").unwrap()[[0, 0, 0]], 3.0, epsilon = 1e-5);
        // 2.5 * 0.3 / (0.4 + 0.6 - 0.375 + 1) = 0.4615...
        assert_abs_diff_eq!(out.band("evi").unwrap()[[0, 0, 0]], 0.75 / 1.625, epsilon = 1e-5);
        assert_abs_diff_eq!(out.band("savi").unwrap()[[0, 0, 0]], 0.45 / 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_evi_clipped() {
        let ds = dataset(&[("nir", &[0.9]), ("red", &[0.0]), ("blue", &[0.2])]);
        let evi = SpectralIndex::Evi.compute(&ds).unwrap();
        assert_eq!(evi[[0, 0, 0]], 1.0);
    }

    #[test]
    fn test_missing_band_and_parse() {
        let ds = dataset(&[("red", &[0.1])]);
        assert!(SpectralIndex::Ndvi.compute(&ds).is_err());
        assert_eq!("MNDWI".parse::<SpectralIndex>().unwrap(), SpectralIndex::Mndwi);
        assert!("nbr".parse::<SpectralIndex>().is_err());
    }
}
