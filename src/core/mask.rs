use crate::types::{BandStack, Dataset, EoError, EoResult};
use ndarray::{Array3, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How the quality band flags invalid pixels.
///
/// The variants are not interchangeable: code 8 in a classification band and
/// bit 3 in a packed QA word select different pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MaskPolicy {
    /// Quality value is a class code; listed codes are invalid (Sentinel-2 SCL)
    ClassificationCodes(BTreeSet<u16>),
    /// Quality value is a bit field; any listed bit set is invalid (Landsat QA_PIXEL)
    QualityBits(Vec<u8>),
}

impl MaskPolicy {
    pub fn codes(codes: &[u16]) -> Self {
        Self::ClassificationCodes(codes.iter().copied().collect())
    }

    pub fn bits(bits: &[u8]) -> Self {
        Self::QualityBits(bits.to_vec())
    }

    /// Whether one quality value is flagged invalid
    pub fn is_invalid(&self, quality: u32) -> bool {
        match self {
            Self::ClassificationCodes(codes) => {
                u16::try_from(quality).map_or(false, |q| codes.contains(&q))
            }
            Self::QualityBits(bits) => bits
                .iter()
                .any(|&bit| bit < 32 && quality & (1u32 << bit) != 0),
        }
    }

    fn validate(&self) -> EoResult<()> {
        match self {
            Self::ClassificationCodes(codes) if codes.is_empty() => Err(EoError::InvalidInput(
                "classification mask has no codes".to_string(),
            )),
            Self::QualityBits(bits) if bits.is_empty() => Err(EoError::InvalidInput(
                "quality-bit mask has no bits".to_string(),
            )),
            Self::QualityBits(bits) if bits.iter().any(|&b| b >= 32) => Err(
                EoError::InvalidInput(format!("quality bits out of range: {:?}", bits)),
            ),
            _ => Ok(()),
        }
    }
}

/// Per-sensor conversion from digital numbers to surface reflectance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub scale: f32,
    pub offset: f32,
    /// Digital number marking missing data
    pub nodata: Option<f32>,
    /// Name of the quality/classification band in the raw dataset
    pub quality_band: String,
    pub mask: MaskPolicy,
    /// Reflectance outside this inclusive range is marked absent
    pub valid_range: (f32, f32),
}

impl SensorConfig {
    /// Sentinel-2 Level-2A: DN / 10000, SCL codes for no-data, saturated,
    /// cloud shadow, medium/high cloud and cirrus
    pub fn sentinel2_l2a() -> Self {
        Self {
            name: "sentinel-2-l2a".to_string(),
            scale: 1e-4,
            offset: 0.0,
            nodata: Some(0.0),
            quality_band: "scl".to_string(),
            mask: MaskPolicy::codes(&[0, 1, 3, 8, 9, 10]),
            valid_range: (0.0, 1.0),
        }
    }

    /// Landsat Collection 2 Level-2: DN * 2.75e-5 - 0.2, QA_PIXEL bits for
    /// dilated cloud, cirrus, cloud and cloud shadow
    pub fn landsat_c2_l2() -> Self {
        Self {
            name: "landsat-c2-l2".to_string(),
            scale: 2.75e-5,
            offset: -0.2,
            nodata: Some(0.0),
            quality_band: "qa_pixel".to_string(),
            mask: MaskPolicy::bits(&[1, 2, 3, 4]),
            valid_range: (0.0, 1.0),
        }
    }

    /// Look up a preset by name
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "sentinel-2-l2a" | "sentinel2" | "s2" => Some(Self::sentinel2_l2a()),
            "landsat-c2-l2" | "landsat" | "ls" => Some(Self::landsat_c2_l2()),
            _ => None,
        }
    }

    pub fn validate(&self) -> EoResult<()> {
        if !self.scale.is_finite() || self.scale == 0.0 || !self.offset.is_finite() {
            return Err(EoError::InvalidInput(format!(
                "{}: scale {} / offset {} invalid",
                self.name, self.scale, self.offset
            )));
        }
        if !(self.valid_range.0 <= self.valid_range.1) {
            return Err(EoError::InvalidInput(format!(
                "{}: valid range {:?} is empty",
                self.name, self.valid_range
            )));
        }
        self.mask.validate()
    }

    /// Convert one digital number; `None` for no-data or out-of-range values
    pub fn to_reflectance(&self, dn: f32) -> Option<f32> {
        if dn.is_nan() || self.nodata.map_or(false, |nd| dn == nd) {
            return None;
        }
        let value = dn * self.scale + self.offset;
        if value >= self.valid_range.0 && value <= self.valid_range.1 {
            Some(value)
        } else {
            None
        }
    }
}

/// Invalid-pixel mask (true = invalid) from a quality stack.
/// Quality pixels that are NaN or negative are invalid regardless of policy.
pub fn invalid_mask(quality: &BandStack, policy: &MaskPolicy) -> Array3<bool> {
    quality.mapv(|q| q.is_nan() || q < 0.0 || policy.is_invalid(q as u32))
}

/// Apply the sensor's mask and scale/offset to every reflectance band.
///
/// Returns a dataset with the same time and grid, without the quality band,
/// where each sample is either reflectance within `valid_range` or `NaN`.
pub fn mask_and_normalize(raw: &Dataset, config: &SensorConfig) -> EoResult<Dataset> {
    config.validate()?;
    log::info!(
        "Masking and scaling {} bands with {} (quality band '{}')",
        raw.band_names().len().saturating_sub(1),
        config.name,
        config.quality_band
    );

    let quality = raw.band(&config.quality_band).ok_or_else(|| {
        EoError::InvalidInput(format!(
            "quality band '{}' missing from dataset (bands: {:?})",
            config.quality_band,
            raw.band_names()
        ))
    })?;
    let invalid = invalid_mask(quality, &config.mask);
    let flagged = invalid.iter().filter(|&&m| m).count();
    log::debug!(
        "{} of {} pixels flagged by quality band",
        flagged,
        invalid.len()
    );

    let mut out = Dataset::new(raw.times().to_vec(), raw.grid().clone());
    for (name, stack) in raw.bands() {
        if name == &config.quality_band {
            continue;
        }
        let mut scaled = Array3::from_elem(stack.dim(), f32::NAN);
        Zip::from(&mut scaled)
            .and(stack)
            .and(&invalid)
            .for_each(|px, &dn, &bad| {
                if !bad {
                    if let Some(v) = config.to_reflectance(dn) {
                        *px = v;
                    }
                }
            });
        out.insert_band(name.clone(), scaled)?;
    }
    Ok(out)
}

/// Fraction of absent pixels per time-step, over all bands
pub fn absent_fraction(ds: &Dataset) -> Vec<f64> {
    let (n_t, h, w) = ds.shape();
    let n_bands = ds.band_names().len();
    let total = (h * w * n_bands).max(1) as f64;
    (0..n_t)
        .map(|t| {
            let absent: usize = ds
                .bands()
                .map(|(_, stack)| {
                    stack
                        .index_axis(Axis(0), t)
                        .iter()
                        .filter(|v| v.is_nan())
                        .count()
                })
                .sum();
            absent as f64 / total
        })
        .collect()
}

/// Drop time-steps with no present pixel in any band
pub fn drop_empty_steps(ds: &Dataset) -> EoResult<Dataset> {
    let keep: Vec<usize> = absent_fraction(ds)
        .iter()
        .enumerate()
        .filter(|(_, &f)| f < 1.0)
        .map(|(i, _)| i)
        .collect();
    if keep.is_empty() {
        return Err(EoError::EmptyResult(
            "every time-step is fully masked".to_string(),
        ));
    }
    if keep.len() < ds.len_time() {
        log::info!("Dropping {} fully masked time-steps", ds.len_time() - keep.len());
    }
    ds.select_times(&keep)
}

/// Drop time-steps whose absent fraction exceeds `max_fraction`
pub fn filter_cloud_fraction(ds: &Dataset, max_fraction: f64) -> EoResult<Dataset> {
    let keep: Vec<usize> = absent_fraction(ds)
        .iter()
        .enumerate()
        .filter(|(_, &f)| f <= max_fraction)
        .map(|(i, _)| i)
        .collect();
    if keep.is_empty() {
        return Err(EoError::EmptyResult(format!(
            "no time-step has at most {:.0}% masked pixels",
            max_fraction * 100.0
        )));
    }
    log::info!("Kept {} of {} time-steps under cloud threshold", keep.len(), ds.len_time());
    ds.select_times(&keep)
}
