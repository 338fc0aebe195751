//! Colour-mapping of rasters into RGBA images for map display.

use crate::core::classify::NODATA_CLASS;
use crate::types::{EoError, EoResult};
use ndarray::{Array2, Array3, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Named sequential and diverging colour ramps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Palette {
    Viridis,
    /// Red-yellow-green, for vegetation indices
    RdYlGn,
    /// White to dark blue, for water indices
    Blues,
}

impl Palette {
    fn stops(&self) -> &'static [[u8; 3]] {
        match self {
            Self::Viridis => &[
                [0x44, 0x01, 0x54],
                [0x3b, 0x52, 0x8b],
                [0x21, 0x91, 0x8c],
                [0x5e, 0xc9, 0x62],
                [0xfd, 0xe7, 0x25],
            ],
            Self::RdYlGn => &[
                [0xd7, 0x30, 0x27],
                [0xfc, 0x8d, 0x59],
                [0xfe, 0xe0, 0x8b],
                [0xd9, 0xef, 0x8b],
                [0x91, 0xcf, 0x60],
                [0x1a, 0x98, 0x50],
            ],
            Self::Blues => &[
                [0xf7, 0xfb, 0xff],
                [0xc6, 0xdb, 0xef],
                [0x6b, 0xae, 0xd6],
                [0x21, 0x71, 0xb5],
                [0x08, 0x30, 0x6b],
            ],
        }
    }

    /// Colour at position `t` in [0, 1], linear between stops
    pub fn color_at(&self, t: f32) -> [u8; 3] {
        let stops = self.stops();
        let pos = t.clamp(0.0, 1.0) * (stops.len() - 1) as f32;
        let lo = (pos.floor() as usize).min(stops.len() - 1);
        let hi = (lo + 1).min(stops.len() - 1);
        let frac = pos - lo as f32;
        let mut rgb = [0u8; 3];
        for (i, channel) in rgb.iter_mut().enumerate() {
            let a = stops[lo][i] as f32;
            let b = stops[hi][i] as f32;
            *channel = (a + (b - a) * frac).round() as u8;
        }
        rgb
    }
}

impl FromStr for Palette {
    type Err = EoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "viridis" => Ok(Self::Viridis),
            "rdylgn" => Ok(Self::RdYlGn),
            "blues" => Ok(Self::Blues),
            _ => Err(EoError::InvalidInput(format!("unknown palette '{}'", s))),
        }
    }
}

/// How a single-band layer is drawn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStyle {
    pub palette: Palette,
    pub vmin: f32,
    pub vmax: f32,
    /// 0 transparent, 1 opaque
    pub opacity: f32,
}

impl Default for LayerStyle {
    fn default() -> Self {
        Self {
            palette: Palette::Viridis,
            vmin: 0.0,
            vmax: 1.0,
            opacity: 1.0,
        }
    }
}

impl LayerStyle {
    pub fn new(palette: Palette, vmin: f32, vmax: f32) -> Self {
        Self {
            palette,
            vmin,
            vmax,
            opacity: 1.0,
        }
    }

    fn validate(&self) -> EoResult<()> {
        if !(self.vmax > self.vmin) {
            return Err(EoError::InvalidInput(format!(
                "colour range [{}, {}] is empty",
                self.vmin, self.vmax
            )));
        }
        if !(0.0..=1.0).contains(&self.opacity) {
            return Err(EoError::InvalidInput(format!(
                "opacity must be in [0, 1], got {}",
                self.opacity
            )));
        }
        Ok(())
    }
}

/// Render `values` as an RGBA image shaped `(rows, cols, 4)`.
///
/// Values are clamped to the style's range; absent pixels are fully transparent.
pub fn render_layer(values: &Array2<f32>, style: &LayerStyle) -> EoResult<Array3<u8>> {
    style.validate()?;
    let (rows, cols) = values.dim();
    let alpha = (style.opacity * 255.0).round() as u8;
    let span = style.vmax - style.vmin;

    let mut rgba = Array3::<u8>::zeros((rows, cols, 4));
    Zip::from(rgba.lanes_mut(Axis(2)))
        .and(values)
        .for_each(|mut px, &v| {
            if v.is_nan() {
                return;
            }
            let [r, g, b] = style.palette.color_at((v - style.vmin) / span);
            px[0] = r;
            px[1] = g;
            px[2] = b;
            px[3] = alpha;
        });
    Ok(rgba)
}

/// Render a class raster with a fixed colour per class; unlisted classes and
/// [`NODATA_CLASS`] are transparent
pub fn render_classes(classes: &Array2<i32>, colors: &BTreeMap<i32, [u8; 3]>) -> Array3<u8> {
    let (rows, cols) = classes.dim();
    let mut rgba = Array3::<u8>::zeros((rows, cols, 4));
    Zip::from(rgba.lanes_mut(Axis(2)))
        .and(classes)
        .for_each(|mut px, &c| {
            if c == NODATA_CLASS {
                return;
            }
            if let Some(&[r, g, b]) = colors.get(&c) {
                px[0] = r;
                px[1] = g;
                px[2] = b;
                px[3] = 255;
            }
        });
    rgba
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_palette_endpoints() {
        assert_eq!(Palette::Viridis.color_at(0.0), [0x44, 0x01, 0x54]);
        assert_eq!(Palette::Viridis.color_at(1.0), [0xfd, 0xe7, 0x25]);
        assert_eq!(Palette::Blues.color_at(2.0), [0x08, 0x30, 0x6b]);
        assert_eq!("RdYlGn".parse::<Palette>().unwrap(), Palette::RdYlGn);
        assert!("jet".parse::<Palette>().is_err());
    }

    #[test]
    fn test_render_layer_transparent_absent() {
        let values = array![[-1.0, f32::NAN], [0.0, 1.0]];
        let style = LayerStyle {
            opacity: 0.5,
            ..LayerStyle::new(Palette::RdYlGn, -1.0, 1.0)
        };
        let img = render_layer(&values, &style).unwrap();
        assert_eq!(img.dim(), (2, 2, 4));
        assert_eq!(img[[0, 1, 3]], 0);
        assert_eq!(img[[0, 0, 3]], 128);
        assert_eq!([img[[0, 0, 0]], img[[0, 0, 1]], img[[0, 0, 2]]], [0xd7, 0x30, 0x27]);
        assert_eq!([img[[1, 1, 0]], img[[1, 1, 1]], img[[1, 1, 2]]], [0x1a, 0x98, 0x50]);
    }

    #[test]
    fn test_invalid_style() {
        let values = array![[0.5]];
        assert!(render_layer(&values, &LayerStyle::new(Palette::Blues, 1.0, 1.0)).is_err());
    }

    #[test]
    fn test_render_classes() {
        let classes = array![[1, NODATA_CLASS], [2, 3]];
        let mut colors = BTreeMap::new();
        colors.insert(1, [255, 0, 0]);
        colors.insert(2, [0, 0, 255]);
        let img = render_classes(&classes, &colors);
        assert_eq!(img[[0, 0, 0]], 255);
        assert_eq!(img[[0, 1, 3]], 0);
        assert_eq!(img[[1, 1, 3]], 0);
        assert_eq!(img[[1, 0, 2]], 255);
    }
}
