use crate::types::{BoundingBox, EoError, EoResult};
use serde_json::Value;
use std::path::Path;

/// A labelled point location, in the CRS of the composite it will sample
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingPoint {
    pub x: f64,
    pub y: f64,
    pub label: i32,
}

/// Read labelled points from a GeoJSON FeatureCollection.
///
/// `source` is a local path or an http(s) URL. Each Point feature must carry an
/// integer (or integer-valued string) `label_field` property. Non-point
/// features are skipped with a warning; a point whose label is missing or
/// not an integer is an error, since silently dropping it would shift the
/// class balance. When `bbox` is given, only points inside it are kept.
pub fn read_training_points(
    source: &str,
    label_field: &str,
    bbox: Option<&BoundingBox>,
) -> EoResult<Vec<TrainingPoint>> {
    log::info!("Reading training points from: {}", source);

    let text = if source.starts_with("http://") || source.starts_with("https://") {
        let resp = reqwest::blocking::get(source)?;
        if !resp.status().is_success() {
            return Err(EoError::InvalidInput(format!(
                "fetching {} returned HTTP {}",
                source,
                resp.status()
            )));
        }
        resp.text()?
    } else {
        std::fs::read_to_string(Path::new(source))?
    };

    let points = parse_training_points(&text, label_field, bbox)?;
    log::info!("Loaded {} training points", points.len());
    Ok(points)
}

/// Parse GeoJSON text into training points (see [`read_training_points`])
pub fn parse_training_points(
    geojson: &str,
    label_field: &str,
    bbox: Option<&BoundingBox>,
) -> EoResult<Vec<TrainingPoint>> {
    let root: Value = serde_json::from_str(geojson)?;
    let features = root
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| EoError::InvalidInput("GeoJSON has no 'features' array".to_string()))?;

    let mut points = Vec::with_capacity(features.len());
    for (i, feature) in features.iter().enumerate() {
        let geometry = &feature["geometry"];
        if geometry["type"].as_str() != Some("Point") {
            log::warn!("Feature {} is not a Point, skipping", i);
            continue;
        }
        let coords = geometry["coordinates"]
            .as_array()
            .filter(|c| c.len() >= 2)
            .ok_or_else(|| EoError::InvalidInput(format!("feature {} has bad coordinates", i)))?;
        let (x, y) = match (coords[0].as_f64(), coords[1].as_f64()) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                return Err(EoError::InvalidInput(format!(
                    "feature {} has non-numeric coordinates",
                    i
                )))
            }
        };

        let raw_label = &feature["properties"][label_field];
        let label = raw_label
            .as_i64()
            .or_else(|| raw_label.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
            .and_then(|l| i32::try_from(l).ok())
            .ok_or_else(|| {
                EoError::InvalidInput(format!(
                    "feature {} has no integer '{}' property",
                    i, label_field
                ))
            })?;

        if let Some(b) = bbox {
            if !b.contains(x, y) {
                continue;
            }
        }
        points.push(TrainingPoint { x, y, label });
    }
    Ok(points)
}
