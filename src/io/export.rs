//! Output artifacts: GeoJSON for vector results, GeoTIFF for rasters.

use crate::core::coastline::{Contour, RateOfChange, Trend};
use crate::io::points::TrainingPoint;
use crate::types::{EoResult, GridSpec};
use serde_json::{json, Value};
use std::path::Path;

fn feature_collection(features: Vec<Value>, epsg: u32) -> Value {
    json!({
        "type": "FeatureCollection",
        "crs": {
            "type": "name",
            "properties": { "name": format!("urn:ogc:def:crs:EPSG::{}", epsg) }
        },
        "features": features,
    })
}

fn write_json<P: AsRef<Path>>(value: &Value, path: P) -> EoResult<()> {
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path.as_ref(), text)?;
    log::info!("Wrote {}", path.as_ref().display());
    Ok(())
}

/// Contours as a GeoJSON collection of LineStrings, one per contour
pub fn contours_to_geojson(contours: &[(i32, Vec<Contour>)], epsg: u32) -> Value {
    let features = contours
        .iter()
        .flat_map(|(year, lines)| {
            lines.iter().map(move |line| {
                let coords: Vec<[f64; 2]> = line.points.iter().map(|&(x, y)| [x, y]).collect();
                json!({
                    "type": "Feature",
                    "geometry": { "type": "LineString", "coordinates": coords },
                    "properties": { "year": year, "length_m": line.length() },
                })
            })
        })
        .collect();
    feature_collection(features, epsg)
}

pub fn write_contours<P: AsRef<Path>>(
    contours: &[(i32, Vec<Contour>)],
    epsg: u32,
    path: P,
) -> EoResult<()> {
    write_json(&contours_to_geojson(contours, epsg), path)
}

/// Rates of change as GeoJSON points
pub fn rates_to_geojson(rates: &[RateOfChange], epsg: u32) -> Value {
    let features = rates
        .iter()
        .map(|r| {
            let (rate, significant) = match r.trend {
                Trend::Significant(rate) => (Value::from(rate), true),
                Trend::NotSignificant => (Value::Null, false),
            };
            json!({
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": [r.x, r.y] },
                "properties": {
                    "rate_time": rate,
                    "significant": significant,
                    "slope_m_per_year": r.rate_m_per_year,
                    "std_error": r.std_error,
                    "p_value": r.p_value,
                    "n_years": r.n_years,
                },
            })
        })
        .collect();
    feature_collection(features, epsg)
}

pub fn write_rates<P: AsRef<Path>>(rates: &[RateOfChange], epsg: u32, path: P) -> EoResult<()> {
    write_json(&rates_to_geojson(rates, epsg), path)
}

pub fn write_training_points<P: AsRef<Path>>(
    points: &[TrainingPoint],
    label_field: &str,
    epsg: u32,
    path: P,
) -> EoResult<()> {
    let features = points
        .iter()
        .map(|p| {
            let mut props = serde_json::Map::new();
            props.insert(label_field.to_string(), Value::from(p.label));
            json!({
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": [p.x, p.y] },
                "properties": props,
            })
        })
        .collect();
    write_json(&feature_collection(features, epsg), path)
}

/// Save a single-band float raster as GeoTIFF (absent pixels as NaN no-data)
#[cfg(feature = "gdal")]
pub fn save_geotiff<P: AsRef<Path>>(
    image: &ndarray::Array2<f32>,
    grid: &GridSpec,
    output_path: P,
) -> EoResult<()> {
    use gdal::DriverManager;

    log::info!("Saving raster as GeoTIFF: {}", output_path.as_ref().display());
    let (height, width) = image.dim();
    if (height, width) != grid.shape() {
        return Err(crate::types::EoError::ShapeMismatch(format!(
            "image {:?} does not match grid {:?}",
            image.dim(),
            grid.shape()
        )));
    }

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut dataset = driver.create_with_band_type::<f32, _>(
        output_path.as_ref(),
        width as isize,
        height as isize,
        1,
    )?;
    dataset.set_geo_transform(&grid.transform.to_gdal())?;
    dataset.set_spatial_ref(&gdal::spatial_ref::SpatialRef::from_epsg(grid.epsg)?)?;

    let mut band = dataset.rasterband(1)?;
    let flat: Vec<f32> = image.iter().cloned().collect();
    let buffer = gdal::raster::Buffer::new((width, height), flat);
    band.write((0, 0), (width, height), &buffer)?;
    band.set_no_data_value(Some(f32::NAN as f64))?;
    Ok(())
}

/// Save a class-label raster as GeoTIFF
#[cfg(feature = "gdal")]
pub fn save_classes_geotiff<P: AsRef<Path>>(
    classes: &ndarray::Array2<i32>,
    grid: &GridSpec,
    nodata: i32,
    output_path: P,
) -> EoResult<()> {
    use gdal::DriverManager;

    log::info!("Saving class raster as GeoTIFF: {}", output_path.as_ref().display());
    let (height, width) = classes.dim();
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut dataset = driver.create_with_band_type::<i32, _>(
        output_path.as_ref(),
        width as isize,
        height as isize,
        1,
    )?;
    dataset.set_geo_transform(&grid.transform.to_gdal())?;
    dataset.set_spatial_ref(&gdal::spatial_ref::SpatialRef::from_epsg(grid.epsg)?)?;

    let mut band = dataset.rasterband(1)?;
    let flat: Vec<i32> = classes.iter().cloned().collect();
    let buffer = gdal::raster::Buffer::new((width, height), flat);
    band.write((0, 0), (width, height), &buffer)?;
    band.set_no_data_value(Some(nodata as f64))?;
    Ok(())
}

/// Raster grid description written next to exports when GDAL is unavailable
pub fn grid_to_json(grid: &GridSpec) -> Value {
    json!({
        "width": grid.width,
        "height": grid.height,
        "geotransform": grid.transform.to_gdal(),
        "epsg": grid.epsg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;

    #[test]
    fn test_contours_geojson_shape() {
        let contours = vec![(
            2020,
            vec![Contour {
                points: vec![(0.0, 0.0), (3.0, 4.0)],
            }],
        )];
        let gj = contours_to_geojson(&contours, 32756);
        assert_eq!(gj["features"].as_array().unwrap().len(), 1);
        assert_eq!(gj["features"][0]["properties"]["year"], 2020);
        assert_eq!(gj["features"][0]["properties"]["length_m"], 5.0);
        assert_eq!(gj["crs"]["properties"]["name"], "urn:ogc:def:crs:EPSG::32756");
    }

    #[test]
    fn test_write_training_points_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.geojson");
        let points = vec![TrainingPoint { x: 1.0, y: 2.0, label: 3 }];
        write_training_points(&points, "class", 4326, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let parsed = crate::io::points::parse_training_points(&text, "class", None).unwrap();
        assert_eq!(parsed, points);
    }

    #[test]
    fn test_grid_json() {
        let grid = GridSpec::new(2, 3, GeoTransform::north_up(1.0, 2.0, 30.0), 32633);
        let v = grid_to_json(&grid);
        assert_eq!(v["geotransform"][5], -30.0);
    }
}
