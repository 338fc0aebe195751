use coastcube::core::classify::{
    accuracy, predict_grid, sample_training_set, Classifier, ForestParams, RandomForest,
    NODATA_CLASS,
};
use coastcube::core::loader::LoadParams;
use coastcube::io::points::parse_training_points;
use coastcube::pipeline::write_classification;
use coastcube::viz::render_classes;
use coastcube::{BoundingBox, CatalogQuery, Composite, CompositePipeline, GeoTransform, GridSpec, PipelineConfig};
use ndarray::Array2;
use std::collections::BTreeMap;

const LAND: i32 = 1;
const WATER: i32 = 2;

fn grid() -> GridSpec {
    GridSpec::new(6, 3, GeoTransform::north_up(300_000.0, 6_000_030.0, 10.0), 32756)
}

/// Columns 0-2 are vegetated land, 3-5 open water; pixel (2, 5) is absent
fn composite() -> Composite {
    let ndvi = Array2::from_shape_fn((3, 6), |(r, c)| {
        let k = (r * 6 + c) as f32;
        if (r, c) == (2, 5) {
            f32::NAN
        } else if c < 3 {
            0.6 + 0.01 * k
        } else {
            -0.1 - 0.01 * k
        }
    });
    let mndwi = Array2::from_shape_fn((3, 6), |(r, c)| {
        let k = (r * 6 + c) as f32;
        if c < 3 {
            -0.4 + 0.005 * k
        } else {
            0.4 + 0.01 * k
        }
    });
    let mut bands = BTreeMap::new();
    bands.insert("ndvi".to_string(), ndvi);
    bands.insert("mndwi".to_string(), mndwi);
    Composite {
        grid: grid(),
        bands,
        label: None,
    }
}

/// GeoJSON with five labelled points per class, at pixel centres of rows 0-1
fn points_geojson() -> String {
    let pixels = [
        (0, 0, LAND),
        (0, 1, LAND),
        (0, 2, LAND),
        (1, 0, LAND),
        (1, 1, LAND),
        (0, 3, WATER),
        (0, 4, WATER),
        (0, 5, WATER),
        (1, 3, WATER),
        (1, 4, WATER),
    ];
    let features: Vec<serde_json::Value> = pixels
        .iter()
        .map(|&(r, c, label)| {
            let (x, y) = grid().transform.pixel_center(r, c);
            serde_json::json!({
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [x, y]},
                "properties": {"class": label},
            })
        })
        .collect();
    serde_json::json!({"type": "FeatureCollection", "features": features}).to_string()
}

fn config() -> PipelineConfig {
    let bbox = BoundingBox::new(151.0, -34.0, 151.1, -33.9);
    let load = LoadParams::for_bbox(
        &["green", "nir", "swir16", "scl"],
        &BoundingBox::new(300_000.0, 6_000_000.0, 300_060.0, 6_000_030.0),
        10.0,
        32756,
    )
    .unwrap();
    let mut config = PipelineConfig::new(CatalogQuery::new(bbox, "2021", "sentinel-2-l2a"), load);
    config.classification.feature_bands = vec!["ndvi".to_string(), "mndwi".to_string()];
    config.classification.forest = ForestParams {
        n_trees: 50,
        ..ForestParams::default()
    };
    config
}

#[test]
fn test_separable_points_classified_perfectly() {
    let _ = env_logger::builder().is_test(true).try_init();

    let points = parse_training_points(&points_geojson(), "class", None).unwrap();
    assert_eq!(points.len(), 10);

    let pipeline = CompositePipeline::new(config()).unwrap();
    let result = pipeline.classify(&composite(), &points).unwrap();

    println!("Training accuracy: {:.1}%", result.training_accuracy * 100.0);
    assert_eq!(result.training.len(), 10);
    assert_eq!(result.training_accuracy, 1.0);
    assert_eq!(result.model.classes(), &[LAND, WATER]);

    let classes = &result.prediction.classes;
    for c in 0..3 {
        assert_eq!(classes[[2, c]], LAND, "unlabelled land pixel in column {}", c);
    }
    assert_eq!(classes[[2, 3]], WATER);
    assert_eq!(classes[[2, 4]], WATER);
    assert_eq!(classes[[2, 5]], NODATA_CLASS);

    let counts = result.prediction.class_counts();
    assert_eq!(counts[&LAND], 9);
    assert_eq!(counts[&WATER], 8);

    let mut colors = BTreeMap::new();
    colors.insert(LAND, [34, 139, 34]);
    colors.insert(WATER, [30, 144, 255]);
    let image = render_classes(classes, &colors);
    assert_eq!(image.dim(), (3, 6, 4));
    assert_eq!(image[[2, 5, 3]], 0, "absent pixel is transparent");
    assert_eq!(image[[0, 4, 2]], 255);

    let dir = tempfile::tempdir().unwrap();
    write_classification(&result, &points, "class", dir.path()).unwrap();
    let written = std::fs::read_to_string(dir.path().join("training_points.geojson")).unwrap();
    assert_eq!(parse_training_points(&written, "class", None).unwrap(), points);
}

#[test]
fn test_forest_reproducible_across_runs() {
    let _ = env_logger::builder().is_test(true).try_init();

    let points = parse_training_points(&points_geojson(), "class", None).unwrap();
    let features = vec!["ndvi".to_string(), "mndwi".to_string()];
    let training = sample_training_set(&composite(), &points, &features).unwrap();

    let params = ForestParams {
        n_trees: 15,
        seed: 1234,
        ..ForestParams::default()
    };
    let mut first = RandomForest::new(params.clone());
    let mut second = RandomForest::new(params);
    first.fit(&training).unwrap();
    second.fit(&training).unwrap();

    let a = predict_grid(&composite(), &first, &features).unwrap();
    let b = predict_grid(&composite(), &second, &features).unwrap();
    assert_eq!(a.classes, b.classes);

    let fitted = first.predict(training.features.view()).unwrap();
    assert_eq!(accuracy(&fitted, &training.labels).unwrap(), 1.0);
}

#[test]
fn test_missing_feature_band_is_error() {
    let _ = env_logger::builder().is_test(true).try_init();

    let points = parse_training_points(&points_geojson(), "class", None).unwrap();
    let mut cfg = config();
    cfg.classification.feature_bands.push("evi".to_string());
    let pipeline = CompositePipeline::new(cfg).unwrap();
    assert!(pipeline.classify(&composite(), &points).is_err());
}
