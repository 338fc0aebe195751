use approx::assert_abs_diff_eq;
use chrono::{TimeZone, Utc};
use coastcube::core::loader::{LoadParams, MergePolicy};
use coastcube::core::mask::{MaskPolicy, SensorConfig};
use coastcube::core::SpectralIndex;
use coastcube::{
    BoundingBox, CatalogQuery, CompositePipeline, EoError, GeoTransform, GridSpec,
    MemoryAssetReader, PipelineConfig, Scene, StaticCatalog,
};
use ndarray::Array2;
use std::collections::BTreeMap;

const COLLECTION: &str = "sentinel-2-l2a";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn footprint() -> BoundingBox {
    BoundingBox::new(150.0, -34.0, 150.1, -33.9)
}

fn grid() -> GridSpec {
    GridSpec::new(4, 3, GeoTransform::north_up(500_000.0, 6_000_030.0, 10.0), 32756)
}

fn scene(i: usize, day: u32) -> Scene {
    let assets: BTreeMap<String, String> = ["red", "nir", "scl"]
        .iter()
        .map(|b| (b.to_string(), format!("mem://scene{}/{}.tif", i, b)))
        .collect();
    Scene {
        id: format!("S2A_TEST_{}", i),
        collection: COLLECTION.to_string(),
        datetime: Utc.with_ymd_and_hms(2021, 1, day, 0, 5, 0).unwrap(),
        footprint: footprint(),
        cloud_cover: Some(5.0 * i as f64),
        platform: Some("sentinel-2a".to_string()),
        assets,
    }
}

/// Red DN grows with the scene index and the pixel position; NIR is constant per scene
fn add_scene_rasters(reader: &mut MemoryAssetReader, i: usize, scl: Array2<f32>) {
    let red = Array2::from_shape_fn((3, 4), |(r, c)| (1000 * (i + 1) + 10 * (r * 4 + c)) as f32);
    let nir = Array2::from_elem((3, 4), (3000 + 100 * i) as f32);
    reader.insert(format!("mem://scene{}/red.tif", i), red);
    reader.insert(format!("mem://scene{}/nir.tif", i), nir);
    reader.insert(format!("mem://scene{}/scl.tif", i), scl);
}

fn config() -> PipelineConfig {
    let query = CatalogQuery::new(footprint(), "2021-01-01/2021-01-31", COLLECTION);
    let load = LoadParams {
        bands: vec!["red".into(), "nir".into(), "scl".into()],
        grid: grid(),
        chunk_size: (2, 2),
        group_by_day: true,
        merge_policy: MergePolicy::LeastCloudy,
        skip_failures: true,
        rename: BTreeMap::new(),
    };
    let mut config = PipelineConfig::new(query, load);
    config.sensor = SensorConfig {
        mask: MaskPolicy::codes(&[8, 9]),
        ..SensorConfig::sentinel2_l2a()
    };
    config.indices = vec![SpectralIndex::Ndvi];
    config
}

#[test]
fn test_cloudy_scene_excluded_from_median() {
    init_logging();

    let scenes: Vec<Scene> = (0..4).map(|i| scene(i, 5 + 5 * i as u32)).collect();
    let mut reader = MemoryAssetReader::new();
    for i in 0..3 {
        add_scene_rasters(&mut reader, i, Array2::from_elem((3, 4), 4.0));
    }
    // fourth scene is entirely high-probability cloud
    add_scene_rasters(&mut reader, 3, Array2::from_elem((3, 4), 9.0));

    let pipeline = CompositePipeline::new(config()).unwrap();
    let output = pipeline
        .run(&StaticCatalog::new(scenes), &reader)
        .expect("pipeline run failed");

    println!("Kept {} time-steps", output.dataset.len_time());
    assert_eq!(output.scenes.len(), 4);
    assert_eq!(output.dataset.len_time(), 3, "fully masked step must be dropped");
    assert_eq!(output.composites.len(), 1);

    let composite = &output.composites[0];
    let red = composite.require_band("red").unwrap();
    let nir = composite.require_band("nir").unwrap();
    for ((r, c), &value) in red.indexed_iter() {
        // median of 1000, 2000, 3000 (+ pixel offset) scaled by 1e-4
        let expected = (2000 + 10 * (r * 4 + c)) as f32 * 1e-4;
        assert_abs_diff_eq!(value, expected, epsilon = 1e-6);
        assert_abs_diff_eq!(nir[[r, c]], 0.31, epsilon = 1e-6);
    }

    let ndvi = composite.require_band("ndvi").unwrap();
    assert!(ndvi.iter().all(|v| v.is_finite() && *v > 0.0));
    assert!(composite.band("scl").is_none(), "quality band is not composited");
}

#[test]
fn test_partially_masked_pixel_uses_remaining_scenes() {
    init_logging();

    let scenes: Vec<Scene> = (0..3).map(|i| scene(i, 5 + 5 * i as u32)).collect();
    let mut reader = MemoryAssetReader::new();
    let mut shadow = Array2::from_elem((3, 4), 4.0);
    shadow[[0, 0]] = 3.0; // cloud shadow is not in the configured codes
    shadow[[1, 1]] = 8.0;
    add_scene_rasters(&mut reader, 0, shadow);
    for i in 1..3 {
        add_scene_rasters(&mut reader, i, Array2::from_elem((3, 4), 4.0));
    }

    let pipeline = CompositePipeline::new(config()).unwrap();
    let output = pipeline.run(&StaticCatalog::new(scenes), &reader).unwrap();
    let red = output.composites[0].require_band("red").unwrap();

    assert_abs_diff_eq!(red[[0, 0]], 0.2, epsilon = 1e-6);
    // two clear observations left: mean of the middle pair
    let expected = ((2000 + 50) as f32 * 1e-4 + (3000 + 50) as f32 * 1e-4) / 2.0;
    assert_abs_diff_eq!(red[[1, 1]], expected, epsilon = 1e-6);
}

#[test]
fn test_unreadable_scene_is_skipped() {
    init_logging();

    let scenes: Vec<Scene> = (0..3).map(|i| scene(i, 5 + 5 * i as u32)).collect();
    let mut reader = MemoryAssetReader::new();
    for i in 0..2 {
        add_scene_rasters(&mut reader, i, Array2::from_elem((3, 4), 4.0));
    }
    // scene 2 has no rasters behind its hrefs

    let pipeline = CompositePipeline::new(config()).unwrap();
    let output = pipeline.run(&StaticCatalog::new(scenes.clone()), &reader).unwrap();
    assert_eq!(output.dataset.len_time(), 2);

    let mut strict = config();
    strict.load.skip_failures = false;
    let pipeline = CompositePipeline::new(strict).unwrap();
    match pipeline.run(&StaticCatalog::new(scenes), &reader) {
        Err(EoError::AssetFetch { href, .. }) => assert!(href.contains("scene2")),
        other => panic!("expected asset fetch error, got {:?}", other.map(|o| o.composites.len())),
    }
}

#[test]
fn test_no_scenes_is_empty_result() {
    init_logging();

    let mut cfg = config();
    cfg.query.datetime = "2022-01-01/2022-12-31".to_string();
    let pipeline = CompositePipeline::new(cfg).unwrap();
    let scenes: Vec<Scene> = (0..2).map(|i| scene(i, 5)).collect();
    let result = pipeline.run(&StaticCatalog::new(scenes), &MemoryAssetReader::new());
    assert!(matches!(result, Err(EoError::EmptyResult(_))));
}
