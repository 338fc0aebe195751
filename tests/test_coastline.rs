use approx::assert_abs_diff_eq;
use chrono::{TimeZone, Utc};
use coastcube::core::coastline::{CoastlineParams, Trend};
use coastcube::core::loader::{LoadParams, MergePolicy};
use coastcube::core::SpectralIndex;
use coastcube::pipeline::write_outputs;
use coastcube::{
    BoundingBox, CatalogQuery, CompositeMode, CompositePipeline, GeoTransform, GridSpec,
    MemoryAssetReader, PipelineConfig, Scene, StaticCatalog,
};
use ndarray::Array2;
use std::collections::BTreeMap;

const FIRST_YEAR: i32 = 2018;
const LAST_YEAR: i32 = 2022;

/// First water column in `year`; the coast retreats west one pixel a year
fn water_start(year: i32) -> usize {
    (6 - (year - FIRST_YEAR)) as usize
}

fn build_archive() -> (Vec<Scene>, MemoryAssetReader) {
    let mut scenes = Vec::new();
    let mut reader = MemoryAssetReader::new();

    for year in FIRST_YEAR..=LAST_YEAR {
        let edge = water_start(year);
        let green = Array2::from_shape_fn((4, 8), |(_, c)| if c >= edge { 1500.0 } else { 500.0 });
        let swir = Array2::from_shape_fn((4, 8), |(_, c)| if c >= edge { 500.0 } else { 1500.0 });

        for month in [3u32, 9] {
            let id = format!("LC_{}_{:02}", year, month);
            let mut assets = BTreeMap::new();
            for band in ["green", "swir16", "scl"] {
                let href = format!("mem://{}/{}.tif", id, band);
                assets.insert(band.to_string(), href.clone());
                let data = match band {
                    "green" => green.clone(),
                    "swir16" => swir.clone(),
                    _ => Array2::from_elem((4, 8), 4.0),
                };
                reader.insert(href, data);
            }
            scenes.push(Scene {
                id,
                collection: "sentinel-2-l2a".to_string(),
                datetime: Utc.with_ymd_and_hms(year, month, 1, 10, 0, 0).unwrap(),
                footprint: BoundingBox::new(18.0, -34.0, 18.1, -33.9),
                cloud_cover: Some(1.0),
                platform: None,
                assets,
            });
        }
    }
    (scenes, reader)
}

fn config() -> PipelineConfig {
    let query = CatalogQuery::new(
        BoundingBox::new(18.0, -34.0, 18.1, -33.9),
        "2018-01-01/2022-12-31",
        "sentinel-2-l2a",
    );
    let mut rename = BTreeMap::new();
    rename.insert("swir16".to_string(), "swir1".to_string());
    let load = LoadParams {
        bands: vec!["green".into(), "swir16".into(), "scl".into()],
        grid: GridSpec::new(8, 4, GeoTransform::north_up(260_000.0, 6_245_040.0, 10.0), 32734),
        chunk_size: (4, 4),
        group_by_day: true,
        merge_policy: MergePolicy::LeastCloudy,
        skip_failures: false,
        rename,
    };
    let mut config = PipelineConfig::new(query, load);
    config.indices = vec![SpectralIndex::Mndwi];
    config.composite = CompositeMode::Annual;
    config.coastline = Some(CoastlineParams {
        spacing: 10.0,
        ..CoastlineParams::default()
    });
    config
}

#[test]
fn test_retreating_shoreline_rate() {
    let _ = env_logger::builder().is_test(true).try_init();

    println!("Building five years of synthetic scenes...");
    let (scenes, reader) = build_archive();
    let pipeline = CompositePipeline::new(config()).expect("config should validate");
    let output = pipeline
        .run(&StaticCatalog::new(scenes), &reader)
        .expect("pipeline run failed");

    assert_eq!(output.composites.len(), 5);
    let years: Vec<i32> = output.composites.iter().filter_map(|c| c.label).collect();
    assert_eq!(years, (FIRST_YEAR..=LAST_YEAR).collect::<Vec<_>>());

    let coast = output.coastline.as_ref().expect("coastline requested");
    assert_eq!(coast.shorelines.len(), 5);
    for (year, lines) in &coast.shorelines {
        assert_eq!(lines.len(), 1, "one shoreline in {}", year);
        // contour sits on the pixel edge west of the first water column
        let expected_x = 260_000.0 + 10.0 * water_start(*year) as f64;
        for &(x, _) in &lines[0].points {
            assert_abs_diff_eq!(x, expected_x, epsilon = 1e-3);
        }
    }

    println!("Sampled {} points on the {} shoreline", coast.points.len(), LAST_YEAR);
    assert!(coast.points.len() >= 3);
    assert_eq!(coast.rates.len(), coast.points.len());
    for rate in &coast.rates {
        println!(
            "  ({:.1}, {:.1}): {:.2} m/yr, p = {:.2e}",
            rate.x, rate.y, rate.rate_m_per_year, rate.p_value
        );
        assert_eq!(rate.n_years, 5);
        assert_abs_diff_eq!(rate.rate_m_per_year, -10.0, epsilon = 1e-4);
        assert!(matches!(rate.trend, Trend::Significant(r) if r < 0.0));
    }
}

#[test]
fn test_coastline_outputs_written() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (scenes, reader) = build_archive();
    let pipeline = CompositePipeline::new(config()).unwrap();
    let output = pipeline.run(&StaticCatalog::new(scenes), &reader).unwrap();

    let dir = tempfile::tempdir().unwrap();
    write_outputs(&output, dir.path()).unwrap();

    let grid: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("grid.json")).unwrap())
            .unwrap();
    assert_eq!(grid["epsg"], 32734);

    let rates: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("rates_of_change.geojson")).unwrap(),
    )
    .unwrap();
    let features = rates["features"].as_array().unwrap();
    assert_eq!(features.len(), output.coastline.as_ref().unwrap().rates.len());
    assert_eq!(features[0]["properties"]["significant"], true);
    assert_eq!(features[0]["geometry"]["type"], "Point");

    let shorelines: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("shorelines.geojson")).unwrap(),
    )
    .unwrap();
    let years: Vec<i64> = shorelines["features"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|f| f["properties"]["year"].as_i64())
        .collect();
    assert_eq!(years, vec![2018, 2019, 2020, 2021, 2022]);
}

#[test]
fn test_too_few_years_fails() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (scenes, reader) = build_archive();
    let mut cfg = config();
    cfg.query.datetime = "2021-01-01/2022-12-31".to_string();
    let pipeline = CompositePipeline::new(cfg).unwrap();
    assert!(pipeline.run(&StaticCatalog::new(scenes), &reader).is_err());
}
