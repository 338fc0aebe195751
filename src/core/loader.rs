use crate::io::assets::{AssetReader, Window};
use crate::types::{
    BandStack, BoundingBox, Dataset, EoError, EoResult, GridSpec, Raster, Scene,
};
use chrono::{DateTime, NaiveDate, Utc};
use ndarray::{s, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// How scenes acquired on the same day are merged into one time-step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Fill each pixel from the least cloudy scene that has data there
    LeastCloudy,
    /// Fill each pixel from the first scene (catalog order) that has data there
    FirstValid,
}

/// Band loading parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadParams {
    /// Asset keys to load, e.g. `["red", "nir", "scl"]`
    pub bands: Vec<String>,
    /// Output grid all assets are read onto
    pub grid: GridSpec,
    /// Tile size in pixels (rows, cols)
    pub chunk_size: (usize, usize),
    /// Merge scenes from the same calendar day into one time-step
    pub group_by_day: bool,
    pub merge_policy: MergePolicy,
    /// Drop unreadable scenes with a warning instead of failing
    pub skip_failures: bool,
    /// Optional asset key -> dataset band name
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
}

impl LoadParams {
    /// Grid covering `bbox` at `resolution`, with default chunking and merging
    pub fn for_bbox(
        bands: &[&str],
        bbox: &BoundingBox,
        resolution: f64,
        epsg: u32,
    ) -> EoResult<Self> {
        Ok(Self {
            bands: bands.iter().map(|b| b.to_string()).collect(),
            grid: GridSpec::from_bbox(bbox, resolution, epsg)?,
            chunk_size: (2048, 2048),
            group_by_day: true,
            merge_policy: MergePolicy::LeastCloudy,
            skip_failures: true,
            rename: BTreeMap::new(),
        })
    }

    /// Dataset band name for an asset key
    pub fn output_name<'a>(&'a self, asset_key: &'a str) -> &'a str {
        self.rename
            .get(asset_key)
            .map(String::as_str)
            .unwrap_or(asset_key)
    }
}

/// Scenes that make up one output time-step, in merge order
#[derive(Debug, Clone)]
pub struct TimeStep {
    pub time: DateTime<Utc>,
    pub scenes: Vec<Scene>,
}

/// A dataset that has been planned but not read.
///
/// Holds the time-steps, the scenes behind each one and the tile windows.
/// No pixels are transferred until [`LazyDataset::realize`].
#[derive(Debug, Clone)]
pub struct LazyDataset {
    steps: Vec<TimeStep>,
    params: LoadParams,
    tiles: Vec<Window>,
}

impl LazyDataset {
    pub fn steps(&self) -> &[TimeStep] {
        &self.steps
    }

    pub fn times(&self) -> Vec<DateTime<Utc>> {
        self.steps.iter().map(|s| s.time).collect()
    }

    pub fn tiles(&self) -> &[Window] {
        &self.tiles
    }

    pub fn grid(&self) -> &GridSpec {
        &self.params.grid
    }

    pub fn band_names(&self) -> Vec<String> {
        self.params
            .bands
            .iter()
            .map(|b| self.params.output_name(b).to_string())
            .collect()
    }

    /// Number of (scene, band, tile) reads `realize` will issue
    pub fn n_reads(&self) -> usize {
        let scenes: usize = self.steps.iter().map(|s| s.scenes.len()).sum();
        scenes * self.params.bands.len() * self.tiles.len()
    }

    /// Fetch every tile of every band and assemble the dataset.
    ///
    /// Blocks until all tiles are read. With `skip_failures`, a scene whose
    /// assets cannot be read is dropped and its day is built from the rest;
    /// days left without any scene are removed.
    pub fn realize(&self, reader: &dyn AssetReader) -> EoResult<Dataset> {
        log::info!(
            "Realizing {} time-steps x {} bands over {} tiles ({} reads)",
            self.steps.len(),
            self.params.bands.len(),
            self.tiles.len(),
            self.n_reads()
        );

        let (height, width) = self.params.grid.shape();
        let n_bands = self.params.bands.len();
        let mut times = Vec::with_capacity(self.steps.len());
        let mut step_data: Vec<Vec<Raster>> = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let mut merged: Vec<Raster> = (0..n_bands)
                .map(|_| Array2::from_elem((height, width), f32::NAN))
                .collect();
            let mut filled = Array2::from_elem((height, width), false);
            let mut used = 0usize;

            for scene in &step.scenes {
                let bands = match self.fetch_scene(reader, scene) {
                    Ok(bands) => bands,
                    Err(e) if self.params.skip_failures => {
                        log::warn!("Skipping scene {}: {}", scene.id, e);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                merge_into(&mut merged, &mut filled, &bands);
                used += 1;
            }

            if used == 0 {
                log::warn!("No readable scenes for {}, dropping time-step", step.time);
                continue;
            }
            times.push(step.time);
            step_data.push(merged);
        }

        if times.is_empty() {
            return Err(EoError::EmptyResult(
                "every time-step failed to load".to_string(),
            ));
        }

        let mut dataset = Dataset::new(times, self.params.grid.clone());
        for (b, key) in self.params.bands.iter().enumerate() {
            let mut stack: BandStack = Array3::from_elem(dataset.shape(), f32::NAN);
            for (t, rasters) in step_data.iter().enumerate() {
                stack.index_axis_mut(Axis(0), t).assign(&rasters[b]);
            }
            dataset.insert_band(self.params.output_name(key), stack)?;
        }
        log::info!("Realized dataset with shape {:?}", dataset.shape());
        Ok(dataset)
    }

    /// Read all requested bands of one scene, tile by tile
    fn fetch_scene(&self, reader: &dyn AssetReader, scene: &Scene) -> EoResult<Vec<Raster>> {
        let grid = &self.params.grid;
        let mut hrefs = Vec::with_capacity(self.params.bands.len());
        for band in &self.params.bands {
            let href = scene.asset(band).ok_or_else(|| EoError::AssetFetch {
                href: format!("{}#{}", scene.id, band),
                reason: "scene has no such asset".to_string(),
            })?;
            hrefs.push(href);
        }

        let tasks: Vec<(usize, Window)> = (0..hrefs.len())
            .flat_map(|b| self.tiles.iter().map(move |w| (b, *w)))
            .collect();

        #[cfg(feature = "parallel")]
        let iter = tasks.into_par_iter();
        #[cfg(not(feature = "parallel"))]
        let iter = tasks.into_iter();

        let pieces: EoResult<Vec<(usize, Window, Raster)>> = iter
            .map(|(b, window)| {
                let tile = reader.read_window(hrefs[b], grid, &window)?;
                if tile.dim() != window.shape() {
                    return Err(EoError::ShapeMismatch(format!(
                        "reader returned {:?} for window {:?}",
                        tile.dim(),
                        window
                    )));
                }
                Ok((b, window, tile))
            })
            .collect();

        let mut bands: Vec<Raster> = (0..hrefs.len())
            .map(|_| Array2::from_elem(grid.shape(), f32::NAN))
            .collect();
        for (b, w, tile) in pieces? {
            bands[b]
                .slice_mut(s![w.row..w.row + w.height, w.col..w.col + w.width])
                .assign(&tile);
        }
        log::debug!("Fetched scene {} ({} bands)", scene.id, bands.len());
        Ok(bands)
    }
}

/// Copy every band of `scene` into pixels of `merged` not yet filled.
/// A pixel is taken from a scene when any of its bands has data there, so all
/// bands of one output pixel come from the same scene.
fn merge_into(merged: &mut [Raster], filled: &mut Array2<bool>, scene: &[Raster]) {
    for ((r, c), done) in filled.indexed_iter_mut() {
        if *done {
            continue;
        }
        if scene.iter().any(|band| !band[[r, c]].is_nan()) {
            for (out, band) in merged.iter_mut().zip(scene) {
                out[[r, c]] = band[[r, c]];
            }
            *done = true;
        }
    }
}

/// Plans band loading for a set of scenes
pub struct BandLoader;

impl BandLoader {
    /// Build the lazy plan: validate assets, group by day, order each day's
    /// scenes by the merge policy and tile the grid.
    pub fn lazy_load(scenes: &[Scene], params: LoadParams) -> EoResult<LazyDataset> {
        if params.bands.is_empty() {
            return Err(EoError::InvalidInput("no bands requested".to_string()));
        }
        if params.chunk_size.0 == 0 || params.chunk_size.1 == 0 {
            return Err(EoError::InvalidInput("chunk size must be positive".to_string()));
        }
        if params.grid.width == 0 || params.grid.height == 0 {
            return Err(EoError::InvalidInput("output grid is empty".to_string()));
        }

        let mut usable = Vec::with_capacity(scenes.len());
        for scene in scenes {
            match params.bands.iter().find(|b| scene.asset(b).is_none()) {
                None => usable.push(scene.clone()),
                Some(missing) if params.skip_failures => {
                    log::warn!("Scene {} has no '{}' asset, skipping", scene.id, missing);
                }
                Some(missing) => {
                    return Err(EoError::AssetFetch {
                        href: format!("{}#{}", scene.id, missing),
                        reason: "scene has no such asset".to_string(),
                    });
                }
            }
        }

        let mut steps = if params.group_by_day {
            group_by_day(usable)
        } else {
            usable
                .into_iter()
                .map(|scene| TimeStep {
                    time: scene.datetime,
                    scenes: vec![scene],
                })
                .collect::<Vec<_>>()
        };
        steps.sort_by_key(|s| s.time);

        if params.merge_policy == MergePolicy::LeastCloudy {
            for step in &mut steps {
                // stable: ties keep catalog order; unknown cloud cover goes last
                step.scenes.sort_by(|a, b| {
                    let ca = a.cloud_cover.unwrap_or(f64::INFINITY);
                    let cb = b.cloud_cover.unwrap_or(f64::INFINITY);
                    ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }

        if steps.is_empty() {
            return Err(EoError::EmptyResult("no scenes left to load".to_string()));
        }

        let tiles = Window::tiles(&params.grid, params.chunk_size);
        log::info!(
            "Planned {} time-steps from {} scenes, {} tiles of {:?}",
            steps.len(),
            scenes.len(),
            tiles.len(),
            params.chunk_size
        );
        Ok(LazyDataset {
            steps,
            params,
            tiles,
        })
    }
}

/// Group scenes by UTC calendar day, keeping input order within each day.
/// Each group's time is its earliest acquisition.
pub fn group_by_day(scenes: Vec<Scene>) -> Vec<TimeStep> {
    let mut groups: BTreeMap<NaiveDate, Vec<Scene>> = BTreeMap::new();
    for scene in scenes {
        groups.entry(scene.date()).or_default().push(scene);
    }
    groups
        .into_values()
        .filter_map(|scenes| {
            let time = scenes.iter().map(|s| s.datetime).min()?;
            Some(TimeStep { time, scenes })
        })
        .collect()
}
