//! Supervised pixel classification.
//!
//! Training rows are sampled from a composite at labelled point locations,
//! a [`RandomForest`] is fitted on them and then applied to every pixel.

use crate::io::points::TrainingPoint;
use crate::types::{Composite, EoError, EoResult, GridSpec};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Class written to pixels that could not be classified
pub const NODATA_CLASS: i32 = -1;

/// Feature matrix and labels, one row per retained training point
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub features: Array2<f32>,
    pub labels: Vec<i32>,
    pub feature_names: Vec<String>,
    /// Index of the originating point for each row
    pub source_rows: Vec<usize>,
    n_points: usize,
}

impl TrainingSet {
    /// Build from a feature matrix, where every row is its own source point.
    ///
    /// Rows with an absent (non-finite) feature are dropped and counted in
    /// [`dropped_rows`](Self::dropped_rows).
    pub fn new(features: Array2<f32>, labels: Vec<i32>, feature_names: Vec<String>) -> EoResult<Self> {
        if features.nrows() != labels.len() {
            return Err(EoError::ShapeMismatch(format!(
                "{} feature rows but {} labels",
                features.nrows(),
                labels.len()
            )));
        }
        if features.ncols() != feature_names.len() {
            return Err(EoError::ShapeMismatch(format!(
                "{} feature columns but {} names",
                features.ncols(),
                feature_names.len()
            )));
        }
        let n = labels.len();
        let keep: Vec<usize> = features
            .outer_iter()
            .enumerate()
            .filter(|(_, row)| row.iter().all(|v| v.is_finite()))
            .map(|(i, _)| i)
            .collect();
        if keep.is_empty() && n > 0 {
            return Err(EoError::EmptyResult(format!(
                "none of {} training rows has a complete feature vector",
                n
            )));
        }
        if keep.len() < n {
            log::warn!("Dropped {} of {} training rows with absent features", n - keep.len(), n);
        }
        Ok(Self {
            features: features.select(Axis(0), &keep),
            labels: keep.iter().map(|&i| labels[i]).collect(),
            feature_names,
            source_rows: keep,
            n_points: n,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    /// Points that produced no row (off-grid or absent feature)
    pub fn dropped_rows(&self) -> usize {
        self.n_points - self.labels.len()
    }

    /// Distinct labels, ascending
    pub fn classes(&self) -> Vec<i32> {
        class_counts(&self.labels).into_keys().collect()
    }
}

/// Sample `feature_bands` of `composite` at each point's nearest pixel.
///
/// Points off the grid or over an absent value are dropped; the remaining
/// rows keep their values and their order.
pub fn sample_training_set(
    composite: &Composite,
    points: &[TrainingPoint],
    feature_bands: &[String],
) -> EoResult<TrainingSet> {
    if feature_bands.is_empty() {
        return Err(EoError::InvalidInput("no feature bands given".to_string()));
    }
    let bands = feature_bands
        .iter()
        .map(|b| composite.require_band(b))
        .collect::<EoResult<Vec<_>>>()?;

    let mut values = Vec::with_capacity(points.len() * bands.len());
    let mut labels = Vec::with_capacity(points.len());
    let mut source_rows = Vec::with_capacity(points.len());

    for (i, point) in points.iter().enumerate() {
        let Some((row, col)) = composite.grid.nearest_pixel(point.x, point.y) else {
            log::debug!("Point {} at ({}, {}) is off the grid", i, point.x, point.y);
            continue;
        };
        let sample: Vec<f32> = bands.iter().map(|b| b[[row, col]]).collect();
        if sample.iter().any(|v| v.is_nan()) {
            continue;
        }
        values.extend(sample);
        labels.push(point.label);
        source_rows.push(i);
    }

    if labels.is_empty() {
        return Err(EoError::EmptyResult(format!(
            "none of {} training points has a complete feature vector",
            points.len()
        )));
    }
    let dropped = points.len() - labels.len();
    if dropped > 0 {
        log::warn!("Dropped {} of {} training points", dropped, points.len());
    }

    let features = Array2::from_shape_vec((labels.len(), bands.len()), values)
        .map_err(|e| EoError::ShapeMismatch(e.to_string()))?;
    Ok(TrainingSet {
        features,
        labels,
        feature_names: feature_bands.to_vec(),
        source_rows,
        n_points: points.len(),
    })
}

/// A model mapping feature rows to class labels
pub trait Classifier: Send + Sync {
    fn fit(&mut self, set: &TrainingSet) -> EoResult<()>;

    /// One label per row of `features`
    fn predict(&self, features: ArrayView2<f32>) -> EoResult<Vec<i32>>;
}

/// How training samples are weighted by class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassWeight {
    Uniform,
    /// `n / (k * n_c)`, so every class carries the same total weight
    Balanced,
}

/// Random forest parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_trees: usize,
    /// `None` grows trees until leaves are pure
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub seed: u64,
    pub class_weight: ClassWeight,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: None,
            min_samples_split: 2,
            seed: 42,
            class_weight: ClassWeight::Balanced,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf(usize),
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
}

/// A single CART tree over class indices
#[derive(Debug, Clone)]
struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    fn predict_row(&self, row: ArrayView1<f32>) -> usize {
        let mut idx = 0;
        loop {
            match self.nodes[idx] {
                Node::Leaf(class) => return class,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => idx = if row[feature] <= threshold { left } else { right },
            }
        }
    }
}

fn gini(counts: &[f64], total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    1.0 - counts.iter().map(|c| (c / total).powi(2)).sum::<f64>()
}

/// Index of the largest entry; ties go to the lowest index
fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

struct TreeBuilder<'a> {
    x: ArrayView2<'a, f32>,
    y: &'a [usize],
    weights: &'a [f64],
    n_classes: usize,
    max_features: usize,
    max_depth: Option<usize>,
    min_samples_split: usize,
    nodes: Vec<Node>,
}

impl<'a> TreeBuilder<'a> {
    fn class_weights(&self, samples: &[usize]) -> Vec<f64> {
        let mut counts = vec![0.0; self.n_classes];
        for &s in samples {
            counts[self.y[s]] += self.weights[s];
        }
        counts
    }

    fn build(&mut self, samples: &mut [usize], depth: usize, rng: &mut StdRng) -> usize {
        let counts = self.class_weights(samples);
        let majority = argmax(&counts);
        let pure = counts.iter().filter(|&&c| c > 0.0).count() <= 1;
        let too_deep = self.max_depth.map_or(false, |d| depth >= d);

        let leaf = |nodes: &mut Vec<Node>| {
            nodes.push(Node::Leaf(majority));
            nodes.len() - 1
        };
        if pure || too_deep || samples.len() < self.min_samples_split {
            return leaf(&mut self.nodes);
        }

        let Some((feature, threshold)) = self.best_split(samples, &counts, rng) else {
            return leaf(&mut self.nodes);
        };

        let mut mid = 0;
        for j in 0..samples.len() {
            if self.x[[samples[j], feature]] <= threshold {
                samples.swap(mid, j);
                mid += 1;
            }
        }
        if mid == 0 || mid == samples.len() {
            return leaf(&mut self.nodes);
        }

        let idx = leaf(&mut self.nodes);
        let (left_samples, right_samples) = samples.split_at_mut(mid);
        let left = self.build(left_samples, depth + 1, rng);
        let right = self.build(right_samples, depth + 1, rng);
        self.nodes[idx] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        idx
    }

    /// Best Gini split over up to `max_features` non-constant features, drawn
    /// in random order. `None` when no split lowers the impurity.
    fn best_split(&self, samples: &[usize], counts: &[f64], rng: &mut StdRng) -> Option<(usize, f32)> {
        let total: f64 = counts.iter().sum();
        let parent = gini(counts, total) * total;

        let mut features: Vec<usize> = (0..self.x.ncols()).collect();
        features.shuffle(rng);

        let mut best: Option<(f64, usize, f32)> = None;
        let mut examined = 0;
        let mut order: Vec<(f32, usize)> = Vec::with_capacity(samples.len());

        for feature in features {
            if examined >= self.max_features {
                break;
            }
            order.clear();
            order.extend(samples.iter().map(|&s| (self.x[[s, feature]], s)));
            order.sort_by(|a, b| a.0.total_cmp(&b.0));
            if order[0].0 == order[order.len() - 1].0 {
                continue;
            }
            examined += 1;

            let mut left = vec![0.0; self.n_classes];
            let mut left_total = 0.0;
            for i in 0..order.len() - 1 {
                let (value, s) = order[i];
                left[self.y[s]] += self.weights[s];
                left_total += self.weights[s];

                let next = order[i + 1].0;
                if value == next {
                    continue;
                }
                let right: Vec<f64> = counts.iter().zip(&left).map(|(c, l)| c - l).collect();
                let right_total = total - left_total;
                let score = gini(&left, left_total) * left_total + gini(&right, right_total) * right_total;

                if best.map_or(true, |(b, _, _)| score < b) {
                    let mut threshold = value + (next - value) / 2.0;
                    if threshold >= next {
                        threshold = value;
                    }
                    best = Some((score, feature, threshold));
                }
            }
        }

        best.filter(|(score, _, _)| *score < parent - 1e-12)
            .map(|(_, feature, threshold)| (feature, threshold))
    }
}

/// Bagged ensemble of CART trees with random feature subsets per split
#[derive(Debug, Clone)]
pub struct RandomForest {
    params: ForestParams,
    classes: Vec<i32>,
    n_features: usize,
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    pub fn new(params: ForestParams) -> Self {
        Self {
            params,
            classes: Vec::new(),
            n_features: 0,
            trees: Vec::new(),
        }
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    /// Labels seen during fitting, ascending
    pub fn classes(&self) -> &[i32] {
        &self.classes
    }

    pub fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }

    fn grow_tree<'a>(
        &self,
        x: ArrayView2<'a, f32>,
        y: &'a [usize],
        weights: &'a [f64],
        by_class: &[Vec<usize>],
        tree_index: usize,
    ) -> DecisionTree {
        let mut rng = StdRng::seed_from_u64(self.params.seed.wrapping_add(tree_index as u64));

        // stratified bootstrap: each class resampled to its own size
        let mut samples: Vec<usize> = Vec::with_capacity(y.len());
        for members in by_class {
            for _ in 0..members.len() {
                samples.push(members[rng.gen_range(0..members.len())]);
            }
        }

        let max_features = ((x.ncols() as f64).sqrt().round() as usize).max(1);
        let mut builder = TreeBuilder {
            x,
            y,
            weights,
            n_classes: by_class.len(),
            max_features,
            max_depth: self.params.max_depth,
            min_samples_split: self.params.min_samples_split.max(2),
            nodes: Vec::new(),
        };
        builder.build(&mut samples, 0, &mut rng);
        DecisionTree {
            nodes: builder.nodes,
        }
    }
}

impl Default for RandomForest {
    fn default() -> Self {
        Self::new(ForestParams::default())
    }
}

impl Classifier for RandomForest {
    fn fit(&mut self, set: &TrainingSet) -> EoResult<()> {
        if set.is_empty() {
            return Err(EoError::EmptyResult("training set is empty".to_string()));
        }
        if self.params.n_trees == 0 {
            return Err(EoError::InvalidInput("forest needs at least one tree".to_string()));
        }
        if set.features.nrows() != set.labels.len() {
            return Err(EoError::ShapeMismatch(format!(
                "{} feature rows but {} labels",
                set.features.nrows(),
                set.labels.len()
            )));
        }

        if set.features.iter().any(|v| !v.is_finite()) {
            return Err(EoError::InvalidInput(
                "training features contain absent values".to_string(),
            ));
        }

        let classes = set.classes();
        let y: Vec<usize> = set
            .labels
            .iter()
            .map(|l| classes.binary_search(l).unwrap_or(0))
            .collect();
        let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); classes.len()];
        for (i, &c) in y.iter().enumerate() {
            by_class[c].push(i);
        }

        let n = y.len() as f64;
        let k = classes.len() as f64;
        let weights: Vec<f64> = match self.params.class_weight {
            ClassWeight::Uniform => vec![1.0; y.len()],
            ClassWeight::Balanced => y
                .iter()
                .map(|&c| n / (k * by_class[c].len() as f64))
                .collect(),
        };

        log::info!(
            "Training random forest: {} trees, {} samples, {} features, {} classes",
            self.params.n_trees,
            set.len(),
            set.n_features(),
            classes.len()
        );

        let x = set.features.view();
        #[cfg(feature = "parallel")]
        let trees: Vec<DecisionTree> = (0..self.params.n_trees)
            .into_par_iter()
            .map(|t| self.grow_tree(x, &y, &weights, &by_class, t))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let trees: Vec<DecisionTree> = (0..self.params.n_trees)
            .map(|t| self.grow_tree(x, &y, &weights, &by_class, t))
            .collect();

        log::debug!(
            "Mean tree size: {:.1} nodes",
            trees.iter().map(|t| t.nodes.len()).sum::<usize>() as f64 / trees.len() as f64
        );

        self.trees = trees;
        self.classes = classes;
        self.n_features = set.n_features();
        Ok(())
    }

    fn predict(&self, features: ArrayView2<f32>) -> EoResult<Vec<i32>> {
        if !self.is_fitted() {
            return Err(EoError::InvalidInput(
                "random forest has not been fitted".to_string(),
            ));
        }
        if features.ncols() != self.n_features {
            return Err(EoError::ShapeMismatch(format!(
                "model expects {} features, got {}",
                self.n_features,
                features.ncols()
            )));
        }

        let vote = |r: usize| {
            let row = features.row(r);
            let mut votes = vec![0.0; self.classes.len()];
            for tree in &self.trees {
                votes[tree.predict_row(row)] += 1.0;
            }
            self.classes[argmax(&votes)]
        };

        #[cfg(feature = "parallel")]
        let labels = (0..features.nrows()).into_par_iter().map(vote).collect();
        #[cfg(not(feature = "parallel"))]
        let labels = (0..features.nrows()).map(vote).collect();
        Ok(labels)
    }
}

/// Class raster produced by applying a model to a composite
#[derive(Debug, Clone)]
pub struct PredictionGrid {
    pub grid: GridSpec,
    pub classes: Array2<i32>,
}

impl PredictionGrid {
    /// Pixel count per class, [`NODATA_CLASS`] included
    pub fn class_counts(&self) -> BTreeMap<i32, usize> {
        let mut counts = BTreeMap::new();
        for &c in self.classes.iter() {
            *counts.entry(c).or_insert(0) += 1;
        }
        counts
    }
}

/// Classify every pixel of `composite`; pixels with any absent feature get
/// [`NODATA_CLASS`]
pub fn predict_grid(
    composite: &Composite,
    model: &dyn Classifier,
    feature_bands: &[String],
) -> EoResult<PredictionGrid> {
    let bands = feature_bands
        .iter()
        .map(|b| composite.require_band(b))
        .collect::<EoResult<Vec<_>>>()?;
    let (height, width) = composite.grid.shape();
    for (name, band) in feature_bands.iter().zip(&bands) {
        if band.dim() != (height, width) {
            return Err(EoError::ShapeMismatch(format!(
                "band '{}' is {:?}, grid is {:?}",
                name,
                band.dim(),
                (height, width)
            )));
        }
    }

    let mut pixels = Vec::new();
    let mut values = Vec::new();
    for r in 0..height {
        for c in 0..width {
            if bands.iter().all(|b| !b[[r, c]].is_nan()) {
                pixels.push((r, c));
                values.extend(bands.iter().map(|b| b[[r, c]]));
            }
        }
    }

    let mut classes = Array2::from_elem((height, width), NODATA_CLASS);
    if !pixels.is_empty() {
        let matrix = Array2::from_shape_vec((pixels.len(), bands.len()), values)
            .map_err(|e| EoError::ShapeMismatch(e.to_string()))?;
        let labels = model.predict(matrix.view())?;
        for (&(r, c), label) in pixels.iter().zip(labels) {
            classes[[r, c]] = label;
        }
    }
    log::info!(
        "Classified {} of {} pixels",
        pixels.len(),
        height * width
    );

    Ok(PredictionGrid {
        grid: composite.grid.clone(),
        classes,
    })
}

/// Fraction of positions where `predicted` equals `truth`
pub fn accuracy(predicted: &[i32], truth: &[i32]) -> EoResult<f64> {
    if predicted.len() != truth.len() {
        return Err(EoError::ShapeMismatch(format!(
            "{} predictions for {} labels",
            predicted.len(),
            truth.len()
        )));
    }
    if truth.is_empty() {
        return Err(EoError::EmptyResult("no labels to score".to_string()));
    }
    let hits = predicted.iter().zip(truth).filter(|(p, t)| p == t).count();
    Ok(hits as f64 / truth.len() as f64)
}

pub fn class_counts(labels: &[i32]) -> BTreeMap<i32, usize> {
    let mut counts = BTreeMap::new();
    for &l in labels {
        *counts.entry(l).or_insert(0) += 1;
    }
    counts
}
