//! In-memory dataset collaborator: batching, column selection, stage
//! transforms and synthetic data generation.
//!
//! The training core consumes datasets through the [`Dataset`] trait: a
//! batch sampler plus whole-table access for objective evaluation.
//! [`TableDataset`] is the column-labelled in-memory implementation; its
//! [`TableDataset::transform`] pushes the stored rows through a trained
//! stage's expectation map, which is how DBN pretraining chains stages.

use ndarray::{Array2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::Rng;

use crate::system::System;
use crate::units::SDEV_EPS;
use crate::{ModelError, ModelResult};

/// Batch sampler contract of the training core.
pub trait Dataset {
    /// Column labels of the stored table.
    fn columns(&self) -> &[String];

    /// Number of stored rows.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Random `(inputs, targets)` batch of the given size, drawn with
    /// replacement.
    fn batch(&self, size: usize, rng: &mut StdRng) -> (Array2<f64>, Array2<f64>);

    /// The full `(inputs, targets)` table.
    fn all(&self) -> (Array2<f64>, Array2<f64>);
}

/// Column-labelled in-memory data table.
///
/// Input and target column selections default to the whole table (the
/// autoencoder convention: targets are the inputs).
#[derive(Debug, Clone)]
pub struct TableDataset {
    columns: Vec<String>,
    rows: Array2<f64>,
    input_cols: Vec<usize>,
    target_cols: Vec<usize>,
}

impl TableDataset {
    pub fn new(columns: Vec<String>, rows: Array2<f64>) -> ModelResult<Self> {
        if rows.ncols() != columns.len() {
            return Err(ModelError::ShapeMismatch(format!(
                "{} columns for a table with {} labels",
                rows.ncols(),
                columns.len()
            )));
        }
        let all: Vec<usize> = (0..columns.len()).collect();
        Ok(Self {
            columns,
            rows,
            input_cols: all.clone(),
            target_cols: all,
        })
    }

    /// Table with explicit input and target column selections.
    pub fn with_targets(
        columns: Vec<String>,
        rows: Array2<f64>,
        inputs: &[&str],
        targets: &[&str],
    ) -> ModelResult<Self> {
        let mut dataset = Self::new(columns, rows)?;
        dataset.input_cols = dataset.resolve(inputs)?;
        dataset.target_cols = dataset.resolve(targets)?;
        Ok(dataset)
    }

    fn resolve(&self, names: &[&str]) -> ModelResult<Vec<usize>> {
        names
            .iter()
            .map(|name| {
                self.columns
                    .iter()
                    .position(|c| c == name)
                    .ok_or_else(|| ModelError::InvalidConfig(format!("unknown column: {name}")))
            })
            .collect()
    }

    /// Normalize every column to zero mean and unit deviation. Degenerate
    /// columns are guarded with an additive epsilon instead of failing.
    pub fn normalize(&mut self) {
        let n = self.rows.nrows().max(1) as f64;
        let means = self.rows.sum_axis(Axis(0)) / n;
        let sdevs = self.rows.std_axis(Axis(0), 0.0).mapv(|s| s + SDEV_EPS);
        self.rows = (&self.rows - &means) / &sdevs;
    }

    /// Push the stored input rows through a trained system's expectation
    /// map and return the transformed table, labelled by the mapping's
    /// final layer. Used to chain DBN pretraining stages.
    pub fn transform(&self, system: &System, mapping: &[usize]) -> ModelResult<TableDataset> {
        let (inputs, _) = self.all();
        let out = system.expect(&inputs, mapping)?;
        let labels = match mapping.last() {
            Some(&idx) => system.layer_at(idx).labels.clone(),
            None => Vec::new(),
        };
        TableDataset::new(labels, out)
    }

    fn select(&self, row_idx: &[usize], cols: &[usize]) -> Array2<f64> {
        self.rows.select(Axis(0), row_idx).select(Axis(1), cols)
    }
}

impl Dataset for TableDataset {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn len(&self) -> usize {
        self.rows.nrows()
    }

    fn batch(&self, size: usize, rng: &mut StdRng) -> (Array2<f64>, Array2<f64>) {
        let n = self.len();
        if n == 0 {
            return (
                Array2::zeros((0, self.input_cols.len())),
                Array2::zeros((0, self.target_cols.len())),
            );
        }
        let idx: Vec<usize> = (0..size).map(|_| rng.gen_range(0..n)).collect();
        (
            self.select(&idx, &self.input_cols),
            self.select(&idx, &self.target_cols),
        )
    }

    fn all(&self) -> (Array2<f64>, Array2<f64>) {
        let idx: Vec<usize> = (0..self.len()).collect();
        (
            self.select(&idx, &self.input_cols),
            self.select(&idx, &self.target_cols),
        )
    }
}

/// Deterministic synthetic table: a two-factor Gaussian latent model with
/// additive noise, so the columns carry learnable correlation structure.
pub fn synthetic(rows: usize, cols: usize, rng: &mut StdRng) -> ModelResult<TableDataset> {
    let factors = cols.clamp(1, 2);
    let loadings: Array2<f64> = Array2::random_using((factors, cols), StandardNormal, rng);
    let latent: Array2<f64> = Array2::random_using((rows, factors), StandardNormal, rng);
    let noise: Array2<f64> = Array2::random_using((rows, cols), StandardNormal, rng) * 0.25;
    let data = latent.dot(&loadings) + noise;
    let columns = (0..cols).map(|i| format!("x:{i}")).collect();
    TableDataset::new(columns, data)
}

/// Synthetic binary table: the sign pattern of [`synthetic`], as 0/1
/// values for Bernoulli visible layers.
pub fn synthetic_binary(rows: usize, cols: usize, rng: &mut StdRng) -> ModelResult<TableDataset> {
    let mut table = synthetic(rows, cols, rng)?;
    table.rows.mapv_inplace(|v| if v > 0.0 { 1.0 } else { 0.0 });
    Ok(table)
}
