//! Link block parameter store: weights and adjacency between two layers.
//!
//! A [`LinkBlock`] holds the weight matrix `W` and the boolean adjacency
//! mask `A` for one pair of layers, both of shape `(n_src, n_tgt)`.
//! Entries of `A` that are `false` mark pruned connections; their `W`
//! entries read as zero wherever adjacency masking is enabled. Only one
//! orientation is stored per pair; the reverse direction is served as the
//! transpose (see [`LinkBlock::weights_rev`]).

use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;

use crate::units::SDEV_EPS;
use crate::InitConfig;

/// Weights and adjacency between a source and a target layer.
#[derive(Debug, Clone)]
pub struct LinkBlock {
    /// Index of the source layer in the owning system
    pub source: usize,
    /// Index of the target layer in the owning system
    pub target: usize,
    /// Adjacency mask, `false` marks a pruned connection
    pub a: Array2<bool>,
    /// Weight matrix, shape `(n_src, n_tgt)`
    pub w: Array2<f64>,
}

impl LinkBlock {
    /// Create a fully connected block with zero weights.
    pub fn new(source: usize, target: usize, n_src: usize, n_tgt: usize) -> Self {
        Self {
            source,
            target,
            a: Array2::from_elem((n_src, n_tgt), true),
            w: Array2::zeros((n_src, n_tgt)),
        }
    }

    /// Initialize weights as `A * Normal(0, sigma_i)` with a per-source-row
    /// deviation scaled by the source data column deviation:
    /// `sigma_i = (w_sigma / n_src) * std_i + eps`. Without data the base
    /// deviation `w_sigma / n_src` is used for every row. The data-dependent
    /// scaling keeps sigmoid units out of saturation at the start of
    /// training.
    pub fn initialize(
        &mut self,
        source_data: Option<&ArrayView2<'_, f64>>,
        init: &InitConfig,
        rng: &mut StdRng,
    ) {
        let (x, y) = self.w.dim();
        let base = init.w_sigma / x.max(1) as f64;
        let sigma: Array1<f64> = match source_data {
            Some(d) => d.std_axis(Axis(0), 0.0).mapv(|s| base * s + SDEV_EPS),
            None => Array1::from_elem(x, base),
        };
        let noise: Array2<f64> = Array2::random_using((x, y), StandardNormal, rng);
        self.w = noise * &sigma.insert_axis(Axis(1));
        self.mask();
    }

    /// Weight matrix in stored orientation, masked when requested.
    pub fn weights(&self, use_adjacency: bool) -> Array2<f64> {
        if use_adjacency {
            ndarray::Zip::from(&self.w)
                .and(&self.a)
                .map_collect(|&w, &a| if a { w } else { 0.0 })
        } else {
            self.w.clone()
        }
    }

    /// Weight matrix in reverse orientation (target -> source).
    pub fn weights_rev(&self, use_adjacency: bool) -> Array2<f64> {
        self.weights(use_adjacency).reversed_axes()
    }

    /// Apply a weight update in place.
    pub fn update(&mut self, delta: &Array2<f64>) {
        self.w += delta;
    }

    /// Prune connections whose absolute weight falls below the cutoff.
    ///
    /// Shrinks `A` permanently; irreversible within a run. Returns the
    /// number of connections pruned by this call.
    pub fn prune(&mut self, threshold: f64) -> usize {
        let mut pruned = 0;
        ndarray::Zip::from(&mut self.a)
            .and(&self.w)
            .for_each(|a, &w| {
                if *a && w.abs() < threshold {
                    *a = false;
                    pruned += 1;
                }
            });
        pruned
    }

    /// Zero out masked weight entries.
    fn mask(&mut self) {
        ndarray::Zip::from(&mut self.w).and(&self.a).for_each(|w, &a| {
            if !a {
                *w = 0.0;
            }
        });
    }

    /// Compact source-side rows to the surviving indices.
    pub fn retain_source(&mut self, keep: &[usize]) {
        self.w = self.w.select(Axis(0), keep);
        self.a = self.a.select(Axis(0), keep);
    }

    /// Compact target-side columns to the surviving indices.
    pub fn retain_target(&mut self, keep: &[usize]) {
        self.w = self.w.select(Axis(1), keep);
        self.a = self.a.select(Axis(1), keep);
    }

    /// Per-sample link energy `-sum_ij v_i W_ij h_j` for paired source and
    /// target data. Diagnostic term of the pseudo-energy objective.
    pub(crate) fn energy(
        &self,
        source_data: &Array2<f64>,
        target_data: &Array2<f64>,
        use_adjacency: bool,
    ) -> Array1<f64> {
        let w = self.weights(use_adjacency);
        -(source_data.dot(&w) * target_data).sum_axis(Axis(1))
    }
}
