//! Unit layer parameter store and activation primitives.
//!
//! A [`Layer`] holds the distribution parameters of one group of units:
//! a bias vector for Bernoulli units, bias plus log-variance for Gaussian
//! units. Expectation, sampling, median value, activation gradient and
//! energy are all expressed against these parameters; the optimizers
//! mutate them in place through [`Layer::update`].
//!
//! Invariant: `bias.len() == labels.len()` (and `lvar.len() == labels.len()`
//! for Gaussian layers) holds before and after every operation. Shrinking a
//! layer goes through [`Layer::retain`], which compacts labels and parameter
//! arrays together; the paired link blocks must be compacted in the same
//! call (see `System::remove_units`).

use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;

use crate::InitConfig;

/// Additive guard against near-zero deviations; numerical degeneracies are
/// clamped rather than raised.
pub(crate) const SDEV_EPS: f64 = 1e-4;

/// Standard logistic function.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Derivative of the standard logistic function.
#[inline]
pub fn sigmoid_grad(x: f64) -> f64 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

/// Distribution class of a unit layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitClass {
    /// Binary units with sigmoidal activation and Bernoulli sampling
    Bernoulli,
    /// Continuous units with identity activation and Gaussian sampling
    Gauss,
}

/// Parameter updates for one layer, applied in place by [`Layer::update`].
#[derive(Debug, Clone)]
pub struct UnitDelta {
    pub bias: Array1<f64>,
    /// Log-variance update; only Gaussian layers carry one
    pub lvar: Option<Array1<f64>>,
}

/// One group of units with its distribution parameters.
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub labels: Vec<String>,
    pub visible: bool,
    pub class: UnitClass,
    /// Bias (Bernoulli) or mean (Gauss), one entry per unit
    pub bias: Array1<f64>,
    /// Log-variance, one entry per unit; empty for Bernoulli layers
    pub lvar: Array1<f64>,
}

impl Layer {
    pub fn new(name: &str, labels: Vec<String>, visible: bool, class: UnitClass) -> Self {
        let n = labels.len();
        let lvar = match class {
            UnitClass::Bernoulli => Array1::zeros(0),
            UnitClass::Gauss => Array1::zeros(n),
        };
        Self {
            name: name.to_string(),
            labels,
            visible,
            class,
            bias: Array1::zeros(n),
            lvar,
        }
    }

    /// Number of units in the layer.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Initialize distribution parameters, optionally from data statistics.
    ///
    /// Bernoulli layers get a uniform bias of 0.5. Gaussian layers take the
    /// column mean as bias and `ln(unit_sigma^2 * std^2)` as log-variance;
    /// without data the statistics default to mean 0 and deviation 1.
    pub fn initialize(&mut self, data: Option<&ArrayView2<'_, f64>>, init: &InitConfig) {
        let n = self.len();
        match self.class {
            UnitClass::Bernoulli => {
                self.bias = Array1::from_elem(n, 0.5);
            }
            UnitClass::Gauss => {
                let (mean, sdev) = match data {
                    Some(d) => (
                        column_means(d),
                        d.std_axis(Axis(0), 0.0).mapv(|s| s + SDEV_EPS),
                    ),
                    None => (Array1::zeros(n), Array1::ones(n)),
                };
                self.bias = mean;
                self.lvar = sdev.mapv(|s| (init.unit_sigma * init.unit_sigma * s * s).ln());
            }
        }
    }

    /// Expectation given the pre-activation `input . W`.
    ///
    /// Bernoulli: `sigmoid(bias + pre)`. Gauss: `bias + pre` (identity link).
    pub fn expect_given(&self, pre: &Array2<f64>) -> Array2<f64> {
        let act = pre + &self.bias;
        match self.class {
            UnitClass::Bernoulli => act.mapv(sigmoid),
            UnitClass::Gauss => act,
        }
    }

    /// Activation gradient at the pre-activation `input . W`, for backprop.
    pub fn grad_given(&self, pre: &Array2<f64>) -> Array2<f64> {
        match self.class {
            UnitClass::Bernoulli => (pre + &self.bias).mapv(sigmoid_grad),
            UnitClass::Gauss => Array2::ones(pre.dim()),
        }
    }

    /// Draw a sample from the layer distribution at the given expectation.
    pub fn sample(&self, expect: &Array2<f64>, rng: &mut StdRng) -> Array2<f64> {
        match self.class {
            UnitClass::Bernoulli => {
                let u: Array2<f64> = Array2::random_using(expect.dim(), Uniform::new(0.0, 1.0), rng);
                ndarray::Zip::from(expect)
                    .and(&u)
                    .map_collect(|&p, &r| if r < p { 1.0 } else { 0.0 })
            }
            UnitClass::Gauss => {
                let noise: Array2<f64> = Array2::random_using(expect.dim(), StandardNormal, rng);
                expect + &(noise * &self.sdev())
            }
        }
    }

    /// Median value at the given expectation: hard threshold for Bernoulli
    /// units, identity for Gaussian units.
    pub fn value(&self, expect: &Array2<f64>) -> Array2<f64> {
        match self.class {
            UnitClass::Bernoulli => expect.mapv(|p| if p > 0.5 { 1.0 } else { 0.0 }),
            UnitClass::Gauss => expect.clone(),
        }
    }

    /// Per-unit energy, averaged over the sample axis.
    ///
    /// Bernoulli: `-mean(data * bias)`. Gauss:
    /// `-mean((data - bias)^2 / exp(lvar)) / 2`. Diagnostic only; not used
    /// for gradient computation.
    pub fn energy(&self, data: &Array2<f64>) -> Array1<f64> {
        let n = data.nrows().max(1) as f64;
        match self.class {
            UnitClass::Bernoulli => -(data * &self.bias).sum_axis(Axis(0)) / n,
            UnitClass::Gauss => {
                let var = self.lvar.mapv(f64::exp);
                let dev = data - &self.bias;
                -(&dev * &dev / &var).sum_axis(Axis(0)) / (2.0 * n)
            }
        }
    }

    /// Per-sample energy, summed over units. Feeds the pseudo-energy
    /// objective; sign convention follows the Boltzmann energy terms.
    pub(crate) fn sample_energy(&self, data: &Array2<f64>) -> Array1<f64> {
        match self.class {
            UnitClass::Bernoulli => -(data * &self.bias).sum_axis(Axis(1)),
            UnitClass::Gauss => {
                let var = self.lvar.mapv(f64::exp);
                let dev = data - &self.bias;
                (&dev * &dev / &var).sum_axis(Axis(1)) / 2.0
            }
        }
    }

    /// Standard deviation per unit: `sqrt(exp(lvar))` for Gaussian layers,
    /// ones for Bernoulli layers.
    pub fn sdev(&self) -> Array1<f64> {
        match self.class {
            UnitClass::Bernoulli => Array1::ones(self.len()),
            UnitClass::Gauss => self.lvar.mapv(|lv| (lv / 2.0).exp()),
        }
    }

    /// Compact labels and parameter arrays to the surviving indices.
    pub fn retain(&mut self, keep: &[usize]) {
        self.labels = keep.iter().map(|&i| self.labels[i].clone()).collect();
        self.bias = keep.iter().map(|&i| self.bias[i]).collect();
        if self.class == UnitClass::Gauss {
            self.lvar = keep.iter().map(|&i| self.lvar[i]).collect();
        }
    }

    /// Apply a parameter update in place.
    pub fn update(&mut self, delta: &UnitDelta) {
        self.bias += &delta.bias;
        if let Some(lvar) = &delta.lvar {
            self.lvar += lvar;
        }
    }
}

pub(crate) fn column_means(data: &ArrayView2<'_, f64>) -> Array1<f64> {
    let n = data.nrows().max(1) as f64;
    data.sum_axis(Axis(0)) / n
}
