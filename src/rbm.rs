//! Restricted Boltzmann Machine subsystems trained by contrastive
//! divergence.
//!
//! An [`Rbm`] is a two-layer system (visible, hidden) with the mapping
//! `(v, h, v)`. The [`SubsystemKind`] is chosen by a closed match on the
//! (visible, hidden) unit class pair: Bernoulli-Bernoulli gives a plain
//! RBM, Gauss-Bernoulli the Gaussian variant with its modified energy
//! gradients; any other pairing is a fatal configuration error.
//!
//! The k-step CD chain samples in the middle and takes expectations at the
//! ends: the final hidden activation of every step is the expectation, not
//! a fresh sample, which reduces gradient noise. All parameter deltas of
//! one update are computed before any store is mutated.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;

use crate::data::Dataset;
use crate::system::{System, Topology};
use crate::tracker::Tracker;
use crate::units::{column_means, UnitClass, UnitDelta};
use crate::{InitConfig, ModelError, ModelResult, Schedule};

/// Kind of two-layer energy-based subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsystemKind {
    /// Bernoulli visible, Bernoulli hidden
    Rbm,
    /// Gaussian visible, Bernoulli hidden
    Grbm,
}

impl SubsystemKind {
    /// Closed dispatch on the (visible, hidden) class pair.
    pub fn for_classes(visible: UnitClass, hidden: UnitClass) -> ModelResult<Self> {
        match (visible, hidden) {
            (UnitClass::Bernoulli, UnitClass::Bernoulli) => Ok(SubsystemKind::Rbm),
            (UnitClass::Gauss, UnitClass::Bernoulli) => Ok(SubsystemKind::Grbm),
            (v, h) => Err(ModelError::UnsupportedPair(v, h)),
        }
    }
}

/// One contrastive-divergence sampling result.
///
/// `v_data` is the input batch, `h_data` the hidden expectation for it;
/// `v_model`/`h_model` are the model-phase estimates after k sampling
/// steps, averaged over m iterations.
#[derive(Debug, Clone)]
pub struct CdSample {
    pub v_data: Array2<f64>,
    pub h_data: Array2<f64>,
    pub v_model: Array2<f64>,
    pub h_model: Array2<f64>,
}

/// Two-layer energy-based subsystem.
#[derive(Debug, Clone)]
pub struct Rbm {
    pub kind: SubsystemKind,
    pub system: System,
}

impl Rbm {
    /// Build from a two-layer topology; the subsystem kind follows from the
    /// unit classes.
    pub fn new(topology: &Topology) -> ModelResult<Self> {
        if topology.layers.len() != 2 {
            return Err(ModelError::InvalidConfig(format!(
                "an RBM has exactly 2 layers, got {}",
                topology.layers.len()
            )));
        }
        let kind = SubsystemKind::for_classes(topology.layers[0].class, topology.layers[1].class)?;
        let mut system = System::from_topology(topology)?;
        system.set_mapping(vec![0, 1, 0])?;
        Ok(Self { kind, system })
    }

    /// Initialize unit and link parameters, visible layer from data
    /// statistics.
    pub fn initialize(
        &mut self,
        dataset: Option<&dyn Dataset>,
        init: &InitConfig,
        rng: &mut StdRng,
    ) -> ModelResult<()> {
        self.system.initialize(dataset, init, rng)
    }

    pub fn visible(&self) -> &crate::units::Layer {
        self.system.layer_at(0)
    }

    pub fn hidden(&self) -> &crate::units::Layer {
        self.system.layer_at(1)
    }

    /// k-step contrastive-divergence sampling, averaged over m iterations.
    ///
    /// Chain per step: hidden sample, visible expectation, visible sample,
    /// hidden expectation; the final hidden step uses the expectation
    /// instead of a sample. The fast path for `k = m = 1` skips the
    /// averaging buffers.
    pub fn cd_sampling(
        &self,
        data: &Array2<f64>,
        k: usize,
        m: usize,
        rng: &mut StdRng,
    ) -> ModelResult<CdSample> {
        let sys = &self.system;
        let h_data = sys.expect_step(data, 0, 1)?;

        if k <= 1 && m <= 1 {
            let v_model = sys.samples(&h_data, &[1, 0], true, rng)?;
            let h_model = sys.expect_step(&v_model, 0, 1)?;
            return Ok(CdSample {
                v_data: data.clone(),
                h_data,
                v_model,
                h_model,
            });
        }

        let mut v_model = Array2::zeros(data.dim());
        let mut h_model = Array2::zeros(h_data.dim());
        for _ in 0..m {
            let mut h_expect = h_data.clone();
            let mut v_expect = Array2::zeros(data.dim());
            for j in 0..k {
                let h_sample = sys.layer_at(1).sample(&h_expect, rng);
                v_expect = sys.expect_step(&h_sample, 1, 0)?;
                h_expect = if j + 1 == k {
                    // last step: expectation instead of a sample
                    sys.expect_step(&v_expect, 0, 1)?
                } else {
                    sys.samples(&v_expect, &[0, 1], true, rng)?
                };
            }
            v_model += &(&v_expect / m as f64);
            h_model += &(&h_expect / m as f64);
        }

        Ok(CdSample {
            v_data: data.clone(),
            h_data,
            v_model,
            h_model,
        })
    }

    /// Weight gradient: `rate * weight_factor * (v_data^T h_data -
    /// v_model^T h_model) / batch`, divided by the visible variance per
    /// unit for the Gaussian variant.
    fn delta_links(&self, s: &CdSample, schedule: &Schedule) -> Array2<f64> {
        let batch = s.v_data.nrows().max(1) as f64;
        let data_term = s.v_data.t().dot(&s.h_data);
        let model_term = s.v_model.t().dot(&s.h_model);
        let rate = schedule.rate * schedule.weight_factor;
        let delta = (data_term - model_term) * (rate / batch);
        match self.kind {
            SubsystemKind::Rbm => delta,
            SubsystemKind::Grbm => {
                let var = self.visible().lvar.mapv(f64::exp);
                delta / &var.insert_axis(Axis(1))
            }
        }
    }

    /// Visible unit gradients. The Gaussian variant scales the bias
    /// residual by the variance and matches second moments for the
    /// log-variance update.
    fn delta_visible(&self, s: &CdSample, schedule: &Schedule) -> ModelResult<UnitDelta> {
        let diff = mean_rows(&(&s.v_data - &s.v_model));
        let r1 = schedule.rate * schedule.vbias_factor;
        match self.kind {
            SubsystemKind::Rbm => Ok(UnitDelta {
                bias: diff * r1,
                lvar: None,
            }),
            SubsystemKind::Grbm => {
                let visible = self.visible();
                let var = visible.lvar.mapv(f64::exp);
                let r2 = schedule.rate * schedule.vlvar_factor;
                let w = &self.system.link(0, 1)?.w;

                let data_moment = second_moment(&s.v_data, &s.h_data, &visible.bias, w);
                let model_moment = second_moment(&s.v_model, &s.h_model, &visible.bias, w);

                Ok(UnitDelta {
                    bias: diff * r1 / &var,
                    lvar: Some((data_moment - model_moment) * r2 / &var),
                })
            }
        }
    }

    /// Hidden bias gradient: `rate * hbias_factor * mean(h_data - h_model)`.
    fn delta_hidden(&self, s: &CdSample, schedule: &Schedule) -> UnitDelta {
        let rate = schedule.rate * schedule.hbias_factor;
        UnitDelta {
            bias: mean_rows(&(&s.h_data - &s.h_model)) * rate,
            lvar: None,
        }
    }

    /// One CD update on a minibatch: sample, compute every delta, then
    /// apply. Reads complete before the first write, so an update step is
    /// atomic with respect to the stores.
    pub fn cd_update(
        &mut self,
        data: &Array2<f64>,
        schedule: &Schedule,
        rng: &mut StdRng,
    ) -> ModelResult<()> {
        let sampling = self.cd_sampling(data, schedule.cd_steps, schedule.cd_iterations, rng)?;
        let delta_v = self.delta_visible(&sampling, schedule)?;
        let delta_h = self.delta_hidden(&sampling, schedule);
        let delta_w = self.delta_links(&sampling, schedule);

        self.system.layer_at_mut(0).update(&delta_v);
        self.system.layer_at_mut(1).update(&delta_h);
        self.system.link_mut(0, 1)?.update(&delta_w);
        Ok(())
    }

    /// Optimize parameters by contrastive divergence. The tracker drives
    /// continuation, objective sampling and the keep-optimum restore; the
    /// minibatch is refreshed at the schedule's interval.
    pub fn optimize(
        &mut self,
        dataset: &dyn Dataset,
        schedule: &Schedule,
        tracker: &mut Tracker,
        rng: &mut StdRng,
    ) -> ModelResult<()> {
        self.system.set_use_adjacency(schedule.use_adjacency);
        let test = dataset.all();
        let mut batch = dataset.batch(schedule.minibatch_size, rng).0;

        while tracker.update(&mut self.system, &test)? {
            if tracker.epoch() % schedule.minibatch_update_interval.max(1) == 0 {
                batch = dataset.batch(schedule.minibatch_size, rng).0;
            }
            self.cd_update(&batch, schedule, rng)?;
        }
        Ok(())
    }
}

/// Column means over the batch axis.
fn mean_rows(data: &Array2<f64>) -> Array1<f64> {
    column_means(&data.view())
}

/// Second-moment residual of the Gaussian energy:
/// `mean(0.5 (v - b)^2 - v * (h . W^T))` per visible unit.
fn second_moment(
    v: &Array2<f64>,
    h: &Array2<f64>,
    bias: &Array1<f64>,
    w: &Array2<f64>,
) -> Array1<f64> {
    let dev = v - bias;
    let coupled = v * &h.dot(&w.t());
    mean_rows(&(&dev * &dev * 0.5 - coupled))
}
