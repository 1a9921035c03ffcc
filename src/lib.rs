//! # DBN (Deep Belief Networks)
//!
//! A training core for layered energy-based models: Restricted Boltzmann
//! Machines, Gaussian RBMs and Deep Belief Networks, plus a generic
//! backpropagation engine with plain-gradient and RPROP update policies.
//!
//! ## Overview
//!
//! A [`system::System`] couples per-layer unit parameters (bias, log-variance)
//! with per-pair link parameters (weights, adjacency) into one mutable
//! parameter store. Optimizers drive the store in place:
//!
//! - [`rbm`] — k-step contrastive divergence for two-layer subsystems
//! - [`ann`] — forward/backward passes with `bprop` and `rprop` updates
//! - [`dbn`] — layer-wise pretraining, transpose splicing, finetuning
//! - [`tracker`] — epoch budget, objective sampling, keep-optimum snapshots
//!
//! ## Structure
//!
//! - [`units`] — unit layer parameter store and activation primitives
//! - [`links`] — link block parameter store (weights + adjacency)
//! - [`system`] — composed layer/link stack with propagation operations
//! - [`data`] — in-memory dataset collaborator (batching, stage transforms)
//! - [`checkpoint`] — JSON parameter persistence

pub mod ann;
pub mod checkpoint;
pub mod data;
pub mod dbn;
pub mod links;
pub mod rbm;
pub mod system;
pub mod tracker;
pub mod units;

pub use ann::RpropMemory;
pub use data::{Dataset, TableDataset};
pub use dbn::{Dbn, DbnSchedule, StageReport};
pub use links::LinkBlock;
pub use rbm::{CdSample, Rbm, SubsystemKind};
pub use system::{LayerSpec, ParamSnapshot, System, Topology};
pub use tracker::{AbortFlag, Objective, Optimum, Tracker};
pub use units::{Layer, UnitClass, UnitDelta};

use std::error::Error;
use std::fmt;

/// Error type for model configuration and parameter-store operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Referenced layer name is not present in the store
    UnknownLayer(String),
    /// Label/parameter-array lengths or link shapes disagree
    ShapeMismatch(String),
    /// Invalid topology or schedule
    InvalidConfig(String),
    /// No subsystem kind exists for this (visible, hidden) class pair
    UnsupportedPair(UnitClass, UnitClass),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownLayer(name) => write!(f, "unknown layer: {name}"),
            ModelError::ShapeMismatch(msg) => write!(f, "shape mismatch: {msg}"),
            ModelError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            ModelError::UnsupportedPair(v, h) => {
                write!(f, "unsupported unit class pair: {v:?} <-> {h:?}")
            }
        }
    }
}

impl Error for ModelError {}

pub type ModelResult<T> = Result<T, ModelError>;

/// Parameter-store initialization settings.
///
/// `w_sigma` scales the data-dependent standard deviation of the initial
/// weight draw; `unit_sigma` is the initial standard deviation of Gaussian
/// units (stored as log-variance).
#[derive(Debug, Clone)]
pub struct InitConfig {
    pub w_sigma: f64,
    pub unit_sigma: f64,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            w_sigma: 0.5,
            unit_sigma: 0.4,
        }
    }
}

/// Update policy for the backpropagation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Plain gradient descent with a fixed learning rate
    Bprop,
    /// Resilient backpropagation: sign-only adaptive per-parameter steps
    Rprop,
}

/// Flat optimization schedule for a single `optimize()` invocation.
///
/// Immutable for the duration of one call; replaced wholesale between calls.
/// The presets carry the defaults each system class ships with:
/// [`Schedule::rbm`], [`Schedule::grbm`], [`Schedule::ann`].
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Total number of parameter updates (epochs)
    pub updates: usize,
    /// Rows per minibatch
    pub minibatch_size: usize,
    /// Epochs between minibatch refreshes
    pub minibatch_update_interval: usize,
    /// Base learning rate
    pub rate: f64,
    /// Rate factor applied to link weight updates
    pub weight_factor: f64,
    /// Rate factor applied to visible bias updates
    pub vbias_factor: f64,
    /// Rate factor applied to hidden bias updates
    pub hbias_factor: f64,
    /// Rate factor applied to visible log-variance updates (Gaussian units)
    pub vlvar_factor: f64,
    /// Gibbs sampling steps per CD update (k)
    pub cd_steps: usize,
    /// Sampling iterations averaged per CD update (m)
    pub cd_iterations: usize,
    /// Update policy for backpropagation
    pub algorithm: Algorithm,
    /// Mask pruned links out of every weight lookup
    pub use_adjacency: bool,
    /// Objective tracked by the optimization tracker
    pub objective: Objective,
    /// Epochs between objective evaluations
    pub obj_update_interval: usize,
    /// Fraction of the run to wait before "keep optimum" comparisons start
    pub obj_init_wait: f64,
    /// Snapshot the best-so-far parameters and restore them at termination
    pub keep_optimum: bool,
    /// Print a one-shot wall-clock estimate for the full run
    pub estimate_time: bool,
    /// Seconds of runtime to observe before estimating
    pub estimate_time_wait: f64,
    /// Seconds between progress log lines
    pub eval_time_interval: f64,
}

impl Schedule {
    /// Defaults for Bernoulli-Bernoulli RBM contrastive divergence.
    pub fn rbm() -> Self {
        Self {
            updates: 100_000,
            minibatch_size: 100,
            minibatch_update_interval: 10,
            rate: 0.1,
            weight_factor: 1.0,
            vbias_factor: 0.1,
            hbias_factor: 0.1,
            vlvar_factor: 0.0,
            cd_steps: 1,
            cd_iterations: 1,
            algorithm: Algorithm::Bprop,
            use_adjacency: false,
            objective: Objective::Error,
            obj_update_interval: 100,
            obj_init_wait: 0.01,
            keep_optimum: true,
            estimate_time: true,
            estimate_time_wait: 20.0,
            eval_time_interval: 10.0,
        }
    }

    /// Defaults for Gaussian-Bernoulli RBM contrastive divergence.
    ///
    /// The much smaller rate keeps the log-variance updates stable.
    pub fn grbm() -> Self {
        Self {
            updates: 100_000,
            minibatch_size: 100,
            minibatch_update_interval: 1,
            rate: 0.0005,
            vlvar_factor: 0.01,
            objective: Objective::Accuracy,
            estimate_time: false,
            estimate_time_wait: 15.0,
            ..Self::rbm()
        }
    }

    /// Defaults for backpropagation finetuning.
    pub fn ann() -> Self {
        Self {
            updates: 10_000,
            minibatch_update_interval: 10,
            rate: 0.1,
            objective: Objective::Error,
            estimate_time_wait: 15.0,
            ..Self::rbm()
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::ann()
    }
}
