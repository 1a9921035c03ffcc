//! Optimization tracker: epoch budget, objective sampling, keep-optimum
//! snapshots, time estimation and cooperative abort.
//!
//! One [`Tracker`] lives for exactly one `optimize()` invocation. Each
//! epoch the optimizer calls [`Tracker::update`], which advances the epoch
//! counter, checks the stop conditions (update budget reached, abort flag
//! tripped), samples the configured objective at its interval, maintains
//! the best-parameters-so-far snapshot, and restores that snapshot into
//! the live store at termination — so training always ends at its
//! best-observed point, not necessarily its final point.
//!
//! Cancellation is cooperative and coarse-grained: the abort flag is
//! polled once per epoch, at the epoch boundary only; an epoch in flight
//! always completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ndarray::Array2;

use crate::ann::RpropMemory;
use crate::system::{ParamSnapshot, System};
use crate::{ModelResult, Schedule};

/// Objective function sampled by the tracker during optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    /// Mean squared reconstruction/prediction residual
    Error,
    /// One minus the normalized residual magnitude
    Accuracy,
    /// Pseudo-energy over summed unit and link energies
    Energy,
}

/// Direction in which an objective improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Optimum {
    Min,
    Max,
}

impl Objective {
    pub fn optimum(&self) -> Optimum {
        match self {
            Objective::Error | Objective::Energy => Optimum::Min,
            Objective::Accuracy => Optimum::Max,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Objective::Error => "error",
            Objective::Accuracy => "accuracy",
            Objective::Energy => "energy",
        }
    }
}

/// Shared cancellation flag, polled once per epoch.
///
/// The interactive abort path (a keypress watcher, a signal handler) runs
/// outside the training thread and calls [`AbortFlag::trigger`]; the
/// training loop itself stays single-threaded.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-run scratch storage for update rules that carry auxiliary state
/// across epochs. Dropped with the tracker, so nothing leaks between
/// separate `optimize()` calls.
#[derive(Debug, Default)]
pub struct Scratch {
    /// Previous gradients and step sizes of the RPROP update rule
    pub rprop: Option<RpropMemory>,
}

/// Tracking state for one optimization run.
#[derive(Debug)]
pub struct Tracker {
    epoch: usize,
    updates: usize,
    proceed: bool,
    objective: Objective,
    obj_update_interval: usize,
    obj_init_wait: f64,
    keep_optimum: bool,
    obj_values: Vec<(f64, f64)>,
    best_value: Option<f64>,
    best_params: Option<ParamSnapshot>,
    abort: AbortFlag,
    abort_notified: bool,
    estimate_enable: bool,
    estimate_wait: f64,
    eval_interval: f64,
    started: Instant,
    last_eval: Instant,
    /// Keyed scratch storage for update rules (RPROP memory)
    pub scratch: Scratch,
}

impl Tracker {
    pub fn new(schedule: &Schedule) -> Self {
        Self::with_abort(schedule, AbortFlag::new())
    }

    pub fn with_abort(schedule: &Schedule, abort: AbortFlag) -> Self {
        let now = Instant::now();
        Self {
            epoch: 0,
            updates: schedule.updates.max(1),
            proceed: true,
            objective: schedule.objective,
            obj_update_interval: schedule.obj_update_interval.max(1),
            obj_init_wait: schedule.obj_init_wait,
            keep_optimum: schedule.keep_optimum,
            obj_values: Vec::new(),
            best_value: None,
            best_params: None,
            abort,
            abort_notified: false,
            estimate_enable: schedule.estimate_time,
            estimate_wait: schedule.estimate_time_wait,
            eval_interval: schedule.eval_time_interval,
            started: now,
            last_eval: now,
            scratch: Scratch::default(),
        }
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Fraction of the update budget spent so far.
    pub fn progress(&self) -> f64 {
        self.epoch as f64 / self.updates as f64
    }

    /// Recorded `(progress, value)` objective samples.
    pub fn obj_values(&self) -> &[(f64, f64)] {
        &self.obj_values
    }

    pub fn best_value(&self) -> Option<f64> {
        self.best_value
    }

    /// Handle for triggering a cooperative abort from outside the loop.
    pub fn abort_handle(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Advance one epoch and decide whether optimization continues.
    ///
    /// `test` supplies the input/target data the objective is evaluated
    /// against. Returns `false` once the update budget is exhausted or an
    /// abort was requested; in both cases the best snapshot (if any) has
    /// been restored into `system` before returning.
    pub fn update(
        &mut self,
        system: &mut System,
        test: &(Array2<f64>, Array2<f64>),
    ) -> ModelResult<bool> {
        self.epoch += 1;
        if self.epoch >= self.updates {
            self.proceed = false;
        }
        if self.abort.is_set() {
            if !self.abort_notified {
                eprintln!("... aborting optimization");
                self.abort_notified = true;
            }
            self.proceed = false;
        }

        if self.estimate_enable {
            self.update_time_estimation();
        }
        self.update_objective(system, test)?;
        self.update_evaluation(system, test)?;

        Ok(self.proceed)
    }

    /// One-shot linear extrapolation of the full run's wall-clock time.
    fn update_time_estimation(&mut self) {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > self.estimate_wait {
            let estimate = elapsed / self.epoch as f64 * self.updates as f64;
            eprintln!(
                "estimation: {estimate:.0}s for {} updates",
                self.updates
            );
            self.estimate_enable = false;
        }
    }

    /// Sample the objective at its interval, track the optimum, and restore
    /// the best snapshot on the final epoch.
    fn update_objective(
        &mut self,
        system: &mut System,
        test: &(Array2<f64>, Array2<f64>),
    ) -> ModelResult<()> {
        if self.proceed && self.epoch % self.obj_update_interval != 0 {
            return Ok(());
        }

        let value = system.evaluate(self.objective, &test.0, &test.1)?;
        let progress = self.progress();
        self.obj_values.push((progress, value));

        if !self.keep_optimum {
            return Ok(());
        }

        match self.best_value {
            None => {
                self.best_value = Some(value);
                self.best_params = Some(system.snapshot());
            }
            Some(best) => {
                // warm-up: record but do not compare yet
                if self.proceed && progress < self.obj_init_wait {
                    return Ok(());
                }
                let improved = match self.objective.optimum() {
                    Optimum::Min => value < best,
                    Optimum::Max => value > best,
                };
                if improved {
                    self.best_value = Some(value);
                    self.best_params = Some(system.snapshot());
                }
            }
        }

        if !self.proceed {
            if let Some(best) = &self.best_params {
                system.restore(best);
            }
        }

        Ok(())
    }

    /// Time-interval progress logging.
    fn update_evaluation(
        &mut self,
        system: &System,
        test: &(Array2<f64>, Array2<f64>),
    ) -> ModelResult<()> {
        if !self.proceed {
            if let Some(best) = self.best_value {
                eprintln!(
                    "found optimum with: {} = {best:.4}",
                    self.objective.name()
                );
            }
            return Ok(());
        }
        if self.last_eval.elapsed().as_secs_f64() > self.eval_interval {
            let value = system.evaluate(self.objective, &test.0, &test.1)?;
            eprintln!(
                "finished {:.1}%: {} = {value:.4}",
                self.progress() * 100.0,
                self.objective.name()
            );
            self.last_eval = Instant::now();
        }
        Ok(())
    }
}
