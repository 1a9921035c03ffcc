//! Backpropagation engine for layered feed-forward systems.
//!
//! The forward pass reuses the unit-store expectation operation and retains
//! every intermediate activation; the backward pass computes deltas by the
//! chain rule over the system's static layer mapping. Two update policies
//! are provided: plain gradient descent (`bprop`) and resilient
//! backpropagation (`rprop`), whose per-parameter step sizes adapt on the
//! sign of consecutive gradients alone.
//!
//! Termination is driven entirely by the tracker's epoch counter; there is
//! no gradient-norm or loss-plateau stopping criterion.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;

use crate::data::Dataset;
use crate::system::System;
use crate::tracker::Tracker;
use crate::units::UnitDelta;
use crate::{Algorithm, ModelResult, Schedule};

/// RPROP acceleration on an unchanged gradient sign.
const RPROP_ACCEL_UP: f64 = 1.2;
/// RPROP deceleration on a gradient sign flip.
const RPROP_ACCEL_DOWN: f64 = 0.5;
/// Initial per-parameter step size.
const RPROP_INIT_STEP: f64 = 1e-3;
/// Step size bounds; steps never leave this interval.
const RPROP_MIN_STEP: f64 = 1e-6;
const RPROP_MAX_STEP: f64 = 50.0;

/// Previous gradients and step sizes of the RPROP rule, one entry per
/// mapping pair. Lives in the tracker's per-run scratch storage, never in
/// the unit/link stores.
#[derive(Debug, Clone)]
pub struct RpropMemory {
    pub grad_w: Vec<Array2<f64>>,
    pub step_w: Vec<Array2<f64>>,
    pub grad_b: Vec<Array1<f64>>,
    pub step_b: Vec<Array1<f64>>,
}

/// Parameter update directions for every mapping pair: one weight delta per
/// link, one unit delta per target layer.
#[derive(Debug)]
struct Updates {
    links: Vec<Array2<f64>>,
    units: Vec<UnitDelta>,
}

/// Forward pass: expectation propagation along the system mapping, all
/// intermediate activations retained for the backward pass.
pub fn forward(system: &System, input: &Array2<f64>) -> ModelResult<Vec<Array2<f64>>> {
    system.expect_all(input, system.mapping())
}

/// Backward pass: output-layer delta is `output - target`; every earlier
/// delta is the successor delta pulled back through the transposed weights,
/// gated by the activation gradient at the layer's pre-activation.
pub fn backward(
    system: &System,
    values: &[Array2<f64>],
    target: &Array2<f64>,
) -> ModelResult<Vec<Array2<f64>>> {
    let mapping = system.mapping();
    let n_pairs = mapping.len().saturating_sub(1);
    let mut deltas: Vec<Array2<f64>> = vec![Array2::zeros((0, 0)); n_pairs];
    for i in (0..n_pairs).rev() {
        if i == n_pairs - 1 {
            deltas[i] = &values[i + 1] - target;
        } else {
            let w_in = system.weights_between(mapping[i], mapping[i + 1])?;
            let pre = values[i].dot(&w_in);
            let grad = system.layer_at(mapping[i + 1]).grad_given(&pre);
            let w_out = system.weights_between(mapping[i + 1], mapping[i + 2])?;
            let pulled = deltas[i + 1].dot(&w_out.t());
            deltas[i] = pulled * grad;
        }
    }
    Ok(deltas)
}

/// Negative-gradient update directions from activations and deltas:
/// `gw = -out^T . delta / n`, `gb = -mean(delta)` per mapping pair.
fn gradients(
    values: &[Array2<f64>],
    deltas: &[Array2<f64>],
) -> (Vec<Array2<f64>>, Vec<Array1<f64>>) {
    let mut grad_w = Vec::with_capacity(deltas.len());
    let mut grad_b = Vec::with_capacity(deltas.len());
    for (out, delta) in values.iter().zip(deltas.iter()) {
        let n = out.nrows().max(1) as f64;
        grad_w.push(-out.t().dot(delta) / n);
        grad_b.push(-delta.sum_axis(Axis(0)) / n);
    }
    (grad_w, grad_b)
}

/// Plain gradient updates with a fixed learning rate.
fn bprop_updates(
    grad_w: Vec<Array2<f64>>,
    grad_b: Vec<Array1<f64>>,
    schedule: &Schedule,
) -> Updates {
    let rate = schedule.rate;
    Updates {
        links: grad_w.into_iter().map(|g| g * rate).collect(),
        units: grad_b
            .into_iter()
            .map(|g| UnitDelta {
                bias: g * rate,
                lvar: None,
            })
            .collect(),
    }
}

#[inline]
fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// One elementwise RPROP step. Unchanged sign accelerates the step, a flip
/// decelerates it and zeroes the gradient for this step; steps stay inside
/// `[RPROP_MIN_STEP, RPROP_MAX_STEP]`.
#[inline]
fn rprop_element(prev_grad: f64, prev_step: f64, grad: f64) -> (f64, f64, f64) {
    let mut s = sign(grad);
    let agreement = sign(prev_grad) * s;
    let step = if agreement > 0.0 {
        (prev_step * RPROP_ACCEL_UP).min(RPROP_MAX_STEP)
    } else if agreement < 0.0 {
        s = 0.0;
        (prev_step * RPROP_ACCEL_DOWN).max(RPROP_MIN_STEP)
    } else {
        prev_step.clamp(RPROP_MIN_STEP, RPROP_MAX_STEP)
    };
    // store a zeroed gradient after a flip so the next step sees no sign
    (if s == 0.0 { 0.0 } else { grad }, step, step * s)
}

/// Sign-only adaptive updates. The previous gradient and step size persist
/// in the tracker scratch across epochs of one `optimize()` call.
fn rprop_updates(
    grad_w: Vec<Array2<f64>>,
    grad_b: Vec<Array1<f64>>,
    memory: &mut Option<RpropMemory>,
) -> Updates {
    let mem = memory.get_or_insert_with(|| RpropMemory {
        grad_w: grad_w.clone(),
        step_w: grad_w
            .iter()
            .map(|g| Array2::from_elem(g.dim(), RPROP_INIT_STEP))
            .collect(),
        grad_b: grad_b.clone(),
        step_b: grad_b
            .iter()
            .map(|g| Array1::from_elem(g.len(), RPROP_INIT_STEP))
            .collect(),
    });

    let mut links = Vec::with_capacity(grad_w.len());
    for (i, grad) in grad_w.iter().enumerate() {
        let mut update = Array2::zeros(grad.dim());
        ndarray::Zip::from(&mut update)
            .and(&mut mem.grad_w[i])
            .and(&mut mem.step_w[i])
            .and(grad)
            .for_each(|u, pg, ps, &g| {
                let (ng, ns, upd) = rprop_element(*pg, *ps, g);
                *pg = ng;
                *ps = ns;
                *u = upd;
            });
        links.push(update);
    }

    let mut units = Vec::with_capacity(grad_b.len());
    for (i, grad) in grad_b.iter().enumerate() {
        let mut update = Array1::zeros(grad.len());
        ndarray::Zip::from(&mut update)
            .and(&mut mem.grad_b[i])
            .and(&mut mem.step_b[i])
            .and(grad)
            .for_each(|u, pg, ps, &g| {
                let (ng, ns, upd) = rprop_element(*pg, *ps, g);
                *pg = ng;
                *ps = ns;
                *u = upd;
            });
        units.push(UnitDelta {
            bias: update,
            lvar: None,
        });
    }

    Updates { links, units }
}

/// Apply computed updates to the stores. All updates were computed before
/// any parameter is touched, so a single step is atomic with respect to
/// the stores.
fn apply_updates(system: &mut System, mapping: &[usize], updates: Updates) -> ModelResult<()> {
    for (i, pair) in mapping.windows(2).enumerate() {
        let (s, t) = (pair[0], pair[1]);
        if system.link(s, t).is_ok() {
            system.link_mut(s, t)?.update(&updates.links[i]);
        } else {
            let transposed = updates.links[i].t().to_owned();
            system.link_mut(t, s)?.update(&transposed);
        }
        system.layer_at_mut(t).update(&updates.units[i]);
    }
    Ok(())
}

/// Optimize system parameters by backpropagation of error.
///
/// Each epoch: sample a minibatch at the refresh interval, forward pass,
/// backward pass, compute updates per the schedule's update policy, apply.
/// The tracker decides continuation, objective sampling and the
/// keep-optimum restore at termination.
pub fn optimize(
    system: &mut System,
    dataset: &dyn Dataset,
    schedule: &Schedule,
    tracker: &mut Tracker,
    rng: &mut StdRng,
) -> ModelResult<()> {
    system.set_use_adjacency(schedule.use_adjacency);
    let mapping = system.mapping().to_vec();
    let test = dataset.all();
    let mut batch = dataset.batch(schedule.minibatch_size, rng);

    while tracker.update(system, &test)? {
        if tracker.epoch() % schedule.minibatch_update_interval.max(1) == 0 {
            batch = dataset.batch(schedule.minibatch_size, rng);
        }
        let values = system.expect_all(&batch.0, &mapping)?;
        let deltas = backward(system, &values, &batch.1)?;
        let (grad_w, grad_b) = gradients(&values, &deltas);
        let updates = match schedule.algorithm {
            Algorithm::Bprop => bprop_updates(grad_w, grad_b, schedule),
            Algorithm::Rprop => rprop_updates(grad_w, grad_b, &mut tracker.scratch.rprop),
        };
        apply_updates(system, &mapping, updates)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{LayerSpec, Topology};
    use crate::units::UnitClass;
    use crate::InitConfig;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;

    fn chain_system(dims: &[usize]) -> System {
        let specs = dims
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                let visible = i == 0 || i == dims.len() - 1;
                LayerSpec::sized(&format!("l{i}"), n, visible, UnitClass::Bernoulli)
            })
            .collect();
        let mut system = System::from_topology(&Topology::new(specs)).expect("topology");
        let mut rng = StdRng::seed_from_u64(9);
        system
            .initialize(None, &InitConfig::default(), &mut rng)
            .expect("init");
        system
    }

    #[test]
    fn test_forward_retains_all_activations() {
        let system = chain_system(&[3, 4, 2]);
        let input = Array2::from_elem((5, 3), 0.5);
        let values = forward(&system, &input).expect("forward");
        assert_eq!(values.len(), 3);
        assert_eq!(values[0].dim(), (5, 3));
        assert_eq!(values[1].dim(), (5, 4));
        assert_eq!(values[2].dim(), (5, 2));
    }

    #[test]
    fn test_backward_output_delta() {
        let system = chain_system(&[2, 3, 2]);
        let input = Array2::from_elem((4, 2), 1.0);
        let values = forward(&system, &input).expect("forward");
        let target = Array2::zeros((4, 2));
        let deltas = backward(&system, &values, &target).expect("backward");
        assert_eq!(deltas.len(), 2);
        // output delta is exactly output - target
        assert_eq!(deltas[1], values[2].clone());
        assert_eq!(deltas[0].dim(), (4, 3));
    }

    #[test]
    fn test_bprop_reduces_error_on_fixed_batch() {
        let mut system = chain_system(&[2, 4, 1]);
        let input = array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
        let target = array![[0.0], [1.0], [1.0], [0.0]];
        let before = system
            .evaluate(crate::Objective::Error, &input, &target)
            .expect("eval");
        let schedule = Schedule {
            rate: 0.3,
            ..Schedule::ann()
        };
        let mapping = system.mapping().to_vec();
        for _ in 0..500 {
            let values = system.expect_all(&input, &mapping).expect("forward");
            let deltas = backward(&system, &values, &target).expect("backward");
            let (gw, gb) = gradients(&values, &deltas);
            let updates = bprop_updates(gw, gb, &schedule);
            apply_updates(&mut system, &mapping, updates).expect("apply");
        }
        let after = system
            .evaluate(crate::Objective::Error, &input, &target)
            .expect("eval");
        assert!(after < before, "error should drop: {before} -> {after}");
    }

    #[test]
    fn test_rprop_element_bounds_and_flip() {
        // unchanged sign accelerates
        let (_, step, upd) = rprop_element(1.0, 0.001, 2.0);
        assert_abs_diff_eq!(step, 0.0012, epsilon = 1e-12);
        assert_abs_diff_eq!(upd, 0.0012, epsilon = 1e-12);
        // flip halves the step and zeroes the contribution
        let (g, step, upd) = rprop_element(1.0, 0.001, -2.0);
        assert_eq!(g, 0.0);
        assert_abs_diff_eq!(step, 0.0005, epsilon = 1e-12);
        assert_eq!(upd, 0.0);
        // steps never leave the bounds
        let (_, step, _) = rprop_element(1.0, RPROP_MAX_STEP, 1.0);
        assert_eq!(step, RPROP_MAX_STEP);
        let (_, step, _) = rprop_element(1.0, RPROP_MIN_STEP, -1.0);
        assert_eq!(step, RPROP_MIN_STEP);
    }

    #[test]
    fn test_rprop_memory_initialized_on_first_use() {
        let grad_w = vec![Array2::from_elem((2, 2), 0.5)];
        let grad_b = vec![Array1::from_elem(2, -0.5)];
        let mut memory = None;
        let updates = rprop_updates(grad_w, grad_b, &mut memory);
        let mem = memory.expect("memory initialized");
        assert_eq!(mem.step_w.len(), 1);
        // first step agrees with itself: accelerated init step
        let expected = RPROP_INIT_STEP * RPROP_ACCEL_UP;
        assert_abs_diff_eq!(updates.links[0][[0, 0]], expected, epsilon = 1e-12);
        assert_abs_diff_eq!(updates.units[0].bias[0], -expected, epsilon = 1e-12);
    }
}
