//! Energy convention tests: unit energies, link energies and the
//! pseudo-energy objective.

use approx::assert_abs_diff_eq;
use dbn::system::{LayerSpec, Topology};
use dbn::units::{Layer, UnitClass};
use dbn::{InitConfig, Objective, System};
use ndarray::{array, Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn labels(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{prefix}{i}")).collect()
}

/// With all biases at 0 and all data at 0.5, the Bernoulli unit energy is
/// exactly zero.
#[test]
fn test_bernoulli_energy_sign_convention() {
    let mut layer = Layer::new("v", labels("v", 4), true, UnitClass::Bernoulli);
    layer.bias = Array1::zeros(4);
    let data = Array2::from_elem((20, 4), 0.5);
    assert_eq!(layer.energy(&data), Array1::<f64>::zeros(4));
}

/// Nonzero biases pull the Bernoulli energy negative for aligned data.
#[test]
fn test_bernoulli_energy_aligned_data() {
    let mut layer = Layer::new("v", labels("v", 2), true, UnitClass::Bernoulli);
    layer.bias = array![1.0, 1.0];
    let data = Array2::from_elem((10, 2), 1.0);
    let energy = layer.energy(&data);
    assert_abs_diff_eq!(energy[0], -1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(energy[1], -1.0, epsilon = 1e-12);
}

/// Gaussian energy is `-mean((data - bias)^2 / var) / 2`: zero at the mean,
/// negative away from it.
#[test]
fn test_gauss_energy() {
    let mut layer = Layer::new("v", labels("v", 2), true, UnitClass::Gauss);
    layer.bias = array![0.0, 0.0];
    layer.lvar = array![0.0, 0.0]; // unit variance

    let at_mean = Array2::zeros((5, 2));
    assert_eq!(layer.energy(&at_mean), Array1::<f64>::zeros(2));

    let off_mean = Array2::from_elem((5, 2), 2.0);
    let energy = layer.energy(&off_mean);
    // -(2^2 / 1) / 2 = -2
    assert_abs_diff_eq!(energy[0], -2.0, epsilon = 1e-12);
}

/// The pseudo-energy objective is finite and decreases as the model's
/// energy over the data grows.
#[test]
fn test_pseudo_energy_objective() {
    let mut system = System::from_topology(&Topology::new(vec![
        LayerSpec::sized("v", 4, true, UnitClass::Bernoulli),
        LayerSpec::sized("h", 2, false, UnitClass::Bernoulli),
    ]))
    .expect("topology");
    let mut rng = StdRng::seed_from_u64(19);
    system
        .initialize(None, &InitConfig::default(), &mut rng)
        .expect("init");
    system.set_mapping(vec![0, 1, 0]).expect("mapping");

    let data = Array2::from_elem((10, 4), 1.0);
    let value = system
        .evaluate(Objective::Energy, &data, &data)
        .expect("evaluate");
    assert!(value.is_finite());
    assert!(value >= 0.0, "log(1 + positive sum) is non-negative");

    // raising the visible bias lowers the energy of all-ones data, which
    // raises the pseudo-energy value
    system.layer_at_mut(0).bias.fill(2.0);
    let raised = system
        .evaluate(Objective::Energy, &data, &data)
        .expect("evaluate");
    assert!(raised > value);
}

/// Accuracy is a max-type objective: perfect reconstruction scores 1.
#[test]
fn test_accuracy_objective_perfect_score() {
    let mut system = System::from_topology(&Topology::new(vec![
        LayerSpec::sized("v", 2, true, UnitClass::Gauss),
        LayerSpec::sized("h", 2, false, UnitClass::Gauss),
    ]))
    .expect("topology");
    let mut rng = StdRng::seed_from_u64(7);
    system
        .initialize(None, &InitConfig::default(), &mut rng)
        .expect("init");

    // identity weights and zero bias reproduce the input exactly
    system.link_mut(0, 1).expect("link").w = array![[1.0, 0.0], [0.0, 1.0]];
    system.layer_at_mut(1).bias = array![0.0, 0.0];
    system.set_mapping(vec![0, 1]).expect("mapping");

    let input = array![[1.0, -1.0], [2.0, 0.5], [0.0, 3.0]];
    let value = system
        .evaluate(Objective::Accuracy, &input, &input)
        .expect("evaluate");
    assert_abs_diff_eq!(value, 1.0, epsilon = 1e-9);
}
