//! End-to-end tests for the training pipeline: RBM optimization, DBN
//! pretraining and finetuning, keep-optimum snapshots, cooperative abort,
//! and checkpoint resume.

use dbn::checkpoint::{load_params, save_params};
use dbn::data::{self, Dataset};
use dbn::system::{LayerSpec, Topology};
use dbn::tracker::{AbortFlag, Tracker};
use dbn::units::UnitClass;
use dbn::{Dbn, DbnSchedule, InitConfig, Objective, Rbm, Schedule};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn quick_rbm_schedule(updates: usize) -> Schedule {
    Schedule {
        updates,
        minibatch_size: 32,
        minibatch_update_interval: 5,
        obj_update_interval: 10,
        obj_init_wait: 0.0,
        estimate_time: false,
        ..Schedule::rbm()
    }
}

fn binary_rbm(n_v: usize, n_h: usize) -> Rbm {
    Rbm::new(&Topology::new(vec![
        LayerSpec::sized("visible", n_v, true, UnitClass::Bernoulli),
        LayerSpec::sized("hidden", n_h, false, UnitClass::Bernoulli),
    ]))
    .expect("valid rbm")
}

/// Contrastive divergence on structured binary data lowers the
/// reconstruction error over training.
#[test]
fn test_rbm_training_reduces_reconstruction_error() {
    let mut rng = StdRng::seed_from_u64(101);
    let dataset = data::synthetic_binary(200, 8, &mut rng).expect("data");
    let mut rbm = binary_rbm(8, 4);
    rbm.initialize(Some(&dataset), &InitConfig::default(), &mut rng)
        .expect("init");

    let (inputs, targets) = dataset.all();
    let before = rbm
        .system
        .evaluate(Objective::Error, &inputs, &targets)
        .expect("eval");

    let schedule = quick_rbm_schedule(300);
    let mut tracker = Tracker::new(&schedule);
    rbm.optimize(&dataset, &schedule, &mut tracker, &mut rng)
        .expect("optimize");

    let after = rbm
        .system
        .evaluate(Objective::Error, &inputs, &targets)
        .expect("eval");
    assert!(
        after < before,
        "reconstruction error should drop: {before} -> {after}"
    );
    rbm.system.check_shapes().expect("shapes hold after training");
}

/// With "keep optimum" enabled and a min-type objective, training ends at
/// its best observed point: the restored parameters' objective value is
/// less than or equal to every recorded sample.
#[test]
fn test_keep_optimum_restores_best_parameters() {
    let mut rng = StdRng::seed_from_u64(55);
    let dataset = data::synthetic_binary(150, 6, &mut rng).expect("data");
    let mut rbm = binary_rbm(6, 3);
    rbm.initialize(Some(&dataset), &InitConfig::default(), &mut rng)
        .expect("init");

    let schedule = Schedule {
        keep_optimum: true,
        objective: Objective::Error,
        obj_update_interval: 5,
        ..quick_rbm_schedule(200)
    };
    let mut tracker = Tracker::new(&schedule);
    rbm.optimize(&dataset, &schedule, &mut tracker, &mut rng)
        .expect("optimize");

    let (inputs, targets) = dataset.all();
    let restored = rbm
        .system
        .evaluate(Objective::Error, &inputs, &targets)
        .expect("eval");

    assert!(!tracker.obj_values().is_empty());
    for &(_, value) in tracker.obj_values() {
        assert!(
            restored <= value + 1e-12,
            "restored objective {restored} exceeds recorded sample {value}"
        );
    }
    assert_eq!(Some(restored), tracker.best_value());
}

/// A pre-triggered abort stops at the first epoch boundary and still
/// leaves the store in the restored-best state.
#[test]
fn test_abort_stops_at_epoch_boundary() {
    let mut rng = StdRng::seed_from_u64(3);
    let dataset = data::synthetic_binary(100, 6, &mut rng).expect("data");
    let mut rbm = binary_rbm(6, 3);
    rbm.initialize(Some(&dataset), &InitConfig::default(), &mut rng)
        .expect("init");

    let schedule = quick_rbm_schedule(100_000);
    let abort = AbortFlag::new();
    abort.trigger();
    let mut tracker = Tracker::with_abort(&schedule, abort);
    rbm.optimize(&dataset, &schedule, &mut tracker, &mut rng)
        .expect("optimize");

    assert_eq!(tracker.epoch(), 1);
    assert!(tracker.best_value().is_some());
    rbm.system.check_shapes().expect("shapes hold after abort");
}

/// Full DBN pipeline on a Gaussian table: GRBM first stage, RBM second,
/// splice, finetune. Shapes and the reconstruction error stay finite.
#[test]
fn test_dbn_gaussian_pipeline() {
    let mut rng = StdRng::seed_from_u64(29);
    let mut dataset = data::synthetic(300, 8, &mut rng).expect("data");
    dataset.normalize();

    let topology = Topology::new(vec![
        LayerSpec::sized("visible", 8, true, UnitClass::Gauss),
        LayerSpec::sized("hidden1", 4, false, UnitClass::Bernoulli),
        LayerSpec::sized("central", 2, false, UnitClass::Bernoulli),
        LayerSpec::sized("hidden2", 4, false, UnitClass::Bernoulli),
        LayerSpec::sized("output", 8, true, UnitClass::Gauss),
    ]);
    let mut dbn = Dbn::new(&topology).expect("dbn");
    dbn.initialize(&dataset, &InitConfig::default(), &mut rng)
        .expect("init");

    let base = quick_rbm_schedule(50);
    let schedule = DbnSchedule {
        pretraining: true,
        finetuning: true,
        rbm: base.clone(),
        grbm: Schedule {
            rate: 0.0005,
            ..base.clone()
        },
        finetune: Schedule {
            updates: 50,
            ..base
        },
    };
    let reports = dbn
        .optimize(
            &dataset,
            &schedule,
            &InitConfig::default(),
            &AbortFlag::new(),
            &mut rng,
        )
        .expect("optimize");

    // two pretraining stages plus finetuning
    assert_eq!(reports.len(), 3);
    assert_eq!(reports[2].name, "finetuning");
    dbn.system.check_shapes().expect("shapes hold");

    let (inputs, targets) = dataset.all();
    let error = dbn
        .system
        .evaluate(Objective::Error, &inputs, &targets)
        .expect("eval");
    assert!(error.is_finite());
}

/// A spliced network survives a checkpoint round trip and can resume
/// finetuning from the restored store.
#[test]
fn test_checkpoint_resume_finetunes() {
    let mut rng = StdRng::seed_from_u64(31);
    let dataset = data::synthetic_binary(150, 6, &mut rng).expect("data");

    let topology = Topology::new(vec![
        LayerSpec::sized("visible", 6, true, UnitClass::Bernoulli),
        LayerSpec::sized("central", 3, false, UnitClass::Bernoulli),
        LayerSpec::sized("output", 6, true, UnitClass::Bernoulli),
    ]);
    let mut dbn = Dbn::new(&topology).expect("dbn");
    dbn.initialize(&dataset, &InitConfig::default(), &mut rng)
        .expect("init");

    let mut schedule = DbnSchedule {
        rbm: quick_rbm_schedule(50),
        ..DbnSchedule::default()
    };
    schedule.finetuning = false;
    dbn.optimize(
        &dataset,
        &schedule,
        &InitConfig::default(),
        &AbortFlag::new(),
        &mut rng,
    )
    .expect("pretrain");

    let dir = std::env::temp_dir().join("dbn_test_resume");
    let path = dir.join("spliced.json");
    save_params(&dbn.system, &path, 50, 0.5).expect("save");

    let (_, system) = load_params(&path).expect("load");
    let mut resumed = Dbn::from_system(system).expect("symmetric");
    let resume_schedule = DbnSchedule {
        pretraining: false,
        finetuning: true,
        finetune: quick_rbm_schedule(30),
        ..DbnSchedule::default()
    };
    let reports = resumed
        .optimize(
            &dataset,
            &resume_schedule,
            &InitConfig::default(),
            &AbortFlag::new(),
            &mut rng,
        )
        .expect("finetune");

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].name, "finetuning");
    resumed.system.check_shapes().expect("shapes hold");

    let _ = std::fs::remove_dir_all(&dir);
}

/// Unit removal keeps every store invariant across the system.
#[test]
fn test_remove_units_preserves_invariants_after_training() {
    let mut rng = StdRng::seed_from_u64(41);
    let dataset = data::synthetic_binary(100, 6, &mut rng).expect("data");
    let mut rbm = binary_rbm(6, 4);
    rbm.initialize(Some(&dataset), &InitConfig::default(), &mut rng)
        .expect("init");

    let schedule = quick_rbm_schedule(50);
    let mut tracker = Tracker::new(&schedule);
    rbm.optimize(&dataset, &schedule, &mut tracker, &mut rng)
        .expect("optimize");

    rbm.system
        .remove_units("hidden", &["hidden:1".to_string(), "hidden:3".to_string()])
        .expect("remove");
    assert_eq!(rbm.hidden().len(), 2);
    assert_eq!(rbm.system.link(0, 1).expect("link").w.dim(), (6, 2));
    rbm.system.check_shapes().expect("shapes hold");
}
