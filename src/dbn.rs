//! Deep Belief Network orchestration: layer-wise pretraining, transpose
//! splicing and backpropagation finetuning.
//!
//! A [`Dbn`] wraps a symmetric layer stack `L0 (visible) .. Lc .. Ln
//! (visible)`. Pretraining trains one two-layer subsystem per encoder
//! pair via contrastive divergence, each stage consuming the dataset
//! transformed through all previous stages. Splicing copies the encoder
//! parameters into the stack and the exact transposes into the mirrored
//! decoder half (weight sharing). Finetuning runs backpropagation
//! end-to-end over the spliced stack.

use ndarray::Array2;
use rand::rngs::StdRng;

use crate::ann;
use crate::data::TableDataset;
use crate::rbm::{Rbm, SubsystemKind};
use crate::system::{LayerSpec, System, Topology};
use crate::tracker::{AbortFlag, Objective, Tracker};
use crate::units::{Layer, UnitClass};
use crate::{InitConfig, ModelError, ModelResult, Schedule};

/// Schedules for one full DBN optimization, keyed by subsystem kind the
/// way the pretraining stages consume them. Phases can be skipped
/// individually.
#[derive(Debug, Clone)]
pub struct DbnSchedule {
    pub pretraining: bool,
    pub finetuning: bool,
    /// Schedule for Bernoulli-Bernoulli pretraining stages
    pub rbm: Schedule,
    /// Schedule for Gauss-Bernoulli pretraining stages
    pub grbm: Schedule,
    /// Schedule for backpropagation finetuning
    pub finetune: Schedule,
}

impl Default for DbnSchedule {
    fn default() -> Self {
        Self {
            pretraining: true,
            finetuning: true,
            rbm: Schedule::rbm(),
            grbm: Schedule::grbm(),
            finetune: Schedule::ann(),
        }
    }
}

/// Objective series of one optimization phase.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    pub objective: Objective,
    /// Recorded `(progress, value)` samples
    pub series: Vec<(f64, f64)>,
    pub best: Option<f64>,
    pub epochs: usize,
}

/// Learned parameters of one pretraining stage, kept for splicing.
#[derive(Debug, Clone)]
struct StageParams {
    /// Visible layer parameters; recorded for the very first stage only
    visible: Option<Layer>,
    hidden: Layer,
    w: Array2<f64>,
    a: Array2<bool>,
}

/// Symmetric deep stack with two-phase optimization.
#[derive(Debug, Clone)]
pub struct Dbn {
    pub system: System,
}

impl Dbn {
    /// Build from a topology; the stack must be symmetric around its
    /// central layer in both size and unit class.
    pub fn new(topology: &Topology) -> ModelResult<Self> {
        let shape: Vec<(usize, UnitClass)> = topology
            .layers
            .iter()
            .map(|spec| (spec.labels.len(), spec.class))
            .collect();
        validate_symmetry(&shape)?;
        let system = System::from_topology(topology)?;
        Ok(Self { system })
    }

    /// Wrap an existing system (checkpoint resume path); the same symmetry
    /// rules apply.
    pub fn from_system(system: System) -> ModelResult<Self> {
        let shape: Vec<(usize, UnitClass)> = system
            .layers()
            .iter()
            .map(|layer| (layer.len(), layer.class))
            .collect();
        validate_symmetry(&shape)?;
        Ok(Self { system })
    }

    /// Index of the central layer.
    pub fn center(&self) -> usize {
        (self.system.layers().len() - 1) / 2
    }

    /// Initialize all parameters from data statistics.
    pub fn initialize(
        &mut self,
        dataset: &TableDataset,
        init: &InitConfig,
        rng: &mut StdRng,
    ) -> ModelResult<()> {
        self.system.initialize(Some(dataset), init, rng)
    }

    /// Full optimization: pretrain each encoder pair, splice, finetune.
    /// Returns one report per executed phase.
    pub fn optimize(
        &mut self,
        dataset: &TableDataset,
        schedule: &DbnSchedule,
        init: &InitConfig,
        abort: &AbortFlag,
        rng: &mut StdRng,
    ) -> ModelResult<Vec<StageReport>> {
        let mut reports = Vec::new();
        if schedule.pretraining {
            let stages = self.pretrain(dataset, schedule, init, abort, rng, &mut reports)?;
            self.splice(&stages)?;
        }
        if schedule.finetuning {
            reports.push(self.finetune(dataset, &schedule.finetune, abort, rng)?);
        }
        Ok(reports)
    }

    /// Train one RBM/GRBM per encoder pair, chaining each stage on the
    /// previous stage's feature representation.
    fn pretrain(
        &mut self,
        dataset: &TableDataset,
        schedule: &DbnSchedule,
        init: &InitConfig,
        abort: &AbortFlag,
        rng: &mut StdRng,
        reports: &mut Vec<StageReport>,
    ) -> ModelResult<Vec<StageParams>> {
        let cid = self.center();
        let mut stages = Vec::with_capacity(cid);
        let mut current = dataset.clone();
        let mut prev_hidden: Option<Layer> = None;

        for lid in 0..cid {
            let src = self.system.layer_at(lid);
            let tgt = self.system.layer_at(lid + 1);
            let kind = SubsystemKind::for_classes(src.class, tgt.class)?;
            let name = format!("{} <-> {}", src.name, tgt.name);
            let topology = Topology::new(vec![
                LayerSpec::with_labels(&src.name, src.labels.clone(), true, src.class),
                LayerSpec::with_labels(&tgt.name, tgt.labels.clone(), false, tgt.class),
            ]);

            let mut rbm = Rbm::new(&topology)?;
            rbm.initialize(Some(&current), init, rng)?;

            // stage chaining: the visible layer starts from the previous
            // stage's learned hidden parameters
            if let Some(prev) = &prev_hidden {
                copy_params(rbm.system.layer_at_mut(0), prev);
            }

            let stage_schedule = match kind {
                SubsystemKind::Rbm => &schedule.rbm,
                SubsystemKind::Grbm => &schedule.grbm,
            };
            let mut tracker = Tracker::with_abort(stage_schedule, abort.clone());
            rbm.optimize(&current, stage_schedule, &mut tracker, rng)?;
            reports.push(StageReport {
                name,
                objective: stage_schedule.objective,
                series: tracker.obj_values().to_vec(),
                best: tracker.best_value(),
                epochs: tracker.epoch(),
            });

            let hidden = rbm.hidden().clone();
            let block = rbm.system.link(0, 1)?;
            stages.push(StageParams {
                visible: (lid == 0).then(|| rbm.visible().clone()),
                hidden: hidden.clone(),
                w: block.w.clone(),
                a: block.a.clone(),
            });
            prev_hidden = Some(hidden);

            if lid + 1 < cid {
                current = current.transform(&rbm.system, &[0, 1])?;
            }
        }
        Ok(stages)
    }

    /// Copy encoder parameters into the stack and their exact transposes
    /// into the mirrored decoder half; the center layer is copied without
    /// mirroring.
    fn splice(&mut self, stages: &[StageParams]) -> ModelResult<()> {
        let n = self.system.layers().len();
        let cid = self.center();

        for (lid, stage) in stages.iter().enumerate() {
            if lid == 0 {
                if let Some(visible) = &stage.visible {
                    copy_params(self.system.layer_at_mut(0), visible);
                }
            }
            copy_params(self.system.layer_at_mut(lid + 1), &stage.hidden);

            let enc = self.system.link_mut(lid, lid + 1)?;
            enc.w = stage.w.clone();
            enc.a = stage.a.clone();

            let dec = self.system.link_mut(n - 2 - lid, n - 1 - lid)?;
            dec.w = stage.w.t().to_owned();
            dec.a = stage.a.t().to_owned();
        }

        // mirror encoder unit parameters onto the decoder half
        for lid in 0..cid {
            let enc = self.system.layer_at(lid).clone();
            copy_params(self.system.layer_at_mut(n - 1 - lid), &enc);
        }

        self.system.check_shapes()
    }

    /// Backpropagation end-to-end over the spliced stack.
    fn finetune(
        &mut self,
        dataset: &TableDataset,
        schedule: &Schedule,
        abort: &AbortFlag,
        rng: &mut StdRng,
    ) -> ModelResult<StageReport> {
        let mapping: Vec<usize> = (0..self.system.layers().len()).collect();
        self.system.set_mapping(mapping)?;
        let mut tracker = Tracker::with_abort(schedule, abort.clone());
        ann::optimize(&mut self.system, dataset, schedule, &mut tracker, rng)?;
        Ok(StageReport {
            name: "finetuning".to_string(),
            objective: schedule.objective,
            series: tracker.obj_values().to_vec(),
            best: tracker.best_value(),
            epochs: tracker.epoch(),
        })
    }
}

/// Copy distribution parameters between layers of the same class, keeping
/// name, labels and visibility of the destination.
fn copy_params(dst: &mut Layer, src: &Layer) {
    dst.bias = src.bias.clone();
    if dst.class == UnitClass::Gauss && src.class == UnitClass::Gauss {
        dst.lvar = src.lvar.clone();
    }
}

fn validate_symmetry(shape: &[(usize, UnitClass)]) -> ModelResult<()> {
    let n = shape.len();
    if n < 3 || n % 2 == 0 {
        return Err(ModelError::InvalidConfig(format!(
            "a DBN stack needs an odd number of layers (at least 3), got {n}"
        )));
    }
    for i in 0..n / 2 {
        if shape[i] != shape[n - 1 - i] {
            return Err(ModelError::InvalidConfig(format!(
                "layer {i} does not mirror layer {}",
                n - 1 - i
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data;
    use rand::SeedableRng;

    fn autoencoder_topology(dims: &[usize]) -> Topology {
        let specs = dims
            .iter()
            .enumerate()
            .map(|(i, &d)| {
                let visible = i == 0 || i == dims.len() - 1;
                LayerSpec::sized(&format!("l{i}"), d, visible, UnitClass::Bernoulli)
            })
            .collect();
        Topology::new(specs)
    }

    #[test]
    fn test_symmetry_validation() {
        assert!(Dbn::new(&autoencoder_topology(&[4, 2, 4])).is_ok());
        assert!(Dbn::new(&autoencoder_topology(&[4, 2])).is_err());
        assert!(Dbn::new(&autoencoder_topology(&[4, 2, 3])).is_err());
    }

    #[test]
    fn test_mixed_class_symmetry_validation() {
        let topology = Topology::new(vec![
            LayerSpec::sized("in", 4, true, UnitClass::Gauss),
            LayerSpec::sized("mid", 2, false, UnitClass::Bernoulli),
            LayerSpec::sized("out", 4, true, UnitClass::Bernoulli),
        ]);
        assert!(matches!(
            Dbn::new(&topology),
            Err(ModelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_unsupported_pair_fails_pretraining() {
        // Bernoulli visible feeding a Gauss hidden layer has no subsystem kind
        let topology = Topology::new(vec![
            LayerSpec::sized("in", 4, true, UnitClass::Bernoulli),
            LayerSpec::sized("mid", 2, false, UnitClass::Gauss),
            LayerSpec::sized("out", 4, true, UnitClass::Bernoulli),
        ]);
        let mut dbn = Dbn::new(&topology).expect("symmetric");
        let mut rng = StdRng::seed_from_u64(6);
        let dataset = data::synthetic_binary(40, 4, &mut rng).expect("data");
        dbn.initialize(&dataset, &InitConfig::default(), &mut rng)
            .expect("init");
        let schedule = quick_schedule();
        let result = dbn.optimize(
            &dataset,
            &schedule,
            &InitConfig::default(),
            &AbortFlag::new(),
            &mut rng,
        );
        assert!(matches!(result, Err(ModelError::UnsupportedPair(_, _))));
    }

    fn quick_schedule() -> DbnSchedule {
        let base = Schedule {
            updates: 20,
            minibatch_size: 16,
            obj_update_interval: 5,
            estimate_time: false,
            ..Schedule::rbm()
        };
        DbnSchedule {
            pretraining: true,
            finetuning: true,
            rbm: base.clone(),
            grbm: Schedule {
                rate: 0.0005,
                ..base.clone()
            },
            finetune: Schedule {
                algorithm: crate::Algorithm::Bprop,
                ..base
            },
        }
    }

    #[test]
    fn test_splice_transpose_law() {
        let mut dbn = Dbn::new(&autoencoder_topology(&[4, 3, 2, 3, 4])).expect("dbn");
        let mut rng = StdRng::seed_from_u64(17);
        let dataset = data::synthetic_binary(60, 4, &mut rng).expect("data");
        dbn.initialize(&dataset, &InitConfig::default(), &mut rng)
            .expect("init");

        let mut schedule = quick_schedule();
        schedule.finetuning = false;
        dbn.optimize(
            &dataset,
            &schedule,
            &InitConfig::default(),
            &AbortFlag::new(),
            &mut rng,
        )
        .expect("pretrain + splice");

        // every mirrored pair carries the exact transpose before finetuning
        let enc0 = dbn.system.link(0, 1).expect("enc0").w.clone();
        let dec0 = dbn.system.link(3, 4).expect("dec0").w.clone();
        assert_eq!(dec0, enc0.reversed_axes());
        let enc1 = dbn.system.link(1, 2).expect("enc1").w.clone();
        let dec1 = dbn.system.link(2, 3).expect("dec1").w.clone();
        assert_eq!(dec1, enc1.reversed_axes());
    }

    #[test]
    fn test_full_optimization_produces_reports() {
        let mut dbn = Dbn::new(&autoencoder_topology(&[4, 2, 4])).expect("dbn");
        let mut rng = StdRng::seed_from_u64(23);
        let dataset = data::synthetic_binary(60, 4, &mut rng).expect("data");
        dbn.initialize(&dataset, &InitConfig::default(), &mut rng)
            .expect("init");

        let reports = dbn
            .optimize(
                &dataset,
                &quick_schedule(),
                &InitConfig::default(),
                &AbortFlag::new(),
                &mut rng,
            )
            .expect("optimize");

        // one pretraining stage plus finetuning
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].name, "finetuning");
        assert!(reports.iter().all(|r| !r.series.is_empty()));
        assert!(reports.iter().all(|r| r.epochs == 20));
        dbn.system.check_shapes().expect("shapes hold");
    }
}
