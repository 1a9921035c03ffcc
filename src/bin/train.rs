//! DBN training binary.
//!
//! Trains a symmetric deep belief network on synthetic Gaussian data:
//! layer-wise contrastive-divergence pretraining, transpose splicing and
//! backpropagation finetuning. Writes JSONL metrics per objective sample
//! and saves the final parameter store as a JSON checkpoint.
//!
//! Type `q` followed by return to abort; the current epoch completes and
//! the best-observed parameters are restored before the checkpoint is
//! written.

use clap::Parser;
use dbn::checkpoint::{load_params, save_params};
use dbn::data::{self, Dataset};
use dbn::system::{LayerSpec, Topology};
use dbn::tracker::AbortFlag;
use dbn::units::UnitClass;
use dbn::{Algorithm, Dbn, DbnSchedule, InitConfig, Objective, Schedule, StageReport};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "dbn-train",
    about = "Train a deep belief network on synthetic data"
)]
struct Args {
    /// Number of synthetic samples
    #[arg(long, default_value_t = 2000)]
    rows: usize,

    /// Visible layer size
    #[arg(long, default_value_t = 16)]
    visible: usize,

    /// First hidden layer size
    #[arg(long, default_value_t = 8)]
    hidden: usize,

    /// Central layer size
    #[arg(long, default_value_t = 4)]
    central: usize,

    /// Contrastive-divergence updates per pretraining stage
    #[arg(long, default_value_t = 5000)]
    pretrain_updates: usize,

    /// Backpropagation updates for finetuning
    #[arg(long, default_value_t = 5000)]
    finetune_updates: usize,

    /// Mini-batch size
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Finetuning update policy: bprop or rprop
    #[arg(long, default_value = "rprop")]
    algorithm: String,

    /// RNG seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Output metrics file (JSONL)
    #[arg(long, default_value = "data/output/metrics.jsonl")]
    metrics_file: PathBuf,

    /// Checkpoint file
    #[arg(long, default_value = "data/checkpoints/dbn.json")]
    checkpoint: PathBuf,

    /// Resume a spliced network from a checkpoint and finetune only
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Skip pretraining
    #[arg(long, default_value_t = false)]
    no_pretrain: bool,

    /// Skip finetuning
    #[arg(long, default_value_t = false)]
    no_finetune: bool,
}

/// One JSONL metrics record, one per objective sample.
#[derive(Debug, Serialize)]
struct MetricRecord<'a> {
    stage: &'a str,
    objective: &'a str,
    progress: f64,
    value: f64,
}

fn write_metrics(path: &PathBuf, reports: &[StageReport]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for report in reports {
        for &(progress, value) in &report.series {
            let record = MetricRecord {
                stage: &report.name,
                objective: report.objective.name(),
                progress,
                value,
            };
            let line = serde_json::to_string(&record)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            writeln!(file, "{line}")?;
        }
    }
    Ok(())
}

/// Watch stdin for a `q` line and trip the abort flag. Training itself
/// stays single-threaded; the flag is polled once per epoch.
fn spawn_abort_watcher(abort: AbortFlag) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(text) if text.trim() == "q" => {
                    abort.trigger();
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
}

fn main() {
    let args = Args::parse();
    let mut rng = StdRng::seed_from_u64(args.seed);

    let algorithm = match args.algorithm.as_str() {
        "bprop" => Algorithm::Bprop,
        "rprop" => Algorithm::Rprop,
        other => {
            eprintln!("unknown algorithm '{other}', expected 'bprop' or 'rprop'");
            std::process::exit(1);
        }
    };

    let mut dataset = data::synthetic(args.rows, args.visible, &mut rng)
        .expect("Failed to generate synthetic data");
    dataset.normalize();

    let init = InitConfig::default();
    let mut dbn = if let Some(ref ckpt_path) = args.resume {
        eprintln!("Resuming from checkpoint: {}", ckpt_path.display());
        let (ckpt, system) = load_params(ckpt_path).expect("Failed to load checkpoint");
        eprintln!(
            "  Resumed at epoch {}, objective={:.4}",
            ckpt.epoch, ckpt.objective_value
        );
        Dbn::from_system(system).expect("Checkpoint is not a symmetric stack")
    } else {
        let topology = Topology::new(vec![
            LayerSpec::sized("visible", args.visible, true, UnitClass::Gauss),
            LayerSpec::sized("hidden1", args.hidden, false, UnitClass::Bernoulli),
            LayerSpec::sized("central", args.central, false, UnitClass::Bernoulli),
            LayerSpec::sized("hidden2", args.hidden, false, UnitClass::Bernoulli),
            LayerSpec::sized("output", args.visible, true, UnitClass::Gauss),
        ]);
        let mut dbn = Dbn::new(&topology).expect("Failed to build DBN");
        dbn.initialize(&dataset, &init, &mut rng)
            .expect("Failed to initialize parameters");
        dbn
    };

    let schedule = DbnSchedule {
        pretraining: !args.no_pretrain && args.resume.is_none(),
        finetuning: !args.no_finetune,
        rbm: Schedule {
            updates: args.pretrain_updates,
            minibatch_size: args.batch_size,
            ..Schedule::rbm()
        },
        grbm: Schedule {
            updates: args.pretrain_updates,
            minibatch_size: args.batch_size,
            ..Schedule::grbm()
        },
        finetune: Schedule {
            updates: args.finetune_updates,
            minibatch_size: args.batch_size,
            algorithm,
            ..Schedule::ann()
        },
    };

    eprintln!("DBN Training");
    eprintln!(
        "  Network: {:?}",
        dbn.system.layers().iter().map(|l| l.len()).collect::<Vec<_>>()
    );
    eprintln!("  Samples: {}, batch size: {}", dataset.len(), args.batch_size);
    eprintln!(
        "  Pretraining: {} updates/stage, finetuning: {} updates ({:?})",
        args.pretrain_updates, args.finetune_updates, algorithm
    );
    eprintln!("  Metrics: {}", args.metrics_file.display());
    eprintln!("  Checkpoint: {}", args.checkpoint.display());
    eprintln!("  Press 'q' + return to abort");
    eprintln!();

    let abort = AbortFlag::new();
    spawn_abort_watcher(abort.clone());

    let reports = dbn
        .optimize(&dataset, &schedule, &init, &abort, &mut rng)
        .expect("Optimization failed");

    for report in &reports {
        eprintln!(
            "  {}: {} epochs, best {} = {}",
            report.name,
            report.epochs,
            report.objective.name(),
            report
                .best
                .map_or_else(|| "n/a".to_string(), |v| format!("{v:.4}"))
        );
    }

    write_metrics(&args.metrics_file, &reports).expect("Failed to write metrics");

    let (inputs, targets) = dataset.all();
    let final_error = dbn
        .system
        .evaluate(Objective::Error, &inputs, &targets)
        .expect("Failed to evaluate final error");
    let epochs = reports.iter().map(|r| r.epochs).sum();
    save_params(&dbn.system, &args.checkpoint, epochs, final_error)
        .expect("Failed to save checkpoint");
    eprintln!("Saved checkpoint with error = {final_error:.4}");
}
