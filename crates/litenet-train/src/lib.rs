//! # litenet-train
//!
//! Training machinery for litenet classifiers.
//!
//! Two modes share one epoch loop ([`Trainer`]):
//!
//! - **Plain**: the student is fit to ground-truth labels with (optionally
//!   class-balanced) cross-entropy.
//! - **Distillation**: each batch also runs through a frozen teacher
//!   ([`litenet_core::FrozenModel`]); the loss blends cross-entropy with the
//!   temperature-softened KL divergence to the teacher's predictions.
//!
//! Optimisation is SGD with momentum under a per-batch one-cycle schedule.
//! With `fp16` on an accelerator the forward runs in F16 behind a dynamic
//! [`GradScaler`].  After every epoch the held-out split is evaluated and the
//! weights are saved when macro F1 improves.
//!
//! ```no_run
//! # use anyhow::Result;
//! # fn main() -> Result<()> {
//! use std::path::Path;
//! use candle_core::Device;
//! use litenet_core::{ModelConfig, TrainableModel};
//! use litenet_train::{create_dataloaders, Criterion, JsonlTracker, RunContext, Trainer, TrainerConfig};
//!
//! let cfg = ModelConfig::from_yaml_file(Path::new("configs/model/tiny.yaml"))?;
//! let splits = create_dataloaders(Path::new("data"), cfg.input_channel, 32, 32)?;
//! let model = TrainableModel::new(&cfg, 32, &Device::Cpu, 42)?;
//! let config = TrainerConfig::new(10, 0.1, false, "exp/latest/best.pt".into());
//! let mut trainer = Trainer::new(model, config, splits.train.len())?;
//! let tracker = JsonlTracker::create(Path::new("exp/latest"), "lightweight", "exp")?;
//! let mut ctx = RunContext::new(42, Box::new(tracker));
//! let outcome = trainer.train(&mut ctx, &splits.train, &splits.held_out, &Criterion::unweighted())?;
//! println!("best f1 {:.3}", outcome.best_f1);
//! # Ok(())
//! # }
//! ```

pub mod amp;
pub mod context;
pub mod dataset;
pub mod loss;
pub mod metrics;
pub mod optim;
pub mod schedule;
pub mod tracking;
pub mod trainer;

pub use amp::GradScaler;
pub use context::RunContext;
pub use dataset::{create_dataloaders, label_counts, Batch, DataLoader, DataSplits, Dataset, ImageFolder, InMemoryDataset, Sample};
pub use loss::{class_balanced_weights, Criterion, DistillCriterion};
pub use metrics::{accuracy, macro_f1, EvalResult};
pub use optim::{ParamsSgd, SgdMomentum};
pub use schedule::OneCycleLr;
pub use tracking::{ExperimentTracker, JsonlTracker};
pub use trainer::{EpochReport, TrainOutcome, Trainer, TrainerConfig};
