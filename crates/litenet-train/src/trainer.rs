//! Training loops.
//!
//! [`Trainer::train`] fits the student against ground-truth labels;
//! [`Trainer::train_kd`] additionally runs every batch through a frozen
//! teacher and optimises the distillation criterion.  Both share one epoch
//! loop:
//!
//! 1. forward the batch (F16 on accelerators when `fp16` is set),
//! 2. compute the objective and backpropagate (loss-scaled under F16),
//! 3. step the optimiser, then the one-cycle schedule,
//! 4. after the epoch, evaluate on the held-out split and save the weights
//!    to `model_path` whenever macro F1 beats every earlier epoch.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use candle_core::{DType, Tensor, Var};
use candle_nn::Optimizer;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{debug, info};

use litenet_core::device::device_name;
use litenet_core::{mixed_precision_dtype, FrozenModel, TrainableModel};

use crate::amp::GradScaler;
use crate::context::RunContext;
use crate::dataset::{Batch, DataLoader};
use crate::loss::{Criterion, DistillCriterion};
use crate::metrics::{EvalResult, MetricAccumulator};
use crate::optim::{ParamsSgd, SgdMomentum};
use crate::schedule::OneCycleLr;

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub epochs: usize,
    /// Peak learning rate of the one-cycle schedule.
    pub init_lr: f64,
    pub momentum: f64,
    pub pct_start: f64,
    /// Request F16 compute; ignored on CPU.
    pub fp16: bool,
    /// Where the best weights are written.
    pub model_path: PathBuf,
}

impl TrainerConfig {
    pub fn new(epochs: usize, init_lr: f64, fp16: bool, model_path: PathBuf) -> Self {
        Self {
            epochs,
            init_lr,
            momentum: 0.9,
            pct_start: OneCycleLr::PCT_START,
            fp16,
            model_path,
        }
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_acc: f64,
    pub val: EvalResult,
    /// Learning rate at the end of the epoch.
    pub lr: f64,
    pub skipped_steps: usize,
}

/// Summary of a training run.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    /// Held-out accuracy of the epoch with the best F1.
    pub best_acc: f64,
    pub best_f1: f64,
    pub best_epoch: usize,
    pub history: Vec<EpochReport>,
}

// ── Objectives ────────────────────────────────────────────────────────────────

trait Objective {
    fn loss(&self, student_logits: &Tensor, batch: &Batch, compute: Option<DType>) -> Result<Tensor>;
}

struct HardLabels<'a>(&'a Criterion);

impl Objective for HardLabels<'_> {
    fn loss(&self, student_logits: &Tensor, batch: &Batch, _compute: Option<DType>) -> Result<Tensor> {
        self.0.loss(student_logits, &batch.labels)
    }
}

struct Distillation<'a> {
    teacher: &'a FrozenModel,
    criterion: &'a DistillCriterion,
}

impl Objective for Distillation<'_> {
    fn loss(&self, student_logits: &Tensor, batch: &Batch, compute: Option<DType>) -> Result<Tensor> {
        let teacher_logits = self.teacher.logits(&batch.images, compute)?;
        self.criterion.loss(student_logits, &teacher_logits, &batch.labels)
    }
}

// ── Trainer ───────────────────────────────────────────────────────────────────

pub struct Trainer {
    model: TrainableModel,
    vars: Vec<Var>,
    optimizer: SgdMomentum,
    scheduler: OneCycleLr,
    scaler: Option<GradScaler>,
    compute: Option<DType>,
    config: TrainerConfig,
}

impl Trainer {
    /// Set up the optimiser and a schedule spanning
    /// `steps_per_epoch · config.epochs` batches.
    pub fn new(model: TrainableModel, config: TrainerConfig, steps_per_epoch: usize) -> Result<Self> {
        let scheduler = OneCycleLr::new(config.init_lr, steps_per_epoch, config.epochs, config.pct_start)
            .context("Invalid learning-rate schedule")?;
        let vars = model.trainable_vars()?;
        let mut optimizer = SgdMomentum::new(
            vars.clone(),
            ParamsSgd { lr: config.init_lr, momentum: config.momentum, weight_decay: 0.0 },
        )?;
        scheduler.apply(&mut optimizer);

        let compute = mixed_precision_dtype(model.device(), config.fp16);
        let scaler = compute.map(|_| GradScaler::default());
        info!(
            device = device_name(model.device()),
            epochs = config.epochs,
            steps_per_epoch,
            max_lr = config.init_lr,
            mixed_precision = compute.is_some(),
            "Trainer ready"
        );

        Ok(Self { model, vars, optimizer, scheduler, scaler, compute, config })
    }

    /// Train against ground-truth labels.
    pub fn train(
        &mut self,
        ctx: &mut RunContext,
        train: &DataLoader,
        val: &DataLoader,
        criterion: &Criterion,
    ) -> Result<TrainOutcome> {
        self.fit(ctx, train, val, criterion, &HardLabels(criterion), "train")
    }

    /// Train against a blend of labels and the teacher's softened outputs.
    ///
    /// The teacher is only ever read; validation uses the hard-label part of
    /// `criterion`.
    pub fn train_kd(
        &mut self,
        ctx: &mut RunContext,
        train: &DataLoader,
        val: &DataLoader,
        teacher: &FrozenModel,
        criterion: &DistillCriterion,
    ) -> Result<TrainOutcome> {
        ensure!(
            teacher.num_classes() == self.model.num_classes(),
            "Teacher predicts {} classes but the student predicts {}",
            teacher.num_classes(),
            self.model.num_classes()
        );
        info!(temperature = criterion.temperature(), alpha = criterion.alpha(), "Distillation enabled");
        self.fit(ctx, train, val, criterion.hard(), &Distillation { teacher, criterion }, "distill")
    }

    /// Evaluate the current weights: `(loss, f1, accuracy)` over `loader`.
    pub fn test(&self, loader: &DataLoader, criterion: &Criterion) -> Result<EvalResult> {
        let mut acc = MetricAccumulator::default();
        for batch in loader.sequential(self.model.device()) {
            let batch = batch?;
            let logits = self.model.forward(&batch.images, self.compute)?.detach();
            let loss = criterion.loss(&logits, &batch.labels)?.to_scalar::<f32>()? as f64;
            acc.update(loss, &logits, &batch.labels)?;
        }
        Ok(acc.finish())
    }

    /// Replace the current weights with the best checkpoint of this run.
    pub fn reload_best(&mut self) -> Result<()> {
        self.model
            .load(&self.config.model_path)
            .with_context(|| format!("Cannot reload {}", self.config.model_path.display()))
    }

    fn fit(
        &mut self,
        ctx: &mut RunContext,
        train: &DataLoader,
        val: &DataLoader,
        eval_criterion: &Criterion,
        objective: &dyn Objective,
        label: &str,
    ) -> Result<TrainOutcome> {
        ensure!(!train.is_empty(), "Training split is empty");
        ensure!(!val.is_empty(), "Held-out split is empty");
        ensure!(
            train.num_classes() == self.model.num_classes(),
            "Dataset has {} classes but the model predicts {}",
            train.num_classes(),
            self.model.num_classes()
        );

        let device = self.model.device().clone();
        let epochs = self.config.epochs;
        let start = Instant::now();
        let mut best: Option<(usize, EvalResult)> = None;
        let mut history = Vec::with_capacity(epochs);

        for epoch in 1..=epochs {
            let pb = progress_bar(train.len() as u64, &format!("{label} {epoch}/{epochs}"));
            let mut running = MetricAccumulator::default();
            let mut skipped_steps = 0;

            for batch in train.epoch(ctx.rng_mut(), &device) {
                let batch = batch?;
                let logits = self.model.forward(&batch.images, self.compute)?;
                let loss = objective.loss(&logits, &batch, self.compute)?;
                let loss_val = loss.to_scalar::<f32>()? as f64;

                if !self.backward_step(&loss)? {
                    skipped_steps += 1;
                }
                self.scheduler.step(&mut self.optimizer);

                running.update(loss_val, &logits.detach(), &batch.labels)?;
                pb.set_message(format!("loss {loss_val:.4}"));
                pb.inc(1);
            }
            pb.finish_and_clear();

            let train_metrics = running.finish();
            let val_metrics = self.test(val, eval_criterion)?;
            let report = EpochReport {
                epoch,
                train_loss: train_metrics.loss,
                train_acc: train_metrics.accuracy,
                val: val_metrics,
                lr: self.optimizer.learning_rate(),
                skipped_steps,
            };

            info!(
                epoch,
                train_loss = report.train_loss,
                train_acc = report.train_acc,
                val_loss = val_metrics.loss,
                val_f1 = val_metrics.f1,
                val_acc = val_metrics.accuracy,
                lr = report.lr,
                "Epoch complete"
            );

            if best.map_or(true, |(_, b)| val_metrics.f1 > b.f1) {
                self.model
                    .save(&self.config.model_path)
                    .with_context(|| format!("Cannot save {}", self.config.model_path.display()))?;
                info!(epoch, f1 = val_metrics.f1, path = %self.config.model_path.display(), "Model saved");
                best = Some((epoch, val_metrics));
            }

            ctx.tracker_mut().log(
                epoch,
                &[
                    ("train/loss", report.train_loss),
                    ("train/acc", report.train_acc),
                    ("val/loss", val_metrics.loss),
                    ("val/f1", val_metrics.f1),
                    ("val/acc", val_metrics.accuracy),
                    ("lr", report.lr),
                ],
            )?;
            history.push(report);
        }

        let (best_epoch, best_metrics) = best.context("Training ran no epochs")?;
        info!(
            best_epoch,
            best_f1 = best_metrics.f1,
            best_acc = best_metrics.accuracy,
            elapsed = %format_duration(start.elapsed().as_secs()),
            "Training complete"
        );
        Ok(TrainOutcome {
            best_acc: best_metrics.accuracy,
            best_f1: best_metrics.f1,
            best_epoch,
            history,
        })
    }

    /// Backpropagate `loss` and step the optimiser.
    ///
    /// Returns `false` when the scaler found non-finite gradients and the
    /// step was skipped.
    fn backward_step(&mut self, loss: &Tensor) -> Result<bool> {
        match &mut self.scaler {
            Some(scaler) => {
                let mut grads = scaler.scale_loss(loss)?.backward()?;
                let found_inf = scaler.unscale(&mut grads, &self.vars)?;
                if !found_inf {
                    self.optimizer.step(&grads)?;
                }
                scaler.update(found_inf);
                Ok(!found_inf)
            }
            None => {
                let grads = loss.backward()?;
                self.optimizer.step(&grads)?;
                debug!(lr = self.optimizer.learning_rate(), "Optimizer step");
                Ok(true)
            }
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn progress_bar(total: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} [{elapsed_precise}] {prefix} {bar:40.cyan/blue} {pos}/{len} {msg}",
    )
    .map(|s| s.progress_chars("█▓░"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(label.to_string());
    pb
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
