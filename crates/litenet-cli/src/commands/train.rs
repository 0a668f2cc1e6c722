//! `litenet train` — train a classifier, optionally distilling from a teacher.
//!
//! ```text
//! litenet train \
//!   --model  configs/model/student.yaml \
//!   --data   configs/data/custom.yaml
//!
//! litenet train --distill-mode \
//!   --model              configs/model/student.yaml \
//!   --teacher-model      configs/model/teacher.yaml \
//!   --teacher-checkpoint exp/teacher/best.pt \
//!   --data               configs/data/custom.yaml
//! ```
//!
//! Outputs land in `SM_MODEL_DIR` (default `exp/latest`): `best.pt`,
//! `data.yml`, `model.yml` and `tracking.jsonl`.  A previous run found there
//! is moved to a timestamped sibling first.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use clap::Args;
use serde_json::json;
use tracing::info;

use litenet_core::{select_device, CheckpointOptions, FrozenModel, ModelConfig, TrainableModel};
use litenet_train::tracking::DEFAULT_PROJECT;
use litenet_train::{
    create_dataloaders, label_counts, Criterion, DistillCriterion, EvalResult, JsonlTracker, RunContext,
    TrainOutcome, Trainer, TrainerConfig,
};

use crate::config::{load_data_config, output_dir, DataConfig};
use crate::rundir::rotate_existing;

#[derive(Debug, Clone, Args)]
pub struct TrainArgs {
    /// Student model config (YAML).
    #[arg(long, default_value = "configs/model/student.yaml")]
    pub model: PathBuf,

    /// Teacher model config (YAML); used with --distill-mode.
    #[arg(long, default_value = "configs/model/teacher.yaml")]
    pub teacher_model: PathBuf,

    /// Teacher weights (safetensors); used with --distill-mode.
    #[arg(long, default_value = "exp/teacher/best.pt")]
    pub teacher_checkpoint: PathBuf,

    /// Train by knowledge distillation from the teacher.
    #[arg(long)]
    pub distill_mode: bool,

    /// Data config (YAML).
    #[arg(long, default_value = "configs/data/custom.yaml")]
    pub data: PathBuf,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Name recorded in the tracking session.
    #[arg(long, default_value = "exp")]
    pub run_name: String,

    /// Prefix stripped from teacher checkpoint keys before loading.
    #[arg(long, default_value = "head.")]
    pub teacher_key_prefix: String,

    /// Fail when the teacher checkpoint does not match the teacher
    /// architecture exactly.
    #[arg(long)]
    pub strict_teacher: bool,

    /// Force CPU even when an accelerator is available.
    #[arg(long)]
    pub cpu: bool,

    /// CUDA device ordinal.
    #[arg(long, default_value_t = 0)]
    pub cuda_device: usize,
}

/// Result of a finished run.
#[derive(Debug)]
pub struct TrainSummary {
    pub log_dir: PathBuf,
    pub outcome: TrainOutcome,
    /// Final evaluation of the best checkpoint on the held-out split.
    pub test: EvalResult,
}

// ── Main entry point ──────────────────────────────────────────────────────────

pub fn run(args: &TrainArgs, env: &dyn Fn(&str) -> Option<String>) -> Result<TrainSummary> {
    let model_cfg = ModelConfig::from_yaml_file(&args.model)
        .with_context(|| format!("Failed to load model config {}", args.model.display()))?;
    let data_cfg = load_data_config(&args.data, env)
        .with_context(|| format!("Failed to load data config {}", args.data.display()))?;
    data_cfg.validate()?;
    let teacher_cfg = if args.distill_mode {
        let cfg = ModelConfig::from_yaml_file(&args.teacher_model)
            .with_context(|| format!("Failed to load teacher config {}", args.teacher_model.display()))?;
        if !args.teacher_checkpoint.is_file() {
            bail!("Teacher checkpoint not found: {}", args.teacher_checkpoint.display());
        }
        Some(cfg)
    } else {
        None
    };

    // ── Output directory ──────────────────────────────────────────────────────
    let log_dir = output_dir(env);
    rotate_existing(&log_dir)?;
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Cannot create output directory {}", log_dir.display()))?;
    write_configs(&log_dir, &model_cfg, &data_cfg)?;

    // ── Data ──────────────────────────────────────────────────────────────────
    let device = select_device(!args.cpu, args.cuda_device, data_cfg.fp16)?;
    let splits = create_dataloaders(
        &data_cfg.data_path,
        model_cfg.input_channel,
        data_cfg.img_size,
        data_cfg.batch_size,
    )?;
    ensure!(
        model_cfg.num_classes() == splits.classes.len(),
        "Model predicts {} classes but the dataset has {} ({:?})",
        model_cfg.num_classes(),
        splits.classes.len(),
        splits.classes
    );
    let criterion = Criterion::for_dataset(&data_cfg.dataset, &label_counts(&data_cfg.data_path)?, &device)?;

    // ── Tracking ──────────────────────────────────────────────────────────────
    let tracker = JsonlTracker::create(&log_dir, DEFAULT_PROJECT, &args.run_name)?;
    let mut ctx = RunContext::new(args.seed, Box::new(tracker));
    ctx.tracker_mut()
        .update_config(&json!({ "model": model_cfg, "data": data_cfg }))?;

    // ── Train ─────────────────────────────────────────────────────────────────
    let model = TrainableModel::new(&model_cfg, data_cfg.img_size, &device, args.seed)?;
    let trainer_cfg = TrainerConfig::new(
        data_cfg.epochs,
        data_cfg.init_lr,
        data_cfg.fp16,
        log_dir.join("best.pt"),
    );
    let mut trainer = Trainer::new(model, trainer_cfg, splits.train.len())?;

    let outcome = if let Some(teacher_cfg) = &teacher_cfg {
        let opts = CheckpointOptions {
            key_prefix: args.teacher_key_prefix.clone(),
            strict: args.strict_teacher,
        };
        let (teacher, report) = FrozenModel::from_checkpoint(
            teacher_cfg,
            data_cfg.img_size,
            &args.teacher_checkpoint,
            &opts,
            &device,
            args.seed.wrapping_add(1),
        )?;
        info!(loaded = report.loaded.len(), clean = report.is_clean(), "Teacher ready");

        let kd = DistillCriterion::new(criterion.clone(), data_cfg.kd_temperature, data_cfg.kd_alpha)?;
        trainer.train_kd(&mut ctx, &splits.train, &splits.held_out, &teacher, &kd)?
    } else {
        trainer.train(&mut ctx, &splits.train, &splits.held_out, &criterion)?
    };

    // ── Final evaluation of the best checkpoint ───────────────────────────────
    trainer.reload_best()?;
    let test = trainer.test(&splits.held_out, &criterion)?;
    info!(
        split = splits.held_out_split,
        loss = test.loss,
        f1 = test.f1,
        acc = test.accuracy,
        "Best checkpoint evaluated"
    );
    ctx.tracker_mut().log(
        data_cfg.epochs + 1,
        &[("test/loss", test.loss), ("test/f1", test.f1), ("test/acc", test.accuracy)],
    )?;
    ctx.finish()?;

    Ok(TrainSummary { log_dir, outcome, test })
}

fn write_configs(log_dir: &Path, model_cfg: &ModelConfig, data_cfg: &DataConfig) -> Result<()> {
    let data_yml = log_dir.join("data.yml");
    fs::write(&data_yml, serde_yaml::to_string(data_cfg)?)
        .with_context(|| format!("Cannot write {}", data_yml.display()))?;
    let model_yml = log_dir.join("model.yml");
    fs::write(&model_yml, model_cfg.to_yaml_string()?)
        .with_context(|| format!("Cannot write {}", model_yml.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use candle_core::{Device, Tensor};
    use litenet_core::checkpoint::read_tensors;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const STUDENT: &str = "input_channel: 3\nbackbone:\n  - [1, Conv, [4, 3, 2]]\n  - [1, GlobalAvgPool, []]\n  - [1, Flatten, []]\n  - [1, Linear, [2]]\n";
    const TEACHER: &str = "input_channel: 3\nbackbone:\n  - [1, Conv, [8, 3, 1]]\n  - [1, MaxPool, [2]]\n  - [1, Conv, [8, 3, 1]]\n  - [1, GlobalAvgPool, []]\n  - [1, Flatten, []]\n  - [1, Linear, [2]]\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        out: PathBuf,
    }

    impl Fixture {
        /// 10 synthetic PNGs over two classes: 6 for training, 4 for test.
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let mut rng = StdRng::seed_from_u64(0);
            for (split, per_class) in [("train", 3), ("test", 2)] {
                for (class, base) in [("dark", 40u8), ("light", 210u8)] {
                    for i in 0..per_class {
                        let img = image::RgbImage::from_fn(8, 8, |_, _| {
                            let v = base.saturating_add(rng.gen_range(0..30));
                            image::Rgb([v, v, v])
                        });
                        let path = root.join("data").join(split).join(class).join(format!("{i}.png"));
                        fs::create_dir_all(path.parent().unwrap()).unwrap();
                        img.save(path).unwrap();
                    }
                }
            }
            fs::write(root.join("student.yaml"), STUDENT).unwrap();
            fs::write(root.join("teacher.yaml"), TEACHER).unwrap();
            fs::write(
                root.join("data.yaml"),
                format!("data_path: {}\nimg_size: 8\nbatch_size: 4\nepochs: 2\ninit_lr: 0.05\n", root.join("data").display()),
            )
            .unwrap();
            let out = root.join("exp").join("latest");
            Self { _dir: dir, root, out }
        }

        fn args(&self) -> TrainArgs {
            TrainArgs {
                model: self.root.join("student.yaml"),
                teacher_model: self.root.join("teacher.yaml"),
                teacher_checkpoint: self.root.join("teacher.pt"),
                distill_mode: false,
                data: self.root.join("data.yaml"),
                seed: 42,
                run_name: "exp".into(),
                teacher_key_prefix: "head.".into(),
                strict_teacher: false,
                cpu: true,
                cuda_device: 0,
            }
        }

        fn env(&self) -> impl Fn(&str) -> Option<String> + '_ {
            move |k: &str| (k == crate::config::ENV_MODEL_DIR).then(|| self.out.display().to_string())
        }

        /// Save a teacher whose keys all carry the `head.` prefix.
        fn write_prefixed_teacher(&self) {
            let cfg = ModelConfig::from_yaml_str(TEACHER).unwrap();
            let plain = self.root.join("teacher_plain.pt");
            TrainableModel::new(&cfg, 8, &Device::Cpu, 3).unwrap().save(&plain).unwrap();
            let prefixed: HashMap<String, Tensor> = read_tensors(&plain, &Device::Cpu)
                .unwrap()
                .into_iter()
                .map(|(k, v)| (format!("head.{k}"), v))
                .collect();
            candle_core::safetensors::save(&prefixed, self.root.join("teacher.pt")).unwrap();
        }
    }

    #[test]
    fn test_plain_training_end_to_end() {
        let fx = Fixture::new();
        let summary = run(&fx.args(), &fx.env()).unwrap();

        assert_eq!(summary.log_dir, fx.out);
        for file in ["best.pt", "data.yml", "model.yml", "tracking.jsonl"] {
            assert!(fx.out.join(file).is_file(), "missing {file}");
        }
        assert_eq!(summary.outcome.history.len(), 2);
        assert!(summary.test.loss.is_finite());
        assert!((0.0..=1.0).contains(&summary.test.f1));
        assert!((0.0..=1.0).contains(&summary.test.accuracy));

        let dumped = fs::read_to_string(fx.out.join("model.yml")).unwrap();
        assert_eq!(ModelConfig::from_yaml_str(&dumped).unwrap(), ModelConfig::from_yaml_str(STUDENT).unwrap());
    }

    #[test]
    fn test_final_evaluation_matches_best_epoch() {
        let fx = Fixture::new();
        let summary = run(&fx.args(), &fx.env()).unwrap();
        let best = &summary.outcome.history[summary.outcome.best_epoch - 1];
        assert!((summary.test.f1 - best.val.f1).abs() < 1e-9);
        assert!((summary.test.accuracy - summary.outcome.best_acc).abs() < 1e-9);
    }

    #[test]
    fn test_missing_teacher_checkpoint_fails_before_any_directory_work() {
        let fx = Fixture::new();
        let mut args = fx.args();
        args.distill_mode = true;
        let err = run(&args, &fx.env()).unwrap_err();
        assert!(err.to_string().contains("Teacher checkpoint not found"), "got: {err}");
        assert!(!fx.out.exists());
        assert!(!fx.root.join("exp").exists());
    }

    #[test]
    fn test_bad_teacher_config_leaves_previous_run_alone() {
        let fx = Fixture::new();
        fx.write_prefixed_teacher();
        fs::create_dir_all(&fx.out).unwrap();
        fs::write(fx.out.join("best.pt"), b"previous").unwrap();
        fs::write(fx.root.join("teacher.yaml"), "backbone: [unclosed").unwrap();

        let mut args = fx.args();
        args.distill_mode = true;
        let err = run(&args, &fx.env()).unwrap_err();
        assert!(err.to_string().contains("teacher config"), "got: {err}");

        let siblings: Vec<_> = fs::read_dir(fx.root.join("exp")).unwrap().collect();
        assert_eq!(siblings.len(), 1);
        let contents: Vec<_> = fs::read_dir(&fx.out).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(contents, vec![std::ffi::OsString::from("best.pt")]);
        assert_eq!(fs::read(fx.out.join("best.pt")).unwrap(), b"previous");
    }

    #[test]
    fn test_distillation_end_to_end_with_prefixed_teacher() {
        let fx = Fixture::new();
        fx.write_prefixed_teacher();
        let mut args = fx.args();
        args.distill_mode = true;
        args.strict_teacher = true;
        let summary = run(&args, &fx.env()).unwrap();
        assert!(fx.out.join("best.pt").is_file());
        assert!((0.0..=1.0).contains(&summary.test.f1));
    }

    #[test]
    fn test_wrong_prefix_fails_in_strict_mode() {
        let fx = Fixture::new();
        fx.write_prefixed_teacher();
        let mut args = fx.args();
        args.distill_mode = true;
        args.strict_teacher = true;
        args.teacher_key_prefix = "module.".into();
        assert!(run(&args, &fx.env()).is_err());
    }

    #[test]
    fn test_previous_run_is_rotated() {
        let fx = Fixture::new();
        run(&fx.args(), &fx.env()).unwrap();
        run(&fx.args(), &fx.env()).unwrap();
        let siblings: Vec<_> = fs::read_dir(fx.root.join("exp")).unwrap().collect();
        assert_eq!(siblings.len(), 2);
        assert!(fx.out.join("best.pt").is_file());
    }

    #[test]
    fn test_shipped_configs_are_valid() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        for data in ["custom", "taco"] {
            let cfg = load_data_config(&root.join(format!("configs/data/{data}.yaml")), &|_| None).unwrap();
            cfg.validate().unwrap();
        }
        for model in ["student", "teacher"] {
            let cfg = ModelConfig::from_yaml_file(&root.join(format!("configs/model/{model}.yaml"))).unwrap();
            let net = TrainableModel::new(&cfg, 32, &Device::Cpu, 0).unwrap();
            assert_eq!(net.num_classes(), 6);
        }
    }

    #[test]
    fn test_class_count_mismatch_is_rejected() {
        let fx = Fixture::new();
        fs::write(fx.root.join("student.yaml"), STUDENT.replace("[1, Linear, [2]]", "[1, Linear, [5]]")).unwrap();
        let err = run(&fx.args(), &fx.env()).unwrap_err();
        assert!(err.to_string().contains("classes"), "got: {err}");
    }
}
