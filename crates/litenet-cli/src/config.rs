use std::path::{Path, PathBuf};

use anyhow::{ensure, Result};
use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};

/// Overrides the dataset location in the data config.
pub const ENV_DATA_PATH: &str = "SM_CHANNEL_TRAIN";
/// Overrides the run output directory.
pub const ENV_MODEL_DIR: &str = "SM_MODEL_DIR";
pub const DEFAULT_OUTPUT_DIR: &str = "exp/latest";

/// Training hyper-parameters and dataset location.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DataConfig {
    /// Dataset identifier; `TACO` enables class-balanced loss weights.
    pub dataset: String,
    pub data_path: PathBuf,
    pub img_size: usize,
    pub batch_size: usize,
    /// Peak learning rate of the one-cycle schedule.
    pub init_lr: f64,
    pub epochs: usize,
    pub fp16: bool,
    pub kd_temperature: f64,
    pub kd_alpha: f64,
}

impl DataConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.img_size > 0, "img_size must be > 0");
        ensure!(self.batch_size > 0, "batch_size must be > 0");
        ensure!(self.epochs > 0, "epochs must be > 0");
        ensure!(self.init_lr > 0.0, "init_lr must be > 0 (got {})", self.init_lr);
        Ok(())
    }
}

/// Load the data config from:
/// 1. Built-in defaults
/// 2. The YAML file at `path` (required)
/// 3. `SM_CHANNEL_TRAIN`, which replaces `data_path`
///
/// `env` looks up environment variables so callers can inject them.
pub fn load_data_config(path: &Path, env: &dyn Fn(&str) -> Option<String>) -> Result<DataConfig, ConfigError> {
    Config::builder()
        // Layer 1: defaults baked in
        .set_default("dataset", "CUSTOM")?
        .set_default("img_size", 32_i64)?
        .set_default("batch_size", 32_i64)?
        .set_default("init_lr", 0.1)?
        .set_default("epochs", 10_i64)?
        .set_default("fp16", false)?
        .set_default("kd_temperature", 4.0)?
        .set_default("kd_alpha", 0.5)?
        // Layer 2: the run's data file
        .add_source(File::from(path).required(true))
        // Layer 3: platform override of the dataset location
        .set_override_option("data_path", env(ENV_DATA_PATH))?
        .build()?
        .try_deserialize()
}

/// Run output directory: `SM_MODEL_DIR` or `exp/latest`.
pub fn output_dir(env: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    env(ENV_MODEL_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
}
