//! Experiment tracking.
//!
//! A tracker receives the merged run configuration once and a set of named
//! scalars per step.  [`JsonlTracker`] appends one JSON object per event to
//! `<log_dir>/tracking.jsonl`:
//!
//! ```text
//! {"event":"init","project":"lightweight","run":"exp","time":"…"}
//! {"event":"config","config":{…},"time":"…"}
//! {"event":"log","step":1,"metrics":{"train/loss":0.69,…},"time":"…"}
//! {"event":"finish","time":"…"}
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

pub const DEFAULT_PROJECT: &str = "lightweight";
pub const TRACKING_FILE: &str = "tracking.jsonl";

/// Sink for run configuration and per-step scalar metrics.
///
/// Errors are returned to the caller; a failing sink aborts the run.
pub trait ExperimentTracker {
    fn update_config(&mut self, config: &Value) -> Result<()>;

    fn log(&mut self, step: usize, metrics: &[(&str, f64)]) -> Result<()>;

    fn finish(&mut self) -> Result<()>;
}

pub struct JsonlTracker {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlTracker {
    /// Open `<log_dir>/tracking.jsonl` for appending and record the run start.
    pub fn create(log_dir: &Path, project: &str, run_name: &str) -> Result<Self> {
        let path = log_dir.join(TRACKING_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Cannot open tracking file {}", path.display()))?;
        let mut tracker = Self { path, writer: BufWriter::new(file) };
        tracker.write(json!({ "event": "init", "project": project, "run": run_name }))?;
        info!(path = %tracker.path.display(), project, run = run_name, "Experiment tracking started");
        Ok(tracker)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, mut record: Value) -> Result<()> {
        if let Value::Object(map) = &mut record {
            map.insert("time".into(), Value::String(chrono::Local::now().to_rfc3339()));
        }
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer
            .flush()
            .with_context(|| format!("Cannot write tracking file {}", self.path.display()))
    }
}

impl ExperimentTracker for JsonlTracker {
    fn update_config(&mut self, config: &Value) -> Result<()> {
        self.write(json!({ "event": "config", "config": config }))
    }

    fn log(&mut self, step: usize, metrics: &[(&str, f64)]) -> Result<()> {
        let mut values = Map::new();
        for &(key, value) in metrics {
            debug!(step, key, value, "metric");
            values.insert(key.to_string(), json!(value));
        }
        self.write(json!({ "event": "log", "step": step, "metrics": values }))
    }

    fn finish(&mut self) -> Result<()> {
        self.write(json!({ "event": "finish" }))
    }
}
