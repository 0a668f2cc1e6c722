//! Output-directory rotation.
//!
//! A run always writes to the same directory (`exp/latest` by default).  If
//! it already holds a previous run, that directory is first renamed after the
//! modification time of its `best.pt` (or of the directory itself when no
//! checkpoint was written), e.g. `exp/2024-05-01_13-02-44`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::info;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Move an existing `log_dir` out of the way.
///
/// Returns the new location, or `None` when there was nothing to move.
pub fn rotate_existing(log_dir: &Path) -> Result<Option<PathBuf>> {
    if !log_dir.exists() {
        return Ok(None);
    }

    let stamp = previous_run_time(log_dir)?;
    let name = DateTime::<Local>::from(stamp).format(TIMESTAMP_FORMAT).to_string();
    let parent = match log_dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let target = unique_path(&parent, &name);

    fs::rename(log_dir, &target)
        .with_context(|| format!("Cannot move {} to {}", log_dir.display(), target.display()))?;
    info!(from = %log_dir.display(), to = %target.display(), "Rotated previous run directory");
    Ok(Some(target))
}

fn previous_run_time(log_dir: &Path) -> Result<SystemTime> {
    let checkpoint = log_dir.join("best.pt");
    let source = if checkpoint.is_file() { checkpoint } else { log_dir.to_path_buf() };
    fs::metadata(&source)
        .and_then(|m| m.modified())
        .with_context(|| format!("Cannot read modification time of {}", source.display()))
}

fn unique_path(parent: &Path, name: &str) -> PathBuf {
    let mut candidate = parent.join(name);
    let mut n = 1;
    while candidate.exists() {
        candidate = parent.join(format!("{name}_{n}"));
        n += 1;
    }
    candidate
}
