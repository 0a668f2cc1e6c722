//! Checkpoint I/O.
//!
//! Checkpoints are safetensors files mapping parameter names to tensors.
//! Checkpoints produced by other pipelines may carry an extra name prefix;
//! [`strip_key_prefix`] normalises them before [`load_permissive`] copies
//! whatever matches into a `VarMap`.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};

/// Outcome of a permissive load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Model parameters that received a value from the checkpoint.
    pub loaded: Vec<String>,
    /// Model parameters the checkpoint did not provide (left at their init).
    pub missing: Vec<String>,
    /// Checkpoint entries with no matching model parameter (ignored).
    pub unexpected: Vec<String>,
}

impl LoadReport {
    /// `true` when every parameter was matched in both directions.
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Read every tensor of a safetensors file onto `device`.
pub fn read_tensors(path: &Path, device: &Device) -> CoreResult<HashMap<String, Tensor>> {
    let tensors = candle_core::safetensors::load(path, device)?;
    debug!(path = %path.display(), tensors = tensors.len(), "Read checkpoint");
    Ok(tensors)
}

/// Remove `prefix` from the front of every key that starts with it.
///
/// Keys without the prefix are kept unchanged.  An empty prefix is a no-op.
pub fn strip_key_prefix(tensors: HashMap<String, Tensor>, prefix: &str) -> HashMap<String, Tensor> {
    if prefix.is_empty() {
        return tensors;
    }
    tensors
        .into_iter()
        .map(|(k, v)| match k.strip_prefix(prefix) {
            Some(stripped) => (stripped.to_string(), v),
            None => (k, v),
        })
        .collect()
}

/// Copy matching `tensors` into `varmap`.
///
/// Missing and unexpected keys are tolerated and listed in the returned
/// report, each one logged at `warn` level.  A key present on both sides with
/// a different shape is always an error.  With `strict`, any missing or
/// unexpected key is an error as well.
pub fn load_permissive(
    varmap: &VarMap,
    tensors: &HashMap<String, Tensor>,
    strict: bool,
) -> CoreResult<LoadReport> {
    let data = varmap.data().lock().map_err(|_| CoreError::LockPoisoned)?;

    let model_keys: BTreeSet<&String> = data.keys().collect();
    let mut report = LoadReport::default();

    for name in &model_keys {
        let var = &data[*name];
        match tensors.get(*name) {
            Some(value) => {
                if value.dims() != var.as_tensor().dims() {
                    return Err(CoreError::ShapeMismatch {
                        key: (*name).clone(),
                        expected: var.as_tensor().dims().to_vec(),
                        actual: value.dims().to_vec(),
                    });
                }
                let value = value
                    .to_dtype(var.as_tensor().dtype())?
                    .to_device(var.as_tensor().device())?;
                var.set(&value)?;
                report.loaded.push((*name).clone());
            }
            None => report.missing.push((*name).clone()),
        }
    }

    let mut unexpected: Vec<String> = tensors
        .keys()
        .filter(|k| !model_keys.contains(k))
        .cloned()
        .collect();
    unexpected.sort();
    report.unexpected = unexpected;

    for key in &report.missing {
        warn!(key = %key, "Parameter missing from checkpoint; keeping initial value");
    }
    for key in &report.unexpected {
        warn!(key = %key, "Checkpoint entry has no matching parameter; ignored");
    }

    if strict && !report.is_clean() {
        return Err(CoreError::StrictLoad {
            missing: report.missing.len(),
            unexpected: report.unexpected.len(),
        });
    }

    info!(
        loaded = report.loaded.len(),
        missing = report.missing.len(),
        unexpected = report.unexpected.len(),
        "Checkpoint applied"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};

    fn two_param_varmap() -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((2, 2), "l.weight", Init::Const(0.)).unwrap();
        vb.get_with_hints(2, "l.bias", Init::Const(0.)).unwrap();
        varmap
    }

    fn full(shape: &[usize], v: f32) -> Tensor {
        Tensor::full(v, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn strip_prefix_only_touches_leading_occurrence() {
        let mut m = HashMap::new();
        m.insert("head.l.weight".to_string(), full(&[1], 0.0));
        m.insert("l.head.bias".to_string(), full(&[1], 0.0));
        let out = strip_key_prefix(m, "head.");
        let mut keys: Vec<_> = out.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["l.head.bias".to_string(), "l.weight".to_string()]);
    }

    #[test]
    fn prefixed_checkpoint_loads_cleanly_after_strip() {
        let varmap = two_param_varmap();
        let mut m = HashMap::new();
        m.insert("head.l.weight".to_string(), full(&[2, 2], 1.5));
        m.insert("head.l.bias".to_string(), full(&[2], -1.0));
        let report = load_permissive(&varmap, &strip_key_prefix(m, "head."), true).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.loaded.len(), 2);

        let data = varmap.data().lock().unwrap();
        let w: Vec<f32> = data["l.weight"].as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(w, vec![1.5; 4]);
    }

    #[test]
    fn permissive_load_reports_missing_and_unexpected() {
        let varmap = two_param_varmap();
        let mut m = HashMap::new();
        m.insert("l.weight".to_string(), full(&[2, 2], 1.0));
        m.insert("extra.running_mean".to_string(), full(&[3], 0.0));
        let report = load_permissive(&varmap, &m, false).unwrap();
        assert_eq!(report.missing, vec!["l.bias".to_string()]);
        assert_eq!(report.unexpected, vec!["extra.running_mean".to_string()]);
        assert!(!report.is_clean());
    }

    #[test]
    fn strict_load_rejects_mismatched_key_sets() {
        let varmap = two_param_varmap();
        let mut m = HashMap::new();
        m.insert("l.weight".to_string(), full(&[2, 2], 1.0));
        let err = load_permissive(&varmap, &m, true).unwrap_err();
        assert!(matches!(err, CoreError::StrictLoad { missing: 1, unexpected: 0 }));
    }

    #[test]
    fn shape_mismatch_is_an_error_even_when_permissive() {
        let varmap = two_param_varmap();
        let mut m = HashMap::new();
        m.insert("l.weight".to_string(), full(&[3, 2], 1.0));
        let err = load_permissive(&varmap, &m, false).unwrap_err();
        assert!(matches!(err, CoreError::ShapeMismatch { .. }));
    }

    #[test]
    fn read_tensors_round_trips_varmap_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.pt");
        let varmap = two_param_varmap();
        varmap.save(&path).unwrap();
        let tensors = read_tensors(&path, &Device::Cpu).unwrap();
        assert!(tensors.contains_key("l.weight"));
        assert!(tensors.contains_key("l.bias"));
    }
}
