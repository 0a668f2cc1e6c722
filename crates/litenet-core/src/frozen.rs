//! Frozen, inference-only model handle.
//!
//! A [`FrozenModel`] is rebuilt over plain tensors (no [`candle_core::Var`]),
//! so nothing can hand its parameters to an optimiser and every output is
//! detached from the autograd graph.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::{info, warn};

use crate::checkpoint::{load_permissive, read_tensors, strip_key_prefix, LoadReport};
use crate::error::{CoreError, CoreResult};
use crate::init::seeded_init;
use crate::model::ModelConfig;
use crate::network::Network;

/// How to read a checkpoint produced by another pipeline.
#[derive(Debug, Clone)]
pub struct CheckpointOptions {
    /// Prefix removed from the front of checkpoint keys before matching.
    pub key_prefix: String,
    /// Fail on any missing or unexpected key instead of warning.
    pub strict: bool,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self { key_prefix: "head.".to_string(), strict: false }
    }
}

/// A classifier whose parameters never change after loading.
pub struct FrozenModel {
    net: Network,
    params: HashMap<String, Tensor>,
}

impl FrozenModel {
    /// Materialise a frozen model from a checkpoint file.
    ///
    /// The raw mapping is read, `opts.key_prefix` is stripped from every key,
    /// and matching entries are copied over a seeded initialisation.
    /// Parameters the checkpoint lacks keep their initial value.
    pub fn from_checkpoint(
        cfg: &ModelConfig,
        img_size: usize,
        path: &Path,
        opts: &CheckpointOptions,
        device: &Device,
        seed: u64,
    ) -> CoreResult<(Self, LoadReport)> {
        info!(path = %path.display(), prefix = %opts.key_prefix, "Loading frozen model");

        let varmap = VarMap::new();
        Network::new(cfg, img_size, VarBuilder::from_varmap(&varmap, DType::F32, device))?;
        seeded_init(&varmap, seed)?;

        let raw = read_tensors(path, device)?;
        let tensors = strip_key_prefix(raw, &opts.key_prefix);
        let report = load_permissive(&varmap, &tensors, opts.strict)?;
        if !report.is_clean() {
            warn!(
                missing = report.missing.len(),
                unexpected = report.unexpected.len(),
                "Frozen model checkpoint did not match the architecture exactly"
            );
        }

        let params = detach_all(&varmap)?;
        let model = Self::from_tensors(cfg, img_size, params, device)?;
        Ok((model, report))
    }

    /// Build directly over an in-memory parameter map (every key required).
    pub fn from_tensors(
        cfg: &ModelConfig,
        img_size: usize,
        params: HashMap<String, Tensor>,
        device: &Device,
    ) -> CoreResult<Self> {
        let vb = VarBuilder::from_tensors(params.clone(), DType::F32, device);
        let net = Network::new(cfg, img_size, vb)?;
        Ok(Self { net, params })
    }

    /// Logits `[B, num_classes]` in F32, detached from any graph.
    pub fn logits(&self, xs: &Tensor, compute: Option<DType>) -> CoreResult<Tensor> {
        Ok(self.net.forward(xs, compute)?.detach())
    }

    /// Read-only view of the parameters.
    pub fn parameters(&self) -> &HashMap<String, Tensor> {
        &self.params
    }

    pub fn num_classes(&self) -> usize {
        self.net.num_classes()
    }
}

/// Copy every variable into fresh, non-variable storage.
fn detach_all(varmap: &VarMap) -> CoreResult<HashMap<String, Tensor>> {
    let data = varmap.data().lock().map_err(|_| CoreError::LockPoisoned)?;
    data.iter()
        .map(|(k, v)| Ok((k.clone(), v.as_tensor().copy()?.detach())))
        .collect()
}
