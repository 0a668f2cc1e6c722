//! Trainable model handle.
//!
//! The network's parameters live in a [`VarMap`] so they can receive
//! gradients and be updated by an optimiser.  This is the only handle that
//! hands out [`Var`]s.

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::init::seeded_init;
use crate::model::ModelConfig;
use crate::network::Network;

/// A classifier whose parameters are trained in place.
pub struct TrainableModel {
    net: Network,
    varmap: VarMap,
    device: Device,
}

impl TrainableModel {
    /// Build the network described by `cfg` with seeded random weights.
    pub fn new(cfg: &ModelConfig, img_size: usize, device: &Device, seed: u64) -> CoreResult<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = Network::new(cfg, img_size, vb)?;
        seeded_init(&varmap, seed)?;

        let model = Self { net, varmap, device: device.clone() };
        info!(
            layers = model.net.num_layers(),
            params = model.num_parameters()?,
            classes = model.net.num_classes(),
            "Trainable model initialised"
        );
        Ok(model)
    }

    /// Logits `[B, num_classes]` in F32, tracked for backprop.
    ///
    /// `compute` selects a reduced-precision dtype for the forward pass.
    pub fn forward(&self, xs: &Tensor, compute: Option<DType>) -> CoreResult<Tensor> {
        self.net.forward(xs, compute)
    }

    /// All trainable variables, sorted by parameter name.
    pub fn trainable_vars(&self) -> CoreResult<Vec<Var>> {
        let data = self.varmap.data().lock().map_err(|_| CoreError::LockPoisoned)?;
        let mut named: Vec<(&String, &Var)> = data.iter().collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        Ok(named.into_iter().map(|(_, v)| v.clone()).collect())
    }

    pub fn num_parameters(&self) -> CoreResult<usize> {
        let data = self.varmap.data().lock().map_err(|_| CoreError::LockPoisoned)?;
        Ok(data.values().map(|v| v.as_tensor().elem_count()).sum())
    }

    pub fn num_classes(&self) -> usize {
        self.net.num_classes()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Save all parameters to a safetensors file at `path`.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Overwrite all parameters from a checkpoint written by [`save`](Self::save).
    ///
    /// Every parameter must be present in the file; extra entries are ignored.
    pub fn load(&mut self, path: &Path) -> CoreResult<()> {
        self.varmap.load(path)?;
        info!(path = %path.display(), "Trainable model weights reloaded");
        Ok(())
    }
}
