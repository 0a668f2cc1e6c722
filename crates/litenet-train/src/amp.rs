//! Dynamic loss scaling for F16 training.
//!
//! The loss is multiplied by the current scale before `backward()`; the
//! resulting gradients are divided by it again before the optimiser step.
//! Any inf/NaN after unscaling skips the step and halves the scale; a run of
//! `growth_interval` clean steps doubles it.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    clean_steps: usize,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(65536.0, 2.0, 0.5, 2000)
    }
}

impl GradScaler {
    pub fn new(init_scale: f64, growth_factor: f64, backoff_factor: f64, growth_interval: usize) -> Self {
        Self { scale: init_scale, growth_factor, backoff_factor, growth_interval, clean_steps: 0 }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        Ok((loss * self.scale)?)
    }

    /// Divide the gradients of `vars` by the scale in place.
    ///
    /// Returns `true` when any of them holds a non-finite value.
    pub fn unscale(&self, grads: &mut GradStore, vars: &[Var]) -> Result<bool> {
        let inv = 1.0 / self.scale;
        let mut found_inf = false;
        for var in vars {
            let Some(grad) = grads.remove(var.as_tensor()) else {
                continue;
            };
            let grad = (grad.to_dtype(DType::F32)? * inv)?;
            // inf and NaN both poison the sum
            if !grad.sum_all()?.to_scalar::<f32>()?.is_finite() {
                found_inf = true;
            }
            grads.insert(var.as_tensor(), grad);
        }
        Ok(found_inf)
    }

    /// Adjust the scale after a step attempt.
    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.scale *= self.backoff_factor;
            self.clean_steps = 0;
            debug!(scale = self.scale, "Gradient overflow; step skipped, scale reduced");
        } else {
            self.clean_steps += 1;
            if self.clean_steps >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.clean_steps = 0;
                debug!(scale = self.scale, "Loss scale increased");
            }
        }
    }
}
