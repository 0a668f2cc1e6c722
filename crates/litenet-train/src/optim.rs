//! SGD with momentum.
//!
//! candle-nn ships plain SGD and AdamW; this adds the heavy-ball variant with
//! PyTorch's update rule:
//!
//! ```text
//! g   = grad + weight_decay · p
//! buf = g                       (first step)
//! buf = momentum · buf + g      (afterwards)
//! p   = p - lr · buf
//! ```
//!
//! Momentum is adjustable between steps so the one-cycle schedule can cycle it.

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::Optimizer;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self { lr: 0.1, momentum: 0.9, weight_decay: 0.0 }
    }
}

#[derive(Debug)]
struct VarState {
    var: Var,
    buf: Option<Tensor>,
}

#[derive(Debug)]
pub struct SgdMomentum {
    vars: Vec<VarState>,
    params: ParamsSgd,
}

impl SgdMomentum {
    pub fn momentum(&self) -> f64 {
        self.params.momentum
    }

    pub fn set_momentum(&mut self, momentum: f64) {
        self.params.momentum = momentum;
    }
}

impl Optimizer for SgdMomentum {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|v| v.dtype().is_float())
            .map(|var| VarState { var, buf: None })
            .collect();
        Ok(Self { vars, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let ParamsSgd { lr, momentum, weight_decay } = self.params;
        for state in self.vars.iter_mut() {
            let Some(grad) = grads.get(state.var.as_tensor()) else {
                continue;
            };
            let mut grad = grad.clone();
            if weight_decay != 0.0 {
                grad = (grad + (state.var.as_tensor() * weight_decay)?)?;
            }
            let direction = if momentum != 0.0 {
                let buf = match &state.buf {
                    Some(prev) => ((prev * momentum)? + &grad)?,
                    None => grad,
                };
                state.buf = Some(buf.clone());
                buf
            } else {
                grad
            };
            state.var.set(&state.var.as_tensor().sub(&(direction * lr)?)?)?;
        }
        Ok(())
    }
}
