//! One-cycle learning-rate schedule, stepped once per batch.
//!
//! Two cosine phases: warm up from `max_lr / div_factor` to `max_lr` over the
//! first `pct_start` of the run, then anneal to
//! `max_lr / (div_factor · final_div_factor)`.  Momentum moves the opposite
//! way between `max_momentum` and `base_momentum`.

use std::f64::consts::PI;

use anyhow::{ensure, Result};
use candle_nn::Optimizer;

use crate::optim::SgdMomentum;

#[derive(Debug, Clone, Copy)]
struct Phase {
    end_step: f64,
    lr: (f64, f64),
    momentum: (f64, f64),
}

#[derive(Debug, Clone)]
pub struct OneCycleLr {
    phases: [Phase; 2],
    total_steps: usize,
    step: usize,
}

impl OneCycleLr {
    pub const PCT_START: f64 = 0.05;
    pub const DIV_FACTOR: f64 = 25.0;
    pub const FINAL_DIV_FACTOR: f64 = 1e4;
    pub const BASE_MOMENTUM: f64 = 0.85;
    pub const MAX_MOMENTUM: f64 = 0.95;

    pub fn new(max_lr: f64, steps_per_epoch: usize, epochs: usize, pct_start: f64) -> Result<Self> {
        let total_steps = steps_per_epoch * epochs;
        ensure!(total_steps > 0, "One-cycle schedule needs at least one step");
        ensure!(max_lr > 0.0, "max_lr must be > 0 (got {max_lr})");
        ensure!(pct_start > 0.0 && pct_start < 1.0, "pct_start must be in (0, 1) (got {pct_start})");

        let initial_lr = max_lr / Self::DIV_FACTOR;
        let min_lr = initial_lr / Self::FINAL_DIV_FACTOR;
        let phases = [
            Phase {
                end_step: pct_start * total_steps as f64 - 1.0,
                lr: (initial_lr, max_lr),
                momentum: (Self::MAX_MOMENTUM, Self::BASE_MOMENTUM),
            },
            Phase {
                end_step: total_steps as f64 - 1.0,
                lr: (max_lr, min_lr),
                momentum: (Self::BASE_MOMENTUM, Self::MAX_MOMENTUM),
            },
        ];
        Ok(Self { phases, total_steps, step: 0 })
    }

    /// `(lr, momentum)` at `step`; steps past the end stay at the final value.
    pub fn values_at(&self, step: usize) -> (f64, f64) {
        let step = step as f64;
        let [warmup, anneal] = &self.phases;
        let (start, phase) = if step <= warmup.end_step { (0.0, warmup) } else { (warmup.end_step, anneal) };
        let span = phase.end_step - start;
        let pct = if span > 0.0 { ((step - start) / span).min(1.0) } else { 1.0 };
        (
            anneal_cos(phase.lr.0, phase.lr.1, pct),
            anneal_cos(phase.momentum.0, phase.momentum.1, pct),
        )
    }

    pub fn current_step(&self) -> usize {
        self.step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Write the current values into the optimiser.
    pub fn apply(&self, opt: &mut SgdMomentum) {
        let (lr, momentum) = self.values_at(self.step);
        opt.set_learning_rate(lr);
        opt.set_momentum(momentum);
    }

    /// Advance one batch and update the optimiser.
    pub fn step(&mut self, opt: &mut SgdMomentum) {
        self.step += 1;
        self.apply(opt);
    }
}

fn anneal_cos(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * ((PI * pct).cos() + 1.0)
}
