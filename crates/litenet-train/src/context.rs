//! Per-run state shared by the training routines.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::tracking::ExperimentTracker;

/// Seeded randomness and the tracking session of one run.
///
/// Data shuffling and augmentation draw from [`RunContext::rng_mut`], so a
/// fixed seed reproduces the run exactly.
pub struct RunContext {
    rng: StdRng,
    tracker: Box<dyn ExperimentTracker>,
}

impl RunContext {
    pub fn new(seed: u64, tracker: Box<dyn ExperimentTracker>) -> Self {
        Self { rng: StdRng::seed_from_u64(seed), tracker }
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn tracker_mut(&mut self) -> &mut dyn ExperimentTracker {
        self.tracker.as_mut()
    }

    /// Close the tracking session.
    pub fn finish(mut self) -> Result<()> {
        self.tracker.finish()
    }
}
