//! Classification metrics.

use std::collections::BTreeSet;

use anyhow::Result;
use candle_core::{Tensor, D};
use serde::Serialize;

/// Loss, macro F1 and accuracy of one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalResult {
    pub loss: f64,
    pub f1: f64,
    pub accuracy: f64,
}

/// Fraction of predictions equal to their label; 0 for no samples.
pub fn accuracy(preds: &[u32], labels: &[u32]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = preds.iter().zip(labels).filter(|(p, l)| p == l).count();
    correct as f64 / labels.len() as f64
}

/// Unweighted mean of per-class F1 over every class that occurs in either
/// `labels` or `preds`.  A class with zero precision and recall scores 0.
pub fn macro_f1(preds: &[u32], labels: &[u32]) -> f64 {
    let classes: BTreeSet<u32> = preds.iter().chain(labels).copied().collect();
    if classes.is_empty() {
        return 0.0;
    }
    let total: f64 = classes
        .iter()
        .map(|&c| {
            let tp = preds.iter().zip(labels).filter(|&(&p, &l)| p == c && l == c).count();
            let fp = preds.iter().zip(labels).filter(|&(&p, &l)| p == c && l != c).count();
            let fn_ = preds.iter().zip(labels).filter(|&(&p, &l)| p != c && l == c).count();
            let denom = 2 * tp + fp + fn_;
            if denom == 0 {
                0.0
            } else {
                2.0 * tp as f64 / denom as f64
            }
        })
        .sum();
    total / classes.len() as f64
}

/// Collects per-batch losses and predictions over one pass.
#[derive(Debug, Default)]
pub struct MetricAccumulator {
    loss_sum: f64,
    preds: Vec<u32>,
    labels: Vec<u32>,
}

impl MetricAccumulator {
    /// Record one batch; `loss` is the batch mean and is weighted by the
    /// batch size.
    pub fn update(&mut self, loss: f64, logits: &Tensor, labels: &Tensor) -> Result<()> {
        let preds: Vec<u32> = logits.argmax(D::Minus1)?.to_vec1()?;
        let labels: Vec<u32> = labels.to_vec1()?;
        self.loss_sum += loss * labels.len() as f64;
        self.preds.extend(preds);
        self.labels.extend(labels);
        Ok(())
    }

    pub fn num_samples(&self) -> usize {
        self.labels.len()
    }

    pub fn finish(&self) -> EvalResult {
        let n = self.labels.len();
        EvalResult {
            loss: if n == 0 { 0.0 } else { self.loss_sum / n as f64 },
            f1: macro_f1(&self.preds, &self.labels),
            accuracy: accuracy(&self.preds, &self.labels),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn accuracy_counts_matches() {
        assert_eq!(accuracy(&[0, 1, 1, 2], &[0, 1, 2, 2]), 0.75);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn macro_f1_matches_sklearn() {
        // sklearn.metrics.f1_score([0,1,2,0,1,2], [0,2,1,0,0,1], average="macro") == 0.2666…
        let labels = [0, 1, 2, 0, 1, 2];
        let preds = [0, 2, 1, 0, 0, 1];
        assert!((macro_f1(&preds, &labels) - 0.8 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn macro_f1_includes_predicted_only_classes() {
        // class 1 never occurs in the labels but is predicted: its F1 is 0
        assert!((macro_f1(&[0, 1], &[0, 0]) - (2.0 / 3.0) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn perfect_predictions_score_one() {
        assert_eq!(macro_f1(&[3, 1, 3], &[3, 1, 3]), 1.0);
    }

    #[test]
    fn accumulator_weights_loss_by_batch_size() {
        let dev = Device::Cpu;
        let mut acc = MetricAccumulator::default();
        let logits = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0], [1.0, 0.0]], &dev).unwrap();
        acc.update(1.0, &logits, &Tensor::new(&[0u32, 1, 1], &dev).unwrap()).unwrap();
        let logits = Tensor::new(&[[0.0f32, 1.0]], &dev).unwrap();
        acc.update(3.0, &logits, &Tensor::new(&[1u32], &dev).unwrap()).unwrap();
        let r = acc.finish();
        assert_eq!(acc.num_samples(), 4);
        assert!((r.loss - 1.5).abs() < 1e-12);
        assert_eq!(r.accuracy, 0.75);
    }
}
