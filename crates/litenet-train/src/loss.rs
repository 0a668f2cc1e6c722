//! Training criteria.
//!
//! [`Criterion`] is (optionally class-weighted) cross-entropy over logits.
//! [`DistillCriterion`] blends it with the temperature-softened KL divergence
//! between teacher and student:
//!
//! ```text
//! L = (1 - α) · CE_w(student, labels) + α · T² · KL(softmax(t/T) ‖ softmax(s/T))
//! ```

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::log_softmax;

/// β used for class-balanced weights.
pub const CLASS_BALANCE_BETA: f64 = 0.9999;

/// Class-balanced weights from the effective number of samples per class,
/// `w_c ∝ (1 - β) / (1 - β^n_c)`, normalised so the weights sum to the
/// number of classes.  Empty classes are treated as holding one sample.
pub fn class_balanced_weights(counts: &[usize], beta: f64) -> Vec<f32> {
    let raw: Vec<f64> = counts
        .iter()
        .map(|&n| (1.0 - beta) / (1.0 - beta.powi(n.max(1) as i32)))
        .collect();
    let sum: f64 = raw.iter().sum();
    let k = counts.len() as f64;
    raw.iter().map(|w| (w / sum * k) as f32).collect()
}

// ── Hard-label loss ───────────────────────────────────────────────────────────

/// Cross-entropy against ground-truth labels.
///
/// With class weights the mean is taken over the summed weights of the
/// batch's labels, matching a weighted `CrossEntropyLoss`.
#[derive(Debug, Clone, Default)]
pub struct Criterion {
    class_weights: Option<Tensor>,
}

impl Criterion {
    pub fn unweighted() -> Self {
        Self::default()
    }

    pub fn weighted(weights: &[f32], device: &Device) -> Result<Self> {
        ensure!(!weights.is_empty(), "Class weights must not be empty");
        Ok(Self { class_weights: Some(Tensor::from_slice(weights, weights.len(), device)?) })
    }

    /// Pick the criterion for a dataset: class-balanced for `TACO`, plain
    /// cross-entropy otherwise.
    pub fn for_dataset(dataset: &str, samples_per_class: &[usize], device: &Device) -> Result<Self> {
        if dataset == "TACO" {
            Self::weighted(&class_balanced_weights(samples_per_class, CLASS_BALANCE_BETA), device)
        } else {
            Ok(Self::unweighted())
        }
    }

    pub fn is_weighted(&self) -> bool {
        self.class_weights.is_some()
    }

    /// Scalar loss for `[B, K]` logits and `[B]` u32 labels.
    pub fn loss(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let logits = logits.to_dtype(DType::F32)?;
        let log_probs = log_softmax(&logits, D::Minus1)?;
        let picked = log_probs
            .gather(&labels.unsqueeze(1)?, 1)?
            .squeeze(1)?
            .neg()?;
        let loss = match &self.class_weights {
            None => picked.mean_all()?,
            Some(weights) => {
                ensure!(
                    weights.dim(0)? == logits.dim(1)?,
                    "Criterion has {} class weights but logits have {} classes",
                    weights.dim(0)?,
                    logits.dim(1)?
                );
                let w = weights.index_select(labels, 0)?;
                ((picked * &w)?.sum_all()? / w.sum_all()?)?
            }
        };
        Ok(loss)
    }
}

// ── Distillation loss ─────────────────────────────────────────────────────────

/// Hard-label loss blended with the softened teacher/student KL divergence.
#[derive(Debug, Clone)]
pub struct DistillCriterion {
    hard: Criterion,
    temperature: f64,
    alpha: f64,
}

impl DistillCriterion {
    pub fn new(hard: Criterion, temperature: f64, alpha: f64) -> Result<Self> {
        ensure!(temperature > 0.0, "kd_temperature must be > 0 (got {temperature})");
        ensure!((0.0..=1.0).contains(&alpha), "kd_alpha must be in [0, 1] (got {alpha})");
        Ok(Self { hard, temperature, alpha })
    }

    /// The hard-label part, also used for validation and test passes.
    pub fn hard(&self) -> &Criterion {
        &self.hard
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn loss(&self, student: &Tensor, teacher: &Tensor, labels: &Tensor) -> Result<Tensor> {
        ensure!(
            student.dims() == teacher.dims(),
            "Student logits {:?} and teacher logits {:?} differ in shape",
            student.dims(),
            teacher.dims()
        );
        let hard = self.hard.loss(student, labels)?;
        let soft = self.soft_loss(student, teacher)?;
        let t2 = self.temperature * self.temperature;
        Ok(((hard * (1.0 - self.alpha))? + (soft * (self.alpha * t2))?)?)
    }

    /// `KL(softmax(t/T) ‖ softmax(s/T))`, summed over classes and averaged
    /// over the batch.
    fn soft_loss(&self, student: &Tensor, teacher: &Tensor) -> Result<Tensor> {
        let batch = student.dim(0)?.max(1) as f64;
        let log_s = log_softmax(&(student.to_dtype(DType::F32)? / self.temperature)?, D::Minus1)?;
        let log_t = log_softmax(&(teacher.to_dtype(DType::F32)? / self.temperature)?, D::Minus1)?;
        let kl = (log_t.exp()? * (log_t - log_s)?)?.sum_all()?;
        Ok((kl / batch)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    fn logits() -> Tensor {
        Tensor::new(&[[2.0f32, 0.0, -1.0], [0.5, 1.5, 0.0]], &Device::Cpu).unwrap()
    }

    fn labels() -> Tensor {
        Tensor::new(&[0u32, 2], &Device::Cpu).unwrap()
    }

    fn reference_ce(row: &[f32], label: usize) -> f32 {
        let lse = row.iter().map(|v| v.exp()).sum::<f32>().ln();
        lse - row[label]
    }

    #[test]
    fn unweighted_cross_entropy_matches_reference() {
        let loss = Criterion::unweighted().loss(&logits(), &labels()).unwrap();
        let expected = (reference_ce(&[2.0, 0.0, -1.0], 0) + reference_ce(&[0.5, 1.5, 0.0], 2)) / 2.0;
        assert!((scalar(&loss) - expected).abs() < 1e-5);
    }

    #[test]
    fn weighted_cross_entropy_uses_label_weights() {
        let c = Criterion::weighted(&[1.0, 1.0, 3.0], &Device::Cpu).unwrap();
        let loss = c.loss(&logits(), &labels()).unwrap();
        let a = reference_ce(&[2.0, 0.0, -1.0], 0);
        let b = reference_ce(&[0.5, 1.5, 0.0], 2);
        let expected = (a + 3.0 * b) / 4.0;
        assert!((scalar(&loss) - expected).abs() < 1e-5);
    }

    #[test]
    fn class_balanced_weights_sum_to_class_count_and_favour_rare_classes() {
        let w = class_balanced_weights(&[1000, 10, 0], CLASS_BALANCE_BETA);
        let sum: f32 = w.iter().sum();
        assert!((sum - 3.0).abs() < 1e-4);
        assert!(w[1] > w[0]);
        assert!(w.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn only_taco_gets_weighted_criterion() {
        let counts = [5, 50];
        assert!(Criterion::for_dataset("TACO", &counts, &Device::Cpu).unwrap().is_weighted());
        assert!(!Criterion::for_dataset("CUSTOM", &counts, &Device::Cpu).unwrap().is_weighted());
    }

    #[test]
    fn identical_logits_leave_only_hard_term() {
        let kd = DistillCriterion::new(Criterion::unweighted(), 4.0, 0.5).unwrap();
        let ce = scalar(&Criterion::unweighted().loss(&logits(), &labels()).unwrap());
        let loss = scalar(&kd.loss(&logits(), &logits(), &labels()).unwrap());
        assert!((loss - 0.5 * ce).abs() < 1e-5);
    }

    #[test]
    fn soft_term_matches_reference_kl() {
        let kd = DistillCriterion::new(Criterion::unweighted(), 2.0, 1.0).unwrap();
        let s = Tensor::new(&[[1.0f32, 0.0]], &Device::Cpu).unwrap();
        let t = Tensor::new(&[[0.0f32, 1.0]], &Device::Cpu).unwrap();
        let y = Tensor::new(&[0u32], &Device::Cpu).unwrap();
        let loss = scalar(&kd.loss(&s, &t, &y).unwrap());

        let softmax = |a: f32, b: f32| {
            let (ea, eb) = ((a / 2.0).exp(), (b / 2.0).exp());
            [ea / (ea + eb), eb / (ea + eb)]
        };
        let ps = softmax(1.0, 0.0);
        let pt = softmax(0.0, 1.0);
        let kl: f32 = (0..2).map(|i| pt[i] * (pt[i].ln() - ps[i].ln())).sum();
        assert!((loss - 4.0 * kl).abs() < 1e-5, "{loss} vs {}", 4.0 * kl);
    }

    #[test]
    fn invalid_hyperparameters_are_rejected() {
        assert!(DistillCriterion::new(Criterion::unweighted(), 0.0, 0.5).is_err());
        assert!(DistillCriterion::new(Criterion::unweighted(), 4.0, 1.5).is_err());
    }
}
