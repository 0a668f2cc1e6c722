//! Seeded parameter initialisation.
//!
//! candle's CPU backend cannot be seeded, so a freshly built `VarMap` is
//! overwritten here from a `StdRng`.  Parameters are visited in sorted name
//! order so the draw sequence, and therefore the weights, depend only on the
//! seed and the architecture.

use candle_core::Tensor;
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{CoreError, CoreResult};

/// Overwrite every variable in `varmap`.
///
/// Weights (rank ≥ 2) are drawn from `U(-1/√fan_in, 1/√fan_in)` with
/// `fan_in = prod(dims[1..])`; rank-1 parameters (biases) are zeroed.
pub fn seeded_init(varmap: &VarMap, seed: u64) -> CoreResult<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = varmap.data().lock().map_err(|_| CoreError::LockPoisoned)?;

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    for name in names {
        let var = &data[name];
        let t = var.as_tensor();
        let dims = t.dims().to_vec();
        let value = if dims.len() >= 2 {
            let fan_in: usize = dims[1..].iter().product();
            let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
            let values: Vec<f32> = (0..t.elem_count())
                .map(|_| rng.gen_range(-bound..bound))
                .collect();
            Tensor::from_vec(values, dims.as_slice(), t.device())?
        } else {
            t.zeros_like()?
        };
        var.set(&value.to_dtype(t.dtype())?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn fresh(seed: u64) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((4, 9), "a.weight", Init::Const(7.)).unwrap();
        vb.get_with_hints(4, "a.bias", Init::Const(7.)).unwrap();
        seeded_init(&varmap, seed).unwrap();
        varmap
    }

    fn values(varmap: &VarMap, name: &str) -> Vec<f32> {
        let data = varmap.data().lock().unwrap();
        data[name].as_tensor().flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn same_seed_same_weights() {
        assert_eq!(values(&fresh(42), "a.weight"), values(&fresh(42), "a.weight"));
    }

    #[test]
    fn different_seed_different_weights() {
        assert_ne!(values(&fresh(1), "a.weight"), values(&fresh(2), "a.weight"));
    }

    #[test]
    fn weights_within_fan_in_bound_and_bias_zeroed() {
        let varmap = fresh(0);
        let bound = 1.0 / 3.0;
        assert!(values(&varmap, "a.weight").iter().all(|v| v.abs() <= bound));
        assert!(values(&varmap, "a.bias").iter().all(|&v| v == 0.0));
    }
}
