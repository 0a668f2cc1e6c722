//! Feed-forward classifier assembled from a [`ModelConfig`] backbone.
//!
//! Parameters are requested from a [`VarBuilder`] under the names
//! `backbone.<index>.weight` / `backbone.<index>.bias`, where `<index>` is the
//! position of the layer after `repeat` expansion.  The same network code runs
//! over a `VarMap` (trainable) or over plain tensors (frozen).
//!
//! ## Precision
//!
//! `forward` takes an optional compute dtype.  When set, the input and every
//! weight are cast to it on the fly (the cast is part of the autograd graph,
//! so gradients still land on the F32 master weights) and the logits are cast
//! back to F32 before being returned.

use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::error::{CoreError, CoreResult};
use crate::model::{Activation, ModelConfig, ModuleKind};

// ── Layers ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Layer {
    Conv {
        weight: Tensor,
        bias: Tensor,
        stride: usize,
        padding: usize,
        groups: usize,
        act: Option<Activation>,
    },
    MaxPool(usize),
    AvgPool(usize),
    GlobalAvgPool,
    Flatten,
    Linear {
        weight: Tensor,
        bias: Tensor,
        act: Option<Activation>,
    },
}

impl Layer {
    fn forward(&self, xs: &Tensor, compute: Option<DType>) -> CoreResult<Tensor> {
        let ys = match self {
            Self::Conv { weight, bias, stride, padding, groups, act } => {
                let w = cast(weight, compute)?;
                let b = cast(bias, compute)?;
                let out_c = b.dim(0)?;
                let ys = xs
                    .conv2d(&w, *padding, *stride, 1, *groups)?
                    .broadcast_add(&b.reshape((1, out_c, 1, 1))?)?;
                activate(ys, *act)?
            }
            Self::MaxPool(k) => xs.max_pool2d(*k)?,
            Self::AvgPool(k) => xs.avg_pool2d(*k)?,
            Self::GlobalAvgPool => xs.mean_keepdim(3)?.mean_keepdim(2)?,
            Self::Flatten => xs.flatten_from(1)?,
            Self::Linear { weight, bias, act } => {
                let w = cast(weight, compute)?;
                let b = cast(bias, compute)?;
                let ys = xs.matmul(&w.t()?)?.broadcast_add(&b)?;
                activate(ys, *act)?
            }
        };
        Ok(ys)
    }
}

fn cast(t: &Tensor, compute: Option<DType>) -> CoreResult<Tensor> {
    match compute {
        Some(dtype) if t.dtype() != dtype => Ok(t.to_dtype(dtype)?),
        _ => Ok(t.clone()),
    }
}

fn activate(xs: Tensor, act: Option<Activation>) -> CoreResult<Tensor> {
    let ys = match act {
        None => xs,
        Some(Activation::Relu) => xs.relu()?,
        Some(Activation::Silu) => candle_nn::ops::silu(&xs)?,
        // x · relu6(x + 3) / 6
        Some(Activation::Hardswish) => {
            let gate = ((&xs + 3.0)?.clamp(0f32, 6f32)? / 6.0)?;
            (xs * gate)?
        }
    };
    Ok(ys)
}

// ── Shape tracking during construction ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Features {
    Spatial { c: usize, h: usize, w: usize },
    Flat(usize),
}

// ── Network ───────────────────────────────────────────────────────────────────

/// A classifier network: `[B, C, H, W]` images → `[B, num_classes]` logits.
#[derive(Debug, Clone)]
pub struct Network {
    layers: Vec<Layer>,
    num_classes: usize,
}

impl Network {
    /// Build the network for square `img_size × img_size` inputs.
    ///
    /// Layer output shapes are tracked so `Linear` input widths and invalid
    /// geometries (kernel larger than the feature map, linear over spatial
    /// features) are resolved here rather than at the first forward pass.
    pub fn new(cfg: &ModelConfig, img_size: usize, vb: VarBuilder) -> CoreResult<Self> {
        cfg.validate()?;

        let expanded: Vec<(ModuleKind, &[usize])> = cfg
            .backbone
            .iter()
            .flat_map(|l| std::iter::repeat((l.kind(), l.args())).take(cfg.scaled_repeat(l.repeat())))
            .collect();
        let last = expanded.len() - 1;

        let mut features = Features::Spatial { c: cfg.input_channel, h: img_size, w: img_size };
        let mut layers = Vec::with_capacity(expanded.len());

        for (idx, (kind, args)) in expanded.into_iter().enumerate() {
            let vb = vb.pp(format!("backbone.{idx}"));
            let act = if idx == last { None } else { Some(cfg.activation) };
            let field = || format!("backbone layer {idx} ({kind:?})");

            let (layer, next) = match (kind, features) {
                (ModuleKind::Conv | ModuleKind::DWConv, Features::Spatial { c, h, w }) => {
                    let (out_c, k, stride, groups) = if kind == ModuleKind::Conv {
                        (cfg.scaled_channels(args[0]), args[1], args[2], 1)
                    } else {
                        (c, args[0], args[1], c)
                    };
                    let padding = k / 2;
                    if h + 2 * padding < k || w + 2 * padding < k {
                        return Err(CoreError::config(field(), format!("kernel {k} exceeds {h}x{w} input")));
                    }
                    let weight = vb.get_with_hints(
                        (out_c, c / groups, k, k),
                        "weight",
                        candle_nn::init::DEFAULT_KAIMING_NORMAL,
                    )?;
                    let bias = vb.get_with_hints(out_c, "bias", Init::Const(0.))?;
                    let out = |n: usize| (n + 2 * padding - k) / stride + 1;
                    (
                        Layer::Conv { weight, bias, stride, padding, groups, act },
                        Features::Spatial { c: out_c, h: out(h), w: out(w) },
                    )
                }
                (ModuleKind::MaxPool | ModuleKind::AvgPool, Features::Spatial { c, h, w }) => {
                    let k = args[0];
                    if h < k || w < k {
                        return Err(CoreError::config(field(), format!("pool {k} exceeds {h}x{w} input")));
                    }
                    let layer = if kind == ModuleKind::MaxPool { Layer::MaxPool(k) } else { Layer::AvgPool(k) };
                    (layer, Features::Spatial { c, h: h / k, w: w / k })
                }
                (ModuleKind::GlobalAvgPool, Features::Spatial { c, .. }) => {
                    (Layer::GlobalAvgPool, Features::Spatial { c, h: 1, w: 1 })
                }
                (ModuleKind::Flatten, Features::Spatial { c, h, w }) => (Layer::Flatten, Features::Flat(c * h * w)),
                (ModuleKind::Flatten, flat @ Features::Flat(_)) => (Layer::Flatten, flat),
                (ModuleKind::Linear, Features::Flat(n)) => {
                    let out_f = args[0];
                    let weight = vb.get_with_hints(
                        (out_f, n),
                        "weight",
                        candle_nn::init::DEFAULT_KAIMING_NORMAL,
                    )?;
                    let bias = vb.get_with_hints(out_f, "bias", Init::Const(0.))?;
                    (Layer::Linear { weight, bias, act }, Features::Flat(out_f))
                }
                (_, Features::Flat(_)) => {
                    return Err(CoreError::config(field(), "needs spatial input but features are already flattened"));
                }
                (ModuleKind::Linear, Features::Spatial { .. }) => {
                    return Err(CoreError::config(field(), "needs flat input; add a Flatten layer first"));
                }
            };
            layers.push(layer);
            features = next;
        }

        Ok(Self { layers, num_classes: cfg.num_classes() })
    }

    /// Logits for `xs`, always returned as F32.
    pub fn forward(&self, xs: &Tensor, compute: Option<DType>) -> CoreResult<Tensor> {
        let mut ys = cast(xs, compute)?;
        for layer in &self.layers {
            ys = layer.forward(&ys, compute)?;
        }
        Ok(ys.to_dtype(DType::F32)?)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    const SMALL: &str = r#"
input_channel: 3
backbone:
  - [1, Conv, [4, 3, 2]]
  - [2, DWConv, [3, 1]]
  - [1, MaxPool, [2]]
  - [1, Flatten, []]
  - [1, Linear, [3]]
"#;

    fn build(yaml: &str, img: usize) -> CoreResult<(Network, VarMap)> {
        let cfg = ModelConfig::from_yaml_str(yaml)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = Network::new(&cfg, img, vb)?;
        Ok((net, varmap))
    }

    #[test]
    fn forward_produces_logits_per_class() {
        let (net, _) = build(SMALL, 16).unwrap();
        let xs = Tensor::zeros((2, 3, 16, 16), DType::F32, &Device::Cpu).unwrap();
        let logits = net.forward(&xs, None).unwrap();
        assert_eq!(logits.dims(), &[2, 3]);
        assert_eq!(net.num_classes(), 3);
        assert_eq!(net.num_layers(), 6);
    }

    #[test]
    fn linear_width_follows_flattened_features() {
        let (_, varmap) = build(SMALL, 16).unwrap();
        let data = varmap.data().lock().unwrap();
        // 16 → conv s2 → 8 → maxpool 2 → 4; 4 channels · 4 · 4 = 64
        assert_eq!(data["backbone.5.weight"].as_tensor().dims(), &[3, 64]);
        assert_eq!(data["backbone.1.weight"].as_tensor().dims(), &[4, 1, 3, 3]);
    }

    #[test]
    fn linear_before_flatten_is_rejected() {
        let err = build("input_channel: 3\nbackbone:\n  - [1, Linear, [2]]\n", 8).err().unwrap();
        assert!(err.to_string().contains("Flatten"), "got: {err}");
    }

    #[test]
    fn oversized_pool_is_rejected() {
        let yaml = "input_channel: 1\nbackbone:\n  - [1, MaxPool, [8]]\n  - [1, Flatten, []]\n  - [1, Linear, [2]]\n";
        assert!(build(yaml, 4).is_err());
    }

    #[test]
    fn gradients_reach_every_parameter() {
        let (net, varmap) = build(SMALL, 8).unwrap();
        let xs = Tensor::ones((1, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let loss = net.forward(&xs, None).unwrap().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        for var in varmap.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }

    #[test]
    fn hardswish_matches_reference_points() {
        let xs = Tensor::new(&[-4f32, -1.0, 0.0, 1.0, 4.0], &Device::Cpu).unwrap();
        let ys: Vec<f32> = activate(xs, Some(Activation::Hardswish))
            .unwrap()
            .to_vec1()
            .unwrap();
        let expected = [0.0, -1.0 / 3.0, 0.0, 4.0 / 6.0, 4.0];
        for (y, e) in ys.iter().zip(expected) {
            assert!((y - e).abs() < 1e-6, "{y} vs {e}");
        }
    }
}
