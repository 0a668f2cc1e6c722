use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Layer type in a backbone description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleKind {
    /// `[out_channels, kernel, stride]`
    Conv,
    /// Depthwise conv, `[kernel, stride]`; channel count is preserved.
    DWConv,
    /// `[kernel]`, non-overlapping (stride = kernel).
    MaxPool,
    /// `[kernel]`, non-overlapping (stride = kernel).
    AvgPool,
    /// `[]`; averages over the spatial dims, keeping `[B, C, 1, 1]`.
    GlobalAvgPool,
    /// `[]`
    Flatten,
    /// `[out_features]`
    Linear,
}

impl ModuleKind {
    fn arity(self) -> usize {
        match self {
            Self::Conv => 3,
            Self::DWConv => 2,
            Self::MaxPool | Self::AvgPool | Self::Linear => 1,
            Self::GlobalAvgPool | Self::Flatten => 0,
        }
    }
}

/// Non-linearity applied after every parametric layer except the last.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Silu,
    Hardswish,
}

/// One backbone row: `[repeat, module, args]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec(pub usize, pub ModuleKind, pub Vec<usize>);

impl LayerSpec {
    pub fn repeat(&self) -> usize {
        self.0
    }

    pub fn kind(&self) -> ModuleKind {
        self.1
    }

    pub fn args(&self) -> &[usize] {
        &self.2
    }
}

/// Network description read from a model YAML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub input_channel: usize,
    #[serde(default = "one")]
    pub depth_multiple: f64,
    #[serde(default = "one")]
    pub width_multiple: f64,
    #[serde(default)]
    pub activation: Activation,
    pub backbone: Vec<LayerSpec>,
}

fn one() -> f64 {
    1.0
}

impl ModelConfig {
    /// Read and validate a model config from a YAML file.
    pub fn from_yaml_file(path: &Path) -> CoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> CoreResult<Self> {
        let cfg: Self = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_yaml_string(&self) -> CoreResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check structural rules that do not depend on the dataset.
    pub fn validate(&self) -> CoreResult<()> {
        if self.input_channel == 0 {
            return Err(CoreError::config("input_channel", "must be positive"));
        }
        let positive = |m: f64| m.is_finite() && m > 0.0;
        if !positive(self.depth_multiple) || !positive(self.width_multiple) {
            return Err(CoreError::config(
                "depth_multiple/width_multiple",
                "multipliers must be positive",
            ));
        }
        if self.backbone.is_empty() {
            return Err(CoreError::config("backbone", "at least one layer is required"));
        }
        for (i, layer) in self.backbone.iter().enumerate() {
            let field = format!("backbone[{i}]");
            if layer.repeat() == 0 {
                return Err(CoreError::config(field, "repeat must be at least 1"));
            }
            if layer.args().len() != layer.kind().arity() {
                return Err(CoreError::config(
                    field,
                    format!(
                        "{:?} takes {} args, got {}",
                        layer.kind(),
                        layer.kind().arity(),
                        layer.args().len()
                    ),
                ));
            }
            if layer.args().iter().any(|&a| a == 0) {
                return Err(CoreError::config(field, "args must be positive"));
            }
        }
        match self.backbone.last() {
            Some(last) if last.kind() == ModuleKind::Linear => Ok(()),
            _ => Err(CoreError::config("backbone", "final layer must be a Linear head")),
        }
    }

    /// Number of output classes (width of the final `Linear`).
    pub fn num_classes(&self) -> usize {
        self.backbone
            .last()
            .map(|l| l.args()[0])
            .unwrap_or_default()
    }

    /// Repeat count after applying `depth_multiple`.
    pub fn scaled_repeat(&self, repeat: usize) -> usize {
        if repeat > 1 {
            ((repeat as f64 * self.depth_multiple).round() as usize).max(1)
        } else {
            repeat
        }
    }

    /// Conv output width after applying `width_multiple`, rounded up to a
    /// multiple of 8.
    pub fn scaled_channels(&self, channels: usize) -> usize {
        if (self.width_multiple - 1.0).abs() < f64::EPSILON {
            return channels;
        }
        make_divisible(channels as f64 * self.width_multiple, 8)
    }
}

fn make_divisible(v: f64, divisor: usize) -> usize {
    let d = divisor as f64;
    ((v / d).ceil() * d) as usize
}
