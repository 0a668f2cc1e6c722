//! # litenet-core
//!
//! Network definition, device selection, and checkpoint I/O for litenet.
//!
//! ## Model handles
//!
//! | Handle | Parameters | Used for |
//! |--------|------------|----------|
//! | [`TrainableModel`] | `VarMap` (gradients, optimiser updates) | the student / plain model |
//! | [`FrozenModel`] | plain tensors, outputs detached | the distillation teacher |
//!
//! Both run the same [`Network`], built from a YAML [`ModelConfig`].
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `metal` | Enable Apple Metal GPU acceleration |

pub mod checkpoint;
pub mod device;
pub mod error;
pub mod frozen;
pub mod init;
pub mod model;
pub mod network;
pub mod trainable;

pub use checkpoint::LoadReport;
pub use device::{mixed_precision_dtype, select_device};
pub use error::{CoreError, CoreResult};
pub use frozen::{CheckpointOptions, FrozenModel};
pub use model::{Activation, LayerSpec, ModelConfig, ModuleKind};
pub use network::Network;
pub use trainable::TrainableModel;
