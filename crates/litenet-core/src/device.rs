use candle_core::{DType, Device};
use tracing::{info, warn};

use crate::error::CoreResult;

/// Picks the training device and reports whether `fp16` will take effect.
///
/// With `prefer_gpu`, CUDA device `cuda_device_id` is tried first, then
/// Metal, depending on which features were compiled in.  Any failure falls
/// back to CPU, where the forward pass always stays in F32.
pub fn select_device(prefer_gpu: bool, cuda_device_id: usize, fp16: bool) -> CoreResult<Device> {
    let device = prefer_gpu
        .then(|| accelerator(cuda_device_id))
        .flatten()
        .unwrap_or(Device::Cpu);

    let compute = mixed_precision_dtype(&device, fp16);
    info!(device = device_name(&device), mixed_precision = compute.is_some(), "Training device selected");
    if fp16 && compute.is_none() {
        warn!("fp16 requested but training on CPU; the forward pass stays in F32");
    }
    Ok(device)
}

#[allow(unused_variables)]
fn accelerator(cuda_device_id: usize) -> Option<Device> {
    #[cfg(feature = "cuda")]
    match Device::new_cuda(cuda_device_id) {
        Ok(dev) => return Some(dev),
        Err(e) => warn!(error = %e, cuda_device_id, "CUDA unavailable"),
    }

    #[cfg(feature = "metal")]
    match Device::new_metal(0) {
        Ok(dev) => return Some(dev),
        Err(e) => warn!(error = %e, "Metal unavailable"),
    }

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    warn!("No accelerator compiled in; rebuild with `--features cuda` or `--features metal` to train on a GPU");

    None
}

pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

/// F16 when mixed precision is requested on an accelerator, otherwise `None`
/// (everything runs in F32).
pub fn mixed_precision_dtype(device: &Device, fp16: bool) -> Option<DType> {
    (fp16 && !device.is_cpu()).then_some(DType::F16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_requested_gives_cpu() {
        let device = select_device(false, 0, true).unwrap();
        assert!(device.is_cpu());
        assert_eq!(mixed_precision_dtype(&device, true), None);
    }

    #[test]
    fn gpu_without_accelerator_features_falls_back_to_cpu() {
        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        {
            let device = select_device(true, 0, false).unwrap();
            assert_eq!(device_name(&device), "CPU");
        }
    }

    #[test]
    fn fp16_is_ignored_on_cpu() {
        assert_eq!(mixed_precision_dtype(&Device::Cpu, true), None);
        assert_eq!(mixed_precision_dtype(&Device::Cpu, false), None);
    }
}
