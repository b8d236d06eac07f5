use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor};
use image::DynamicImage;

use crate::ResolvedDevice;

pub fn select_best_device(device: ResolvedDevice) -> Result<Device> {
    match device {
        ResolvedDevice::Cpu => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::info!("running on CPU, build with `--features metal` to run on the GPU");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::info!("running on CPU, build with `--features cuda` to run on the GPU");
            }
            Ok(Device::Cpu)
        }
        ResolvedDevice::Cuda(ordinal) => Ok(Device::new_cuda(ordinal)?),
        ResolvedDevice::Metal(ordinal) => Ok(Device::new_metal(ordinal)?),
    }
}

/// Reduced precision only pays off on accelerators; the CPU always runs F32.
pub fn precision_for(device: ResolvedDevice) -> DType {
    if device.is_accelerator() {
        DType::F16
    } else {
        DType::F32
    }
}

/// Converts a tensor with shape (3, height, width) and dtype u8 into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Splits a (batch, 3, height, width) u8 tensor into one image per batch entry.
pub fn batch_to_images(batch: &Tensor) -> Result<Vec<DynamicImage>> {
    let (batch_size, _, _, _) = batch.dims4()?;
    (0..batch_size)
        .map(|idx| tensor_to_image(&batch.i(idx)?))
        .collect()
}
