use std::io::Cursor;

use anyhow::{Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, RgbImage};
use rand::{rngs::StdRng, Rng};
use rand_distr::StandardNormal;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!(
                    "Running on CPU, to run on GPU(metal), build with `--features metal`"
                );
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub(crate) fn tensor_to_image(img: &Tensor) -> Result<RgbImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .context("error converting tensor to image buffer")
}

/// Converts an RGB image into a (1, 3, height, width) tensor scaled to [-1, 1].
pub(crate) fn image_to_tensor(img: &RgbImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = img.dimensions();
    let tensor = Tensor::from_vec(
        img.as_raw().clone(),
        (height as usize, width as usize, 3),
        device,
    )?
    .permute((2, 0, 1))?
    .to_dtype(DType::F32)?
    .affine(2. / 255., -1.)?
    .unsqueeze(0)?
    .to_dtype(dtype)?;
    Ok(tensor)
}

/// Maps a (1, 3, height, width) tensor in [-1, 1] back to an RGB image.
pub(crate) fn unit_tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let img = ((tensor.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
        .round()?
        .to_dtype(DType::U8)?
        .squeeze(0)?;
    tensor_to_image(&img)
}

/// Decodes uploaded bytes into an image, honouring any EXIF orientation.
/// Standard-normal tensor drawn from a host generator, so the values only
/// depend on the generator state and never on the device.
pub(crate) fn standard_normal(
    rng: &mut StdRng,
    dims: &[usize],
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let len = dims.iter().product();
    let values: Vec<f32> = (0..len).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(values, dims, device)?.to_dtype(dtype)?)
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("unrecognized image container")?
        .into_decoder()
        .context("unsupported image format")?;
    let orientation = decoder.orientation().context("unreadable image orientation")?;
    let mut img = DynamicImage::from_decoder(decoder).context("corrupt image data")?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// Encodes an image as a `data:image/<format>;base64,` URI.
pub fn encode_data_uri(img: &DynamicImage, format: ImageFormat) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), format)
        .with_context(|| format!("failed to encode image as {format:?}"))?;
    let mime = format.to_mime_type();
    Ok(format!("data:{mime};base64,{}", BASE64_STANDARD.encode(&bytes)))
}
