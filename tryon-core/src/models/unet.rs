use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::models::stable_diffusion::{
    unet_2d::UNet2DConditionModel, StableDiffusionConfig,
};

use super::{Denoiser, DenoiserConditioning, GarmentEncoder};

/// Noisy latents, mask, masked-person latents and pose latents.
const TRYON_IN_CHANNELS: usize = 4 + 1 + 4 + 4;
const REFERENCE_IN_CHANNELS: usize = 4;
/// Cross-attention width of the SDXL U-Net.
const CONTEXT_DIM: usize = 2048;
/// Side of the latent patch pooled into one garment token.
const GARMENT_PATCH: usize = 8;

/// The 13-channel inpainting U-Net.
///
/// The candle U-Net has no additive text-time embedding, so pooled text
/// embeddings and time ids in the conditioning are not consumed here.
pub struct TryOnUnet {
    unet: UNet2DConditionModel,
    dtype: DType,
}

impl TryOnUnet {
    pub fn load(
        sd_config: &StableDiffusionConfig,
        weights: &Path,
        device: &Device,
        dtype: DType,
        use_flash_attn: bool,
    ) -> Result<Self> {
        let unet = sd_config
            .build_unet(weights, device, TRYON_IN_CHANNELS, use_flash_attn, dtype)
            .context("failed to load try-on unet")?;
        Ok(Self { unet, dtype })
    }
}

impl Denoiser for TryOnUnet {
    fn predict_noise(
        &self,
        latents: &Tensor,
        timestep: usize,
        conditioning: &DenoiserConditioning,
    ) -> Result<Tensor> {
        let noise = self.unet.forward(
            &latents.to_dtype(self.dtype)?,
            timestep as f64,
            &conditioning.encoder_hidden_states.to_dtype(self.dtype)?,
        )?;
        Ok(noise)
    }
}

/// Garment feature extractor built on the reference U-Net.
///
/// The reference U-Net runs once on the clean garment latents; its output is
/// pooled into patches and projected into cross-attention tokens.
pub struct ReferenceUnet {
    unet: UNet2DConditionModel,
    projection: Linear,
    dtype: DType,
}

impl ReferenceUnet {
    pub fn load(
        sd_config: &StableDiffusionConfig,
        weights: &Path,
        projection_weights: &Path,
        device: &Device,
        dtype: DType,
        use_flash_attn: bool,
    ) -> Result<Self> {
        let unet = sd_config
            .build_unet(weights, device, REFERENCE_IN_CHANNELS, use_flash_attn, dtype)
            .context("failed to load reference unet")?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[projection_weights], dtype, device)
                .with_context(|| {
                    format!("failed to map garment projection {}", projection_weights.display())
                })?
        };
        let projection = candle_nn::linear(REFERENCE_IN_CHANNELS, CONTEXT_DIM, vb.pp("garment_proj"))
            .context("failed to load garment projection")?;
        Ok(Self {
            unet,
            projection,
            dtype,
        })
    }
}

impl GarmentEncoder for ReferenceUnet {
    fn encode(&self, latents: &Tensor, text: &Tensor) -> Result<Tensor> {
        let features = self.unet.forward(
            &latents.to_dtype(self.dtype)?,
            0.,
            &text.to_dtype(self.dtype)?,
        )?;
        let tokens = features
            .avg_pool2d(GARMENT_PATCH)?
            .flatten_from(2)?
            .transpose(1, 2)?
            .contiguous()?;
        Ok(self.projection.forward(&tokens)?)
    }
}
