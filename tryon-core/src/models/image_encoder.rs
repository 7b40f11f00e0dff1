use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};
use candle_transformers::models::clip::{
    text_model::Activation,
    vision_model::{ClipVisionConfig, ClipVisionTransformer},
};
use image::imageops::{self, FilterType};
use image::RgbImage;

use super::ImageEncoder;

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

const IMAGE_SIZE: usize = 224;
const IMAGE_EMBED_DIM: usize = 1024;
const CONTEXT_DIM: usize = 2048;
/// Number of image-prompt tokens appended to the text context.
const IP_TOKENS: usize = 4;

/// ViT-H/14 as shipped in the try-on `image_encoder` folder.
fn vit_h14() -> ClipVisionConfig {
    ClipVisionConfig {
        embed_dim: 1280,
        activation: Activation::QuickGelu,
        intermediate_size: 5120,
        num_hidden_layers: 32,
        num_attention_heads: 16,
        projection_dim: IMAGE_EMBED_DIM,
        num_channels: 3,
        image_size: IMAGE_SIZE,
        patch_size: 14,
    }
}

/// CLIP vision encoder followed by the image-prompt projection.
pub struct ClipImageEncoder {
    device: Device,
    dtype: DType,
    vision: ClipVisionTransformer,
    visual_projection: Linear,
    proj: Linear,
    norm: LayerNorm,
}

impl ClipImageEncoder {
    pub fn load(encoder_weights: &Path, projection_weights: &Path, device: &Device, dtype: DType) -> Result<Self> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[encoder_weights], dtype, device)
                .context("failed to map image encoder weights")?
        };
        let config = vit_h14();
        let vision = ClipVisionTransformer::new(vb.pp("vision_model"), &config)
            .context("failed to load image encoder")?;
        let visual_projection = candle_nn::linear_no_bias(
            config.embed_dim,
            IMAGE_EMBED_DIM,
            vb.pp("visual_projection"),
        )
        .context("failed to load visual projection")?;

        let ip_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[projection_weights], dtype, device)
                .with_context(|| {
                    format!("failed to map image projection {}", projection_weights.display())
                })?
        };
        let proj = candle_nn::linear(IMAGE_EMBED_DIM, IP_TOKENS * CONTEXT_DIM, ip_vb.pp("proj"))
            .context("failed to load image projection")?;
        let norm = candle_nn::layer_norm(CONTEXT_DIM, 1e-5, ip_vb.pp("norm"))
            .context("failed to load image projection norm")?;

        Ok(Self {
            device: device.clone(),
            dtype,
            vision,
            visual_projection,
            proj,
            norm,
        })
    }

    /// Resize shortest side, center crop and CLIP-normalize to (1, 3, 224, 224).
    fn preprocess(&self, garment: &RgbImage) -> Result<Tensor> {
        let (width, height) = garment.dimensions();
        let size = IMAGE_SIZE as u32;
        let scale = size as f32 / width.min(height) as f32;
        let (new_w, new_h) = (
            ((width as f32 * scale).round() as u32).max(size),
            ((height as f32 * scale).round() as u32).max(size),
        );
        let resized = imageops::resize(garment, new_w, new_h, FilterType::CatmullRom);
        let cropped =
            imageops::crop_imm(&resized, (new_w - size) / 2, (new_h - size) / 2, size, size)
                .to_image();

        let pixels = Tensor::from_vec(cropped.into_raw(), (IMAGE_SIZE, IMAGE_SIZE, 3), &self.device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1. / 255., 0.)?;
        let mean = Tensor::new(&CLIP_MEAN, &self.device)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&CLIP_STD, &self.device)?.reshape((3, 1, 1))?;
        let pixels = pixels.broadcast_sub(&mean)?.broadcast_div(&std)?;
        Ok(pixels.unsqueeze(0)?.to_dtype(self.dtype)?)
    }
}

impl ImageEncoder for ClipImageEncoder {
    fn encode(&self, garment: &RgbImage) -> Result<Tensor> {
        let pixels = self.preprocess(garment)?;
        let pooled = self.vision.forward(&pixels)?;
        let embeds = self.visual_projection.forward(&pooled)?;
        let tokens = self
            .proj
            .forward(&embeds)?
            .reshape((1, IP_TOKENS, CONTEXT_DIM))?;
        Ok(self.norm.forward(&tokens)?)
    }
}
