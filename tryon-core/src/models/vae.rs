use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, VarBuilder};
use candle_transformers::models::stable_diffusion::{
    unet_2d_blocks::{
        DownEncoderBlock2D, DownEncoderBlock2DConfig, UNetMidBlock2D, UNetMidBlock2DConfig,
    },
    vae::{AutoEncoderKL, AutoEncoderKLConfig},
    StableDiffusionConfig,
};

use super::{LatentCodec, LatentPosterior};

/// Latent scaling factor of the SDXL autoencoder.
const SDXL_VAE_SCALE: f64 = 0.13025;

/// Encoder half of the KL autoencoder, stopping at the posterior moments.
///
/// candle's `AutoEncoderKL::encode` only hands out a distribution that samples
/// from the device generator, so the moments are computed here from the same
/// `encoder.*` and `quant_conv` weights.
struct PosteriorEncoder {
    conv_in: Conv2d,
    down_blocks: Vec<DownEncoderBlock2D>,
    mid_block: UNetMidBlock2D,
    conv_norm_out: GroupNorm,
    conv_out: Conv2d,
    quant_conv: Option<Conv2d>,
}

impl PosteriorEncoder {
    fn new(vb: VarBuilder, config: &AutoEncoderKLConfig) -> Result<Self> {
        let channels = &config.block_out_channels;
        let last = *channels.last().context("autoencoder has no blocks")?;
        let padded = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let encoder = vb.pp("encoder");

        let conv_in = candle_nn::conv2d(3, channels[0], 3, padded, encoder.pp("conv_in"))?;
        let mut down_blocks = Vec::with_capacity(channels.len());
        for (index, &out_channels) in channels.iter().enumerate() {
            let in_channels = channels[index.saturating_sub(1)];
            let block = DownEncoderBlock2DConfig {
                num_layers: config.layers_per_block,
                resnet_eps: 1e-6,
                resnet_groups: config.norm_num_groups,
                add_downsample: index + 1 < channels.len(),
                downsample_padding: 0,
                ..Default::default()
            };
            down_blocks.push(DownEncoderBlock2D::new(
                encoder.pp("down_blocks").pp(index.to_string()),
                in_channels,
                out_channels,
                block,
            )?);
        }
        let mid = UNetMidBlock2DConfig {
            resnet_eps: 1e-6,
            output_scale_factor: 1.,
            attn_num_head_channels: None,
            resnet_groups: Some(config.norm_num_groups),
            ..Default::default()
        };
        let mid_block = UNetMidBlock2D::new(encoder.pp("mid_block"), last, None, mid)?;
        let conv_norm_out =
            candle_nn::group_norm(config.norm_num_groups, last, 1e-6, encoder.pp("conv_norm_out"))?;
        let moments = 2 * config.latent_channels;
        let conv_out = candle_nn::conv2d(last, moments, 3, padded, encoder.pp("conv_out"))?;
        let quant_conv = if config.use_quant_conv {
            Some(candle_nn::conv2d(
                moments,
                moments,
                1,
                Default::default(),
                vb.pp("quant_conv"),
            )?)
        } else {
            None
        };
        Ok(Self {
            conv_in,
            down_blocks,
            mid_block,
            conv_norm_out,
            conv_out,
            quant_conv,
        })
    }

    /// Returns `(mean, std)` of the unscaled latent posterior.
    fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut xs = xs.apply(&self.conv_in)?;
        for block in &self.down_blocks {
            xs = xs.apply(block)?;
        }
        let xs = self.mid_block.forward(&xs, None)?.apply(&self.conv_norm_out)?;
        let mut xs = candle_nn::ops::silu(&xs)?.apply(&self.conv_out)?;
        if let Some(quant_conv) = &self.quant_conv {
            xs = quant_conv.forward(&xs)?;
        }
        let moments = xs.chunk(2, 1)?;
        let std = (&moments[1] * 0.5)?.exp()?;
        Ok((moments[0].clone(), std))
    }
}

pub struct SdxlVae {
    autoencoder: AutoEncoderKL,
    encoder: PosteriorEncoder,
    dtype: DType,
}

impl SdxlVae {
    pub fn load(
        sd_config: &StableDiffusionConfig,
        weights: &Path,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let autoencoder = sd_config
            .build_vae(weights, device, dtype)
            .context("failed to load autoencoder")?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)
                .context("failed to map autoencoder weights")?
        };
        let encoder = PosteriorEncoder::new(vb, &autoencoder.config)
            .context("failed to load autoencoder encoder")?;
        Ok(Self {
            autoencoder,
            encoder,
            dtype,
        })
    }
}

impl LatentCodec for SdxlVae {
    fn encode(&self, image: &Tensor) -> Result<LatentPosterior> {
        let (mean, std) = self.encoder.forward(&image.to_dtype(self.dtype)?)?;
        Ok(LatentPosterior {
            mean: (mean * SDXL_VAE_SCALE)?,
            std: (std * SDXL_VAE_SCALE)?,
        })
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = (latents.to_dtype(self.dtype)? / SDXL_VAE_SCALE)?;
        Ok(self.autoencoder.decode(&latents)?)
    }
}
