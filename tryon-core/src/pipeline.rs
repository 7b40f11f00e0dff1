//! Latent-diffusion inpainting that paints the garment onto the person.

use anyhow::{ensure, Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{GrayImage, RgbImage};
use rand::{rngs::StdRng, SeedableRng};
use tracing::debug;

use crate::models::{
    Denoiser, DenoiserConditioning, GarmentEncoder, ImageEncoder, LatentCodec, TextEncoder,
};
use crate::prompt::TryOnPrompts;
use crate::scheduler::SchedulerConfig;
use crate::util::{image_to_tensor, standard_normal, unit_tensor_to_image};
use crate::{Seed, WORKING_HEIGHT, WORKING_WIDTH};

/// Classifier-free guidance weight used for every request.
pub const GUIDANCE_SCALE: f64 = 2.0;

/// Fraction of the schedule that is run; 1.0 repaints the masked region from pure noise.
pub const STRENGTH: f64 = 1.0;

const LATENT_CHANNELS: usize = 4;
const VAE_STRIDE: usize = 8;

/// The assembled diffusion stack.
pub struct TryOnPipeline {
    pub device: Device,
    pub dtype: DType,
    pub text_encoder: Box<dyn TextEncoder>,
    pub unet: Box<dyn Denoiser>,
    pub garment_encoder: Box<dyn GarmentEncoder>,
    pub image_encoder: Box<dyn ImageEncoder>,
    pub vae: Box<dyn LatentCodec>,
    pub scheduler: SchedulerConfig,
    pub guidance_scale: f64,
}

/// Per-request inputs, all at working resolution.
pub struct PipelineInputs<'a> {
    pub person: &'a RgbImage,
    pub mask: &'a GrayImage,
    pub pose: &'a RgbImage,
    pub garment: &'a RgbImage,
    pub prompts: &'a TryOnPrompts,
    pub steps: usize,
    pub seed: Seed,
}

/// Generator behind every random draw of one request.
pub fn request_rng(seed: Seed) -> StdRng {
    match seed {
        Seed::Fixed(seed) => StdRng::seed_from_u64(seed),
        Seed::Random => StdRng::from_entropy(),
    }
}

/// Draws standard-normal latents from the request generator.
pub fn initial_noise(
    rng: &mut StdRng,
    shape: (usize, usize, usize, usize),
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    standard_normal(rng, &[shape.0, shape.1, shape.2, shape.3], device, dtype)
}

fn mask_to_tensor(mask: &GrayImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = mask.dimensions();
    let tensor = Tensor::from_vec(
        mask.as_raw().clone(),
        (1, 1, height as usize, width as usize),
        device,
    )?
    .to_dtype(DType::F32)?
    .affine(1. / 255., 0.)?
    .to_dtype(dtype)?;
    Ok(tensor)
}

/// Keeps source pixels outside the mask and generated pixels inside it.
pub fn composite(generated: &RgbImage, source: &RgbImage, mask: &GrayImage) -> RgbImage {
    RgbImage::from_fn(source.width(), source.height(), |x, y| {
        if mask.get_pixel(x, y).0[0] > 0 {
            *generated.get_pixel(x, y)
        } else {
            *source.get_pixel(x, y)
        }
    })
}

impl TryOnPipeline {
    pub fn generate(&self, inputs: &PipelineInputs) -> Result<RgbImage> {
        let working = (WORKING_WIDTH, WORKING_HEIGHT);
        for (name, dims) in [
            ("person", inputs.person.dimensions()),
            ("mask", inputs.mask.dimensions()),
            ("pose", inputs.pose.dimensions()),
            ("garment", inputs.garment.dimensions()),
        ] {
            ensure!(dims == working, "{name} image is {dims:?}, expected {working:?}");
        }
        let (height, width) = (WORKING_HEIGHT as usize, WORKING_WIDTH as usize);
        let (latent_h, latent_w) = (height / VAE_STRIDE, width / VAE_STRIDE);
        let (device, dtype) = (&self.device, self.dtype);

        let mut rng = request_rng(inputs.seed);

        // --- Pixel-space inputs ---
        let person = image_to_tensor(inputs.person, device, dtype)?;
        let mask = mask_to_tensor(inputs.mask, device, dtype)?;
        let masked_person = person.broadcast_mul(&mask.affine(-1., 1.)?)?;
        let pose = image_to_tensor(inputs.pose, device, dtype)?;
        let garment = image_to_tensor(inputs.garment, device, dtype)?;

        // --- Latent-space conditioning ---
        let mask_latents = mask.upsample_nearest2d(latent_h, latent_w)?;
        let masked_latents = self
            .vae
            .encode(&masked_person)
            .and_then(|posterior| posterior.sample(&mut rng))
            .context("encoding masked person")?;
        let pose_latents = self
            .vae
            .encode(&pose)
            .and_then(|posterior| posterior.sample(&mut rng))
            .context("encoding pose map")?;
        let garment_latents = self
            .vae
            .encode(&garment)
            .and_then(|posterior| posterior.sample(&mut rng))
            .context("encoding garment")?;
        debug!("encoded pixel inputs into latents");

        let garment_tokens = self
            .garment_encoder
            .encode(&garment_latents, &inputs.prompts.garment.hidden.to_dtype(dtype)?)
            .context("encoding garment features")?
            .to_dtype(dtype)?;
        let ip_tokens = self
            .image_encoder
            .encode(inputs.garment)
            .context("encoding garment image")?
            .to_dtype(dtype)?;

        let wearing = &inputs.prompts.wearing;
        let negative_context = Tensor::cat(
            &[
                &wearing.negative.hidden.to_dtype(dtype)?,
                &garment_tokens,
                &ip_tokens.zeros_like()?,
            ],
            1,
        )?;
        let positive_context = Tensor::cat(
            &[&wearing.positive.hidden.to_dtype(dtype)?, &garment_tokens, &ip_tokens],
            1,
        )?;
        let size = [height as f32, width as f32, 0., 0., height as f32, width as f32];
        let time_ids = Tensor::new(&[size, size], device)?.to_dtype(dtype)?;
        let conditioning = DenoiserConditioning {
            encoder_hidden_states: Tensor::cat(&[&negative_context, &positive_context], 0)?,
            text_embeds: Tensor::cat(
                &[
                    &wearing.negative.pooled.to_dtype(dtype)?,
                    &wearing.positive.pooled.to_dtype(dtype)?,
                ],
                0,
            )?,
            time_ids,
        };

        // --- Reverse diffusion ---
        let mut scheduler = self.scheduler.build(inputs.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let t_start = inputs.steps - (inputs.steps as f64 * STRENGTH) as usize;
        let timesteps = &timesteps[t_start.min(timesteps.len())..];

        let mut latents = initial_noise(
            &mut rng,
            (1, LATENT_CHANNELS, latent_h, latent_w),
            device,
            dtype,
        )?
        .affine(scheduler.init_noise_sigma(), 0.)?;

        let extra = Tensor::cat(&[&mask_latents, &masked_latents, &pose_latents], 1)?;
        let extra = Tensor::cat(&[&extra, &extra], 0)?;

        for (index, &timestep) in timesteps.iter().enumerate() {
            let latent_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;
            let latent_input = Tensor::cat(&[&latent_input, &extra], 1)?;

            let noise_pred = self
                .unet
                .predict_noise(&latent_input, timestep, &conditioning)
                .with_context(|| format!("denoising step {index} (t={timestep})"))?;
            let noise_pred = noise_pred.chunk(2, 0)?;
            let (uncond, cond) = (&noise_pred[0], &noise_pred[1]);
            let guided = (uncond + ((cond - uncond)? * self.guidance_scale)?)?;

            latents = scheduler.step(&guided, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), "denoising step done");
        }

        // --- Decode and keep the unmasked region from the source ---
        let decoded = self.vae.decode(&latents).context("decoding latents")?;
        let generated = unit_tensor_to_image(&decoded)?;
        ensure!(
            generated.dimensions() == working,
            "decoder produced {:?}, expected {working:?}",
            generated.dimensions()
        );
        Ok(composite(&generated, inputs.person, inputs.mask))
    }
}
