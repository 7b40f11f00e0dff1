use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use hf_hub::api::tokio::{Api, ApiRepo};
use image::{DynamicImage, Rgb, RgbImage};
use tracing::{debug, info};

use crate::mask::{auto_mask, gray_visualization, manual_mask};
use crate::models::clip::{ClipTextEncoder, ClipTextFiles};
use crate::models::image_encoder::ClipImageEncoder;
use crate::models::onnx::{AuxModelConfig, OnnxDensePose, OnnxHumanParser, OnnxPoseEstimator};
use crate::models::unet::{ReferenceUnet, TryOnUnet};
use crate::models::vae::SdxlVae;
use crate::models::{DensePoseEstimator, HumanParser, PoseEstimator};
use crate::pipeline::{PipelineInputs, TryOnPipeline};
use crate::pose::dense_pose_map;
use crate::preprocess::{to_working, Framing};
use crate::prompt::encode_prompts;
use crate::scheduler::SchedulerConfig;
use crate::{
    select_best_device, Category, DeviceMap, Loader, MaskSource, ModelSource, Result, Seed,
    TryOnError, TryOnInput, TryOnModel, TryOnOutput, MANUAL_MASK_REQUIRED, WORKING_HEIGHT,
    WORKING_WIDTH,
};

const CLIP_L_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
const CLIP_G_TOKENIZER_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";

/// Every model a try-on run touches, loaded once and shared by all requests.
///
/// Dropping the registry releases the weights and any device memory they hold.
pub struct ModelRegistry {
    pose: Box<dyn PoseEstimator>,
    parser: Box<dyn HumanParser>,
    densepose: Box<dyn DensePoseEstimator>,
    pipeline: TryOnPipeline,
}

impl ModelRegistry {
    pub fn new(
        pose: Box<dyn PoseEstimator>,
        parser: Box<dyn HumanParser>,
        densepose: Box<dyn DensePoseEstimator>,
        pipeline: TryOnPipeline,
    ) -> Self {
        Self {
            pose,
            parser,
            densepose,
            pipeline,
        }
    }
}

impl TryOnModel for ModelRegistry {
    fn run(&self, input: TryOnInput) -> Result<TryOnOutput> {
        if input.denoise_steps == 0 {
            return Err(TryOnError::input("denoise_steps must be positive"));
        }
        let started = Instant::now();

        let framing = Framing::new(&input.person, input.auto_crop);
        let person = framing.person();
        let garment = to_working(&input.garment);

        let mask = match &input.mask {
            MaskSource::Auto => auto_mask(
                self.pose.as_ref(),
                self.parser.as_ref(),
                person,
                input.category,
            )
            .context("automatic masking failed")?,
            MaskSource::Manual(Some(mask)) => manual_mask(mask),
            MaskSource::Manual(None) => return Err(TryOnError::input(MANUAL_MASK_REQUIRED)),
        };
        let visualization = gray_visualization(&mask, person);

        let pose = dense_pose_map(self.densepose.as_ref(), person)
            .context("dense pose estimation failed")?;
        let prompts = encode_prompts(
            self.pipeline.text_encoder.as_ref(),
            &input.garment_description,
        )
        .context("prompt encoding failed")?;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "conditioning ready");

        let generated = self.pipeline.generate(&PipelineInputs {
            person,
            mask: &mask,
            pose: &pose,
            garment: &garment,
            prompts: &prompts,
            steps: input.denoise_steps,
            seed: input.seed,
        })?;

        let (width, height) = framing.output_size();
        info!(
            category = %input.category,
            steps = input.denoise_steps,
            width,
            height,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "try-on finished"
        );
        Ok(TryOnOutput {
            result: framing.restore(generated),
            mask_visualization: framing.restore(visualization),
        })
    }
}

/// The synthetic request run once after loading to initialize kernels.
pub fn warmup_input(steps: usize) -> TryOnInput {
    let canvas = |color: [u8; 3]| {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(WORKING_WIDTH, WORKING_HEIGHT, Rgb(color)))
    };
    TryOnInput {
        person: canvas([128, 128, 128]),
        garment: canvas([0, 0, 255]),
        mask: MaskSource::Auto,
        garment_description: "blue shirt".to_string(),
        category: Category::UpperBody,
        auto_crop: false,
        denoise_steps: steps,
        seed: Seed::Random,
    }
}

async fn fetch(repo: &ApiRepo, file: &str) -> anyhow::Result<PathBuf> {
    repo.get(file)
        .await
        .with_context(|| format!("failed to fetch {file}"))
}

fn local_file(source: &ModelSource, relative: &str) -> anyhow::Result<PathBuf> {
    let path = source.checkpoint_dir.join(relative);
    anyhow::ensure!(path.is_file(), "checkpoint {} not found", path.display());
    Ok(path)
}

pub struct TryOnLoader;

impl Loader for TryOnLoader {
    type Model = ModelRegistry;

    async fn load(
        api: Api,
        source: ModelSource,
        device_map: DeviceMap,
    ) -> anyhow::Result<Self::Model> {
        source.check_local_dirs()?;

        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = source.precision.dtype_for(&device);
        info!(?device, ?dtype, repo = %source.base_repo, "loading try-on models");
        let started = Instant::now();

        // --- Diffusion components from the hub ---
        let repo = api.model(source.base_repo.clone());
        let scheduler_file = fetch(&repo, "scheduler/scheduler_config.json").await?;
        let scheduler = SchedulerConfig::from_file(scheduler_file)?;
        let unet_file = fetch(&repo, "unet/diffusion_pytorch_model.safetensors").await?;
        let reference_file = fetch(&repo, "unet_encoder/diffusion_pytorch_model.safetensors").await?;
        let text_encoder_one = fetch(&repo, "text_encoder/model.safetensors").await?;
        let text_encoder_two = fetch(&repo, "text_encoder_2/model.safetensors").await?;
        let image_encoder_file = fetch(&repo, "image_encoder/model.safetensors").await?;
        let vae_file = fetch(&repo, "vae/diffusion_pytorch_model.safetensors").await?;
        let tokenizer_one =
            fetch(&api.model(CLIP_L_TOKENIZER_REPO.to_string()), "tokenizer.json").await?;
        let tokenizer_two =
            fetch(&api.model(CLIP_G_TOKENIZER_REPO.to_string()), "tokenizer.json").await?;
        debug!("diffusion weights available locally");

        // --- Local checkpoints ---
        let garment_proj = local_file(&source, "garment_proj.safetensors")?;
        let image_proj = local_file(&source, "ip_adapter/image_proj.safetensors")?;
        let parsing_file = local_file(&source, "humanparsing/parsing_atr.onnx")?;
        let openpose_file = local_file(&source, "openpose/body_pose_model.onnx")?;
        let densepose_file = local_file(&source, "densepose/densepose_r50_fpn.onnx")?;

        let sd_config = StableDiffusionConfig::sdxl(
            None,
            Some(WORKING_HEIGHT as usize),
            Some(WORKING_WIDTH as usize),
        );
        let text_encoder = ClipTextEncoder::load(
            &sd_config,
            ClipTextFiles {
                tokenizer_one: &tokenizer_one,
                tokenizer_two: &tokenizer_two,
                text_encoder_one: &text_encoder_one,
                text_encoder_two: &text_encoder_two,
            },
            &device,
            dtype,
        )?;
        let unet = TryOnUnet::load(&sd_config, &unet_file, &device, dtype, source.use_flash_attn)?;
        let garment_encoder = ReferenceUnet::load(
            &sd_config,
            &reference_file,
            &garment_proj,
            &device,
            dtype,
            source.use_flash_attn,
        )?;
        let image_encoder = ClipImageEncoder::load(&image_encoder_file, &image_proj, &device, dtype)?;
        let vae = SdxlVae::load(&sd_config, &vae_file, &device, dtype)?;
        info!("diffusion stack loaded");

        let use_cuda = device.is_cuda();
        let config_dir = &source.config_dir;
        let parser = OnnxHumanParser::load(
            &parsing_file,
            AuxModelConfig::load_or(config_dir, "parsing", AuxModelConfig::parsing())?,
            use_cuda,
        )?;
        let pose = OnnxPoseEstimator::load(
            &openpose_file,
            AuxModelConfig::load_or(config_dir, "openpose", AuxModelConfig::openpose())?,
            use_cuda,
        )?;
        let densepose = OnnxDensePose::load(
            &densepose_file,
            AuxModelConfig::load_or(config_dir, "densepose", AuxModelConfig::densepose())?,
            use_cuda,
        )?;
        info!(
            elapsed_s = started.elapsed().as_secs_f32(),
            "all try-on models loaded"
        );

        let pipeline = TryOnPipeline {
            device,
            dtype,
            text_encoder: Box::new(text_encoder),
            unet: Box::new(unet),
            garment_encoder: Box::new(garment_encoder),
            image_encoder: Box::new(image_encoder),
            vae: Box::new(vae),
            scheduler,
            guidance_scale: source.guidance_scale,
        };
        Ok(ModelRegistry::new(
            Box::new(pose),
            Box::new(parser),
            Box::new(densepose),
            pipeline,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_request_matches_the_startup_probe() {
        let input = warmup_input(3);
        assert_eq!(input.denoise_steps, 3);
        assert_eq!(input.garment_description, "blue shirt");
        assert_eq!(input.category, Category::UpperBody);
        assert!(matches!(input.mask, MaskSource::Auto));
        assert_eq!(input.seed, Seed::Random);
        let person = input.person.to_rgb8();
        assert_eq!(person.dimensions(), (WORKING_WIDTH, WORKING_HEIGHT));
        assert_eq!(input.garment.to_rgb8().get_pixel(0, 0), &Rgb([0, 0, 255]));
    }

    #[test]
    fn missing_checkpoint_is_reported_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let source = ModelSource {
            checkpoint_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let err = local_file(&source, "openpose/body_pose_model.onnx").unwrap_err();
        assert!(err.to_string().contains("body_pose_model.onnx"));
    }
}
