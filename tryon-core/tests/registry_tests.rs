//! End-to-end runs of the model registry with lightweight stand-in networks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};

use tryon_core::mask::rules::label;
use tryon_core::models::{
    BodyKeypoints, DensePoseEstimator, Denoiser, DenoiserConditioning, GarmentEncoder,
    HumanParser, ImageEncoder, LatentCodec, LatentPosterior, PoseEstimator, PromptEmbedding,
    TextEncoder,
};
use tryon_core::pipeline::{TryOnPipeline, GUIDANCE_SCALE};
use tryon_core::scheduler::SchedulerConfig;
use tryon_core::{
    Category, MaskSource, ModelRegistry, Seed, TryOnError, TryOnInput, TryOnModel, AUX_HEIGHT,
    AUX_WIDTH, MANUAL_MASK_REQUIRED,
};

const FEATURES: usize = 8;

struct StandingPose;

impl PoseEstimator for StandingPose {
    fn keypoints(&self, _image: &RgbImage) -> Result<BodyKeypoints> {
        let mut keypoints = BodyKeypoints::default();
        keypoints.0[BodyKeypoints::RIGHT_SHOULDER] = Some((140., 160.));
        keypoints.0[BodyKeypoints::RIGHT_ELBOW] = Some((120., 230.));
        keypoints.0[BodyKeypoints::RIGHT_WRIST] = Some((110., 290.));
        keypoints.0[BodyKeypoints::LEFT_SHOULDER] = Some((244., 160.));
        keypoints.0[BodyKeypoints::LEFT_ELBOW] = Some((264., 230.));
        keypoints.0[BodyKeypoints::LEFT_WRIST] = Some((274., 290.));
        Ok(keypoints)
    }
}

/// A shirt in the middle of the frame with a face above it.
struct BoxParser;

impl HumanParser for BoxParser {
    fn parse(&self, image: &RgbImage) -> Result<GrayImage> {
        assert_eq!(image.dimensions(), (AUX_WIDTH, AUX_HEIGHT));
        Ok(GrayImage::from_fn(AUX_WIDTH, AUX_HEIGHT, |x, y| {
            if (150..234).contains(&x) && (60..130).contains(&y) {
                Luma([label::FACE])
            } else if (120..264).contains(&x) && (150..300).contains(&y) {
                Luma([label::UPPER_CLOTHES])
            } else {
                Luma([label::BACKGROUND])
            }
        }))
    }
}

struct EchoDensePose;

impl DensePoseEstimator for EchoDensePose {
    fn render(&self, bgr: &RgbImage) -> Result<RgbImage> {
        Ok(bgr.clone())
    }
}

struct ZeroText;

impl TextEncoder for ZeroText {
    fn encode(&self, _prompt: &str) -> Result<PromptEmbedding> {
        Ok(PromptEmbedding {
            hidden: Tensor::zeros((1, 4, FEATURES), DType::F32, &Device::Cpu)?,
            pooled: Tensor::zeros((1, FEATURES), DType::F32, &Device::Cpu)?,
        })
    }
}

struct ZeroGarment;

impl GarmentEncoder for ZeroGarment {
    fn encode(&self, _latents: &Tensor, _text: &Tensor) -> Result<Tensor> {
        Ok(Tensor::zeros((1, 2, FEATURES), DType::F32, &Device::Cpu)?)
    }
}

struct OnesImage;

impl ImageEncoder for OnesImage {
    fn encode(&self, _garment: &RgbImage) -> Result<Tensor> {
        Ok(Tensor::ones((1, 1, FEATURES), DType::F32, &Device::Cpu)?)
    }
}

/// Average-pools pixels into latents and upsamples them back.
/// Average-pools into a posterior with a wide spread, so every encode draws
/// noise the way the real autoencoder does.
struct PoolingVae;

impl LatentCodec for PoolingVae {
    fn encode(&self, image: &Tensor) -> Result<LatentPosterior> {
        let pooled = image.avg_pool2d(8)?;
        let mean = Tensor::cat(&[&pooled, &pooled.narrow(1, 0, 1)?], 1)?;
        let std = (mean.ones_like()? * 0.5)?;
        Ok(LatentPosterior { mean, std })
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = latents.dims4()?;
        Ok(latents.narrow(1, 0, 3)?.upsample_nearest2d(h * 8, w * 8)?)
    }
}

/// Predicts a fixed fraction of the noisy latents and counts its calls.
struct ScalingDenoiser {
    calls: Arc<AtomicUsize>,
}

impl Denoiser for ScalingDenoiser {
    fn predict_noise(
        &self,
        latents: &Tensor,
        _timestep: usize,
        conditioning: &DenoiserConditioning,
    ) -> Result<Tensor> {
        assert_eq!(latents.dim(1)?, 13);
        assert_eq!(conditioning.encoder_hidden_states.dims(), &[2, 7, FEATURES]);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((latents.narrow(1, 0, 4)? * 0.1)?)
    }
}

fn registry() -> (ModelRegistry, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = TryOnPipeline {
        device: Device::Cpu,
        dtype: DType::F32,
        text_encoder: Box::new(ZeroText),
        unet: Box::new(ScalingDenoiser {
            calls: calls.clone(),
        }),
        garment_encoder: Box::new(ZeroGarment),
        image_encoder: Box::new(OnesImage),
        vae: Box::new(PoolingVae),
        scheduler: SchedulerConfig::default(),
        guidance_scale: GUIDANCE_SCALE,
    };
    let registry = ModelRegistry::new(
        Box::new(StandingPose),
        Box::new(BoxParser),
        Box::new(EchoDensePose),
        pipeline,
    );
    (registry, calls)
}

const SKIN: Rgb<u8> = Rgb([200, 30, 30]);

fn input(width: u32, height: u32) -> TryOnInput {
    TryOnInput {
        person: DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, SKIN)),
        garment: DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 400, Rgb([0, 0, 255]))),
        mask: MaskSource::Auto,
        garment_description: "blue shirt".to_string(),
        category: Category::UpperBody,
        auto_crop: false,
        denoise_steps: 3,
        seed: Seed::Fixed(42),
    }
}

fn close(a: &Rgb<u8>, b: &Rgb<u8>) -> bool {
    a.0.iter().zip(b.0).all(|(x, y)| x.abs_diff(y) <= 2)
}

#[test]
fn fixed_seed_is_reproducible() -> Result<()> {
    let (registry, _) = registry();
    let first = registry.run(input(384, 512))?;
    let second = registry.run(input(384, 512))?;
    assert_eq!(first.result.as_bytes(), second.result.as_bytes());

    let mut other = input(384, 512);
    other.seed = Seed::Fixed(43);
    let third = registry.run(other)?;
    assert_ne!(first.result.as_bytes(), third.result.as_bytes());
    Ok(())
}

#[test]
fn concurrent_fixed_seed_requests_agree() -> Result<()> {
    let (registry, _) = registry();
    let expected = registry.run(input(384, 512))?;
    let outputs = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| registry.run(input(384, 512))))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<tryon_core::Result<Vec<_>>>()
    })?;
    for output in outputs {
        assert_eq!(output.result.as_bytes(), expected.result.as_bytes());
    }
    Ok(())
}

#[test]
fn every_step_runs_the_denoiser_once() -> Result<()> {
    let (registry, calls) = registry();
    registry.run(input(384, 512))?;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[test]
fn outputs_come_back_at_the_input_size() -> Result<()> {
    let (registry, _) = registry();
    let output = registry.run(input(500, 900))?;
    assert_eq!(
        (output.result.width(), output.result.height()),
        (500, 900)
    );
    assert_eq!(
        (output.mask_visualization.width(), output.mask_visualization.height()),
        (500, 900)
    );
    Ok(())
}

#[test]
fn auto_mask_grays_the_shirt_and_keeps_the_rest() -> Result<()> {
    let (registry, _) = registry();
    let output = registry.run(input(384, 512))?;
    let preview = output.mask_visualization.to_rgb8();
    let result = output.result.to_rgb8();

    // middle of the shirt
    assert!(close(preview.get_pixel(192, 225), &Rgb([127, 127, 127])));
    // background corner and face stay untouched
    assert!(close(preview.get_pixel(5, 5), &SKIN));
    assert!(close(result.get_pixel(5, 5), &SKIN));
    assert!(close(result.get_pixel(192, 90), &SKIN));
    Ok(())
}

#[test]
fn manual_mode_without_mask_is_an_input_error() {
    let (registry, calls) = registry();
    let mut request = input(384, 512);
    request.mask = MaskSource::Manual(None);
    match registry.run(request) {
        Err(TryOnError::Input(message)) => assert_eq!(message, MANUAL_MASK_REQUIRED),
        other => panic!("expected an input error, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn empty_manual_mask_leaves_the_person_unchanged() -> Result<()> {
    let (registry, _) = registry();
    let mut request = input(384, 512);
    request.mask = MaskSource::Manual(Some(DynamicImage::ImageLuma8(GrayImage::new(60, 80))));
    let output = registry.run(request)?;
    assert!(output.result.to_rgb8().pixels().all(|p| close(p, &SKIN)));
    Ok(())
}

#[test]
fn auto_crop_only_changes_the_output_frame() -> Result<()> {
    let (registry, _) = registry();
    let cropped = registry.run(TryOnInput {
        auto_crop: true,
        ..input(1200, 900)
    })?;
    assert_eq!((cropped.result.width(), cropped.result.height()), (676, 900));

    let full = registry.run(input(1200, 900))?;
    assert_eq!((full.result.width(), full.result.height()), (1200, 900));
    Ok(())
}

#[test]
fn zero_steps_are_rejected() {
    let (registry, _) = registry();
    let request = TryOnInput {
        denoise_steps: 0,
        ..input(384, 512)
    };
    assert!(matches!(registry.run(request), Err(TryOnError::Input(_))));
}
