//! Seams between the orchestration code and the pretrained networks.
//!
//! Each trait is the smallest contract one stage needs from a model. The
//! production implementations live in the submodules (candle for the
//! diffusion stack, ONNX Runtime for the auxiliary vision models); tests
//! substitute lightweight fakes.

use anyhow::Result;
use candle_core::Tensor;
use image::{GrayImage, RgbImage};
use rand::rngs::StdRng;

use crate::util::standard_normal;

pub mod clip;
pub mod image_encoder;
pub mod onnx;
pub mod unet;
pub mod vae;

/// Number of body keypoints in the OpenPose body-18 layout.
pub const KEYPOINT_COUNT: usize = 18;

/// Body keypoints in OpenPose body-18 order, in pixel coordinates of the
/// image the estimator was given. Undetected joints are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BodyKeypoints(pub [Option<(f32, f32)>; KEYPOINT_COUNT]);

impl BodyKeypoints {
    pub const NOSE: usize = 0;
    pub const NECK: usize = 1;
    pub const RIGHT_SHOULDER: usize = 2;
    pub const RIGHT_ELBOW: usize = 3;
    pub const RIGHT_WRIST: usize = 4;
    pub const LEFT_SHOULDER: usize = 5;
    pub const LEFT_ELBOW: usize = 6;
    pub const LEFT_WRIST: usize = 7;
    pub const RIGHT_HIP: usize = 8;
    pub const RIGHT_KNEE: usize = 9;
    pub const RIGHT_ANKLE: usize = 10;
    pub const LEFT_HIP: usize = 11;
    pub const LEFT_KNEE: usize = 12;
    pub const LEFT_ANKLE: usize = 13;

    pub fn get(&self, index: usize) -> Option<(f32, f32)> {
        self.0.get(index).copied().flatten()
    }
}

/// Detects body keypoints on an RGB image.
pub trait PoseEstimator: Send + Sync {
    fn keypoints(&self, image: &RgbImage) -> Result<BodyKeypoints>;
}

/// Segments a person into ATR body-part labels, one label per pixel, at the
/// size of the input image.
pub trait HumanParser: Send + Sync {
    fn parse(&self, image: &RgbImage) -> Result<GrayImage>;
}

/// Renders a dense-pose part map. Input and output are both in BGR channel
/// order, at the size of the input image.
pub trait DensePoseEstimator: Send + Sync {
    fn render(&self, bgr: &RgbImage) -> Result<RgbImage>;
}

/// Text embeddings of a single prompt.
#[derive(Debug, Clone)]
pub struct PromptEmbedding {
    /// Per-token hidden states, (1, tokens, features).
    pub hidden: Tensor,
    /// Pooled sentence embedding, (1, features).
    pub pooled: Tensor,
}

/// Tokenizes and encodes text into embeddings for the diffusion U-Net.
pub trait TextEncoder: Send + Sync {
    fn encode(&self, prompt: &str) -> Result<PromptEmbedding>;
}

/// Diagonal Gaussian over the scaled latent space.
pub struct LatentPosterior {
    pub mean: Tensor,
    pub std: Tensor,
}

impl LatentPosterior {
    /// Draws `mean + std * n` with `n` taken from the request generator.
    pub fn sample(&self, rng: &mut StdRng) -> Result<Tensor> {
        let noise = standard_normal(rng, self.mean.dims(), self.mean.device(), self.mean.dtype())?;
        Ok((&self.mean + (&self.std * noise)?)?)
    }
}

/// Converts between pixel space and the scaled latent space.
pub trait LatentCodec: Send + Sync {
    /// Encodes a (b, 3, h, w) image in [-1, 1] into the posterior over scaled
    /// latents (b, 4, h/8, w/8). Sampling is left to the caller.
    fn encode(&self, image: &Tensor) -> Result<LatentPosterior>;
    /// Decodes scaled latents back into a (b, 3, h, w) image in roughly [-1, 1].
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;
}

/// Turns the garment into extra cross-attention tokens for the try-on U-Net.
pub trait GarmentEncoder: Send + Sync {
    /// `latents` are the VAE latents of the garment, `text` the hidden states
    /// of the garment prompt. Returns (1, tokens, features).
    fn encode(&self, latents: &Tensor, text: &Tensor) -> Result<Tensor>;
}

/// Embeds the garment photo into image-prompt tokens.
pub trait ImageEncoder: Send + Sync {
    /// Returns (1, tokens, features) for an RGB garment image of any size.
    fn encode(&self, garment: &RgbImage) -> Result<Tensor>;
}

/// Conditioning shared by every denoising step.
#[derive(Debug, Clone)]
pub struct DenoiserConditioning {
    /// Cross-attention context, (2, tokens, features): negative then positive.
    pub encoder_hidden_states: Tensor,
    /// Pooled text embeddings, (2, features).
    pub text_embeds: Tensor,
    /// Original size, crop offset and target size, (2, 6).
    pub time_ids: Tensor,
}

/// The inpainting U-Net: predicts the noise in a batch of latents.
pub trait Denoiser: Send + Sync {
    /// `latents` is (2, 13, h/8, w/8): noisy latents, mask, masked-person
    /// latents and pose latents stacked along channels.
    fn predict_noise(
        &self,
        latents: &Tensor,
        timestep: usize,
        conditioning: &DenoiserConditioning,
    ) -> Result<Tensor>;
}
