use std::path::Path;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::models::stable_diffusion::{self, clip, StableDiffusionConfig};
use tokenizers::Tokenizer;

use super::{PromptEmbedding, TextEncoder};

const END_OF_TEXT: &str = "<|endoftext|>";
/// Hidden width of the OpenCLIP bigG encoder, which the projection keeps.
const PROJECTION_WIDTH: usize = 1280;

struct ClipTokenizer {
    tokenizer: Tokenizer,
    pad_id: u32,
    eos_id: u32,
    max_len: usize,
}

impl ClipTokenizer {
    fn new(path: &Path, config: &clip::Config) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(Error::msg)
            .with_context(|| format!("failed to load tokenizer {}", path.display()))?;
        let vocab = tokenizer.get_vocab(true);
        let eos_id = *vocab
            .get(END_OF_TEXT)
            .context("tokenizer has no end-of-text token")?;
        let pad_id = match &config.pad_with {
            Some(padding) => *vocab
                .get(padding.as_str())
                .with_context(|| format!("tokenizer has no padding token {padding:?}"))?,
            None => eos_id,
        };
        Ok(Self {
            tokenizer,
            pad_id,
            eos_id,
            max_len: config.max_position_embeddings,
        })
    }

    /// Returns the padded token ids and the position of the end-of-text token.
    fn encode(&self, prompt: &str) -> Result<(Vec<u32>, usize)> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_len {
            tokens.truncate(self.max_len - 1);
            tokens.push(self.eos_id);
        }
        let eos_position = tokens.len() - 1;
        tokens.resize(self.max_len, self.pad_id);
        Ok((tokens, eos_position))
    }
}

/// The SDXL dual CLIP text stack: two tokenizers, two encoders and the
/// projection producing the pooled embedding.
pub struct ClipTextEncoder {
    device: Device,
    tokenizer_one: ClipTokenizer,
    tokenizer_two: ClipTokenizer,
    text_encoder_one: clip::ClipTextTransformer,
    text_encoder_two: clip::ClipTextTransformer,
    text_projection: Linear,
}

pub struct ClipTextFiles<'a> {
    pub tokenizer_one: &'a Path,
    pub tokenizer_two: &'a Path,
    pub text_encoder_one: &'a Path,
    pub text_encoder_two: &'a Path,
}

impl ClipTextEncoder {
    pub fn load(
        sd_config: &StableDiffusionConfig,
        files: ClipTextFiles,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let clip2 = sd_config
            .clip2
            .as_ref()
            .context("diffusion config has no second text encoder")?;

        let text_encoder_one = stable_diffusion::build_clip_transformer(
            &sd_config.clip,
            files.text_encoder_one,
            device,
            dtype,
        )
        .context("failed to load first text encoder")?;
        let text_encoder_two =
            stable_diffusion::build_clip_transformer(clip2, files.text_encoder_two, device, dtype)
                .context("failed to load second text encoder")?;

        let projection_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[files.text_encoder_two], dtype, device)
                .context("failed to map second text encoder weights")?
        };
        let text_projection = candle_nn::linear_no_bias(
            PROJECTION_WIDTH,
            PROJECTION_WIDTH,
            projection_vb.pp("text_projection"),
        )
        .context("failed to load text projection")?;

        Ok(Self {
            device: device.clone(),
            tokenizer_one: ClipTokenizer::new(files.tokenizer_one, &sd_config.clip)?,
            tokenizer_two: ClipTokenizer::new(files.tokenizer_two, clip2)?,
            text_encoder_one,
            text_encoder_two,
            text_projection,
        })
    }

    fn ids(&self, tokens: &[u32]) -> Result<Tensor> {
        Ok(Tensor::new(tokens, &self.device)?.unsqueeze(0)?)
    }
}

impl TextEncoder for ClipTextEncoder {
    fn encode(&self, prompt: &str) -> Result<PromptEmbedding> {
        let (tokens_one, _) = self.tokenizer_one.encode(prompt)?;
        let (tokens_two, eos_position) = self.tokenizer_two.encode(prompt)?;

        let hidden_one = self.text_encoder_one.forward(&self.ids(&tokens_one)?)?;
        let hidden_two = self.text_encoder_two.forward(&self.ids(&tokens_two)?)?;

        let pooled = self
            .text_projection
            .forward(&hidden_two.i((.., eos_position, ..))?)?;
        let hidden = Tensor::cat(&[&hidden_one, &hidden_two], D::Minus1)?;
        Ok(PromptEmbedding { hidden, pooled })
    }
}
