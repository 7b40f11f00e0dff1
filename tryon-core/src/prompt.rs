use anyhow::Result;

use crate::models::{PromptEmbedding, TextEncoder};

const QUALITY_PREFIX: &str =
    "((best quality, masterpiece, ultra-detailed, high quality photography, photo realistic)), ";

pub const NEGATIVE_PROMPT: &str = "monochrome, lowres, bad anatomy, worst quality, normal quality, low quality, blurry, jpeg artifacts, sketch";

/// Prompt conditioning the try-on U-Net on the person wearing the garment.
pub fn wearing_prompt(description: &str) -> String {
    format!("{QUALITY_PREFIX}the model is wearing {description}")
}

/// Prompt conditioning the garment encoder on the garment alone.
pub fn garment_prompt(description: &str) -> String {
    format!("{QUALITY_PREFIX}a photo of {description}")
}

/// Positive and negative embeddings for classifier-free guidance.
#[derive(Debug, Clone)]
pub struct GuidedEmbeddings {
    pub positive: PromptEmbedding,
    pub negative: PromptEmbedding,
}

/// Every text embedding one try-on run needs.
#[derive(Debug, Clone)]
pub struct TryOnPrompts {
    pub wearing: GuidedEmbeddings,
    /// Hidden states of the garment prompt; encoded without guidance.
    pub garment: PromptEmbedding,
}

pub fn encode_prompts(encoder: &dyn TextEncoder, description: &str) -> Result<TryOnPrompts> {
    let wearing = GuidedEmbeddings {
        positive: encoder.encode(&wearing_prompt(description))?,
        negative: encoder.encode(NEGATIVE_PROMPT)?,
    };
    let garment = encoder.encode(&garment_prompt(description))?;
    Ok(TryOnPrompts { wearing, garment })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_interpolate_the_description() {
        assert_eq!(
            wearing_prompt("red short sleeve t-shirt"),
            "((best quality, masterpiece, ultra-detailed, high quality photography, photo realistic)), the model is wearing red short sleeve t-shirt"
        );
        assert!(garment_prompt("denim skirt").ends_with(", a photo of denim skirt"));
    }
}
