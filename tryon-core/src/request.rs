use std::ops::RangeInclusive;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::TryOnError;

/// Clothing category; selects the segmentation rules of the automatic mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    UpperBody,
    LowerBody,
    Dresses,
}

serde_plain::derive_display_from_serialize!(Category);
serde_plain::derive_fromstr_from_deserialize!(Category);

/// Number of reverse-diffusion steps a client may ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DenoiseSteps(usize);

impl DenoiseSteps {
    pub const RANGE: RangeInclusive<i64> = 20..=40;
    pub const DEFAULT: DenoiseSteps = DenoiseSteps(30);

    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for DenoiseSteps {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<i64> for DenoiseSteps {
    type Error = TryOnError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if Self::RANGE.contains(&value) {
            Ok(Self(value as usize))
        } else {
            Err(TryOnError::input(format!(
                "denoise_steps must be between {} and {}, got {value}",
                Self::RANGE.start(),
                Self::RANGE.end()
            )))
        }
    }
}

/// Source of randomness for the initial latent noise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Seed {
    /// Draw fresh entropy; repeated runs differ.
    #[default]
    Random,
    /// Reproducible noise keyed on this value.
    Fixed(u64),
}

impl Seed {
    pub const RANDOM_SENTINEL: i64 = -1;

    /// Interprets the signed seed clients send, where `-1` asks for random noise.
    pub fn from_signed(value: i64) -> Self {
        if value == Self::RANDOM_SENTINEL {
            Seed::Random
        } else {
            Seed::Fixed(value as u64)
        }
    }
}

/// Rejection sent when manual masking is requested without a mask image.
pub const MANUAL_MASK_REQUIRED: &str = "manual_mask_image is required when use_auto_mask is false.";

/// Where the garment-region mask comes from.
#[derive(Clone, Debug)]
pub enum MaskSource {
    /// Derive the mask from the pose and parsing models.
    Auto,
    /// Threshold a user-supplied mask image; `None` is rejected as an input error.
    Manual(Option<DynamicImage>),
}

/// A decoded try-on request, ready to hand to a [`crate::TryOnModel`].
#[derive(Clone, Debug)]
pub struct TryOnInput {
    pub person: DynamicImage,
    pub garment: DynamicImage,
    pub mask: MaskSource,
    pub garment_description: String,
    pub category: Category,
    pub auto_crop: bool,
    pub denoise_steps: usize,
    pub seed: Seed,
}

/// Images produced by one try-on run, already resized for the caller.
#[derive(Clone, Debug)]
pub struct TryOnOutput {
    pub result: DynamicImage,
    pub mask_visualization: DynamicImage,
}

/// Parameters echoed back to the client alongside the generated images.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputParameters {
    pub garment_description: String,
    pub use_auto_mask: bool,
    pub use_auto_crop: bool,
    pub category: Category,
    pub denoise_steps: usize,
    pub seed: i64,
}

/// JSON body of a successful try-on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TryOnResponse {
    pub result_image: String,
    pub mask_visualization: String,
    pub input_parameters: InputParameters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_plain_strings() {
        assert_eq!("lower_body".parse::<Category>().unwrap(), Category::LowerBody);
        assert_eq!(Category::Dresses.to_string(), "dresses");
        assert!("shoes".parse::<Category>().is_err());
    }

    #[test]
    fn denoise_steps_bounds_are_inclusive() {
        assert_eq!(DenoiseSteps::try_from(20).unwrap().get(), 20);
        assert_eq!(DenoiseSteps::try_from(40).unwrap().get(), 40);
        assert!(matches!(DenoiseSteps::try_from(19), Err(TryOnError::Input(_))));
        assert!(matches!(DenoiseSteps::try_from(41), Err(TryOnError::Input(_))));
    }

    #[test]
    fn minus_one_means_random_seed() {
        assert_eq!(Seed::from_signed(-1), Seed::Random);
        assert_eq!(Seed::from_signed(42), Seed::Fixed(42));
        assert_eq!(Seed::from_signed(-2), Seed::Fixed(u64::MAX - 1));
    }
}
