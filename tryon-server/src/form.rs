//! Multipart decoding and validation of try-on submissions.

use axum::body::Bytes;
use axum::extract::Multipart;
use tracing::warn;
use tryon_core::{
    decode_image, Category, DenoiseSteps, InputParameters, MaskSource, Seed, TryOnInput,
    MANUAL_MASK_REQUIRED,
};

use crate::error::AppError;

/// Form fields as they arrived, before any validation.
#[derive(Debug, Default)]
pub struct RawForm {
    pub human_image: Option<Bytes>,
    pub garment_image: Option<Bytes>,
    pub manual_mask_image: Option<Bytes>,
    pub garment_description: Option<String>,
    pub use_auto_mask: Option<String>,
    pub use_auto_crop: Option<String>,
    pub category: Option<String>,
    pub denoise_steps: Option<String>,
    pub seed: Option<String>,
}

/// A validated submission; images are still encoded.
#[derive(Debug)]
pub struct TryOnForm {
    pub human_image: Bytes,
    pub garment_image: Bytes,
    pub manual_mask_image: Option<Bytes>,
    pub garment_description: String,
    pub use_auto_mask: bool,
    pub use_auto_crop: bool,
    pub category: Category,
    pub denoise_steps: DenoiseSteps,
    pub seed: i64,
}

/// Accepts the usual spellings of a form boolean.
pub fn parse_bool(field: &str, value: &str) -> Result<bool, AppError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(AppError::bad_request(format!(
            "{field} must be a boolean, got {value:?}"
        ))),
    }
}

fn parse_int(field: &str, value: &str) -> Result<i64, AppError> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::bad_request(format!("{field} must be an integer, got {value:?}")))
}

fn required<T>(field: &str, value: Option<T>) -> Result<T, AppError> {
    value.ok_or_else(|| AppError::bad_request(format!("{field} is required")))
}

impl RawForm {
    pub async fn read(mut multipart: Multipart) -> Result<Self, AppError> {
        let mut form = RawForm::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::bad_request(format!("malformed multipart body: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| AppError::bad_request(format!("failed to read field {name}: {e}")))?;
            form.insert(&name, bytes)?;
        }
        Ok(form)
    }

    /// Stores one field. Empty file parts count as absent; unknown fields
    /// are skipped.
    pub fn insert(&mut self, name: &str, bytes: Bytes) -> Result<(), AppError> {
        let file = || (!bytes.is_empty()).then(|| bytes.clone());
        let text = || {
            String::from_utf8(bytes.to_vec())
                .map_err(|_| AppError::bad_request(format!("{name} must be UTF-8 text")))
        };
        match name {
            "human_image" => self.human_image = file(),
            "garment_image" => self.garment_image = file(),
            "manual_mask_image" => self.manual_mask_image = file(),
            "garment_description" => self.garment_description = Some(text()?),
            "use_auto_mask" => self.use_auto_mask = Some(text()?),
            "use_auto_crop" => self.use_auto_crop = Some(text()?),
            "category" => self.category = Some(text()?),
            "denoise_steps" => self.denoise_steps = Some(text()?),
            "seed" => self.seed = Some(text()?),
            _ => {}
        }
        Ok(())
    }

    pub fn validate(self) -> Result<TryOnForm, AppError> {
        let human_image = required("human_image", self.human_image)?;
        let garment_image = required("garment_image", self.garment_image)?;
        let garment_description = required("garment_description", self.garment_description)?;

        let use_auto_mask = match &self.use_auto_mask {
            Some(value) => parse_bool("use_auto_mask", value)?,
            None => true,
        };
        let use_auto_crop = match &self.use_auto_crop {
            Some(value) => parse_bool("use_auto_crop", value)?,
            None => false,
        };
        let category = match &self.category {
            Some(value) => value.trim().parse::<Category>().map_err(|_| {
                AppError::bad_request(format!(
                    "category must be one of upper_body, lower_body, dresses, got {value:?}"
                ))
            })?,
            None => Category::default(),
        };
        let denoise_steps = match &self.denoise_steps {
            Some(value) => DenoiseSteps::try_from(parse_int("denoise_steps", value)?)?,
            None => DenoiseSteps::default(),
        };
        let seed = match &self.seed {
            Some(value) => parse_int("seed", value)?,
            None => Seed::RANDOM_SENTINEL,
        };

        let manual_mask_image = match (use_auto_mask, self.manual_mask_image) {
            (false, None) => return Err(AppError::bad_request(MANUAL_MASK_REQUIRED)),
            (true, Some(_)) => {
                warn!("manual mask supplied while use_auto_mask is true, ignoring it");
                None
            }
            (_, mask) => mask,
        };

        Ok(TryOnForm {
            human_image,
            garment_image,
            manual_mask_image,
            garment_description,
            use_auto_mask,
            use_auto_crop,
            category,
            denoise_steps,
            seed,
        })
    }
}

fn decode(field: &str, bytes: &[u8]) -> Result<image::DynamicImage, AppError> {
    decode_image(bytes).map_err(|e| AppError::bad_request(format!("invalid {field}: {e:#}")))
}

impl TryOnForm {
    pub fn parameters(&self) -> InputParameters {
        InputParameters {
            garment_description: self.garment_description.clone(),
            use_auto_mask: self.use_auto_mask,
            use_auto_crop: self.use_auto_crop,
            category: self.category,
            denoise_steps: self.denoise_steps.get(),
            seed: self.seed,
        }
    }

    /// Decodes the uploaded images into a model input.
    pub fn into_input(self) -> Result<TryOnInput, AppError> {
        let person = decode("human_image", &self.human_image)?;
        let garment = decode("garment_image", &self.garment_image)?;
        let mask = if self.use_auto_mask {
            MaskSource::Auto
        } else {
            let mask = self
                .manual_mask_image
                .as_deref()
                .map(|bytes| decode("manual_mask_image", bytes))
                .transpose()?;
            MaskSource::Manual(mask)
        };
        Ok(TryOnInput {
            person,
            garment,
            mask,
            garment_description: self.garment_description,
            category: self.category,
            auto_crop: self.use_auto_crop,
            denoise_steps: self.denoise_steps.get(),
            seed: Seed::from_signed(self.seed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(fields: &[(&str, &str)]) -> RawForm {
        let mut form = RawForm::default();
        form.insert("human_image", Bytes::from_static(b"person")).unwrap();
        form.insert("garment_image", Bytes::from_static(b"garment")).unwrap();
        form.insert("garment_description", Bytes::from_static(b"red shirt"))
            .unwrap();
        for (name, value) in fields {
            form.insert(name, Bytes::copy_from_slice(value.as_bytes()))
                .unwrap();
        }
        form
    }

    #[test]
    fn booleans_accept_common_spellings() {
        for value in ["true", "1", "Yes", "on"] {
            assert!(parse_bool("flag", value).unwrap());
        }
        for value in ["false", "0", "no", "OFF"] {
            assert!(!parse_bool("flag", value).unwrap());
        }
        assert!(parse_bool("flag", "maybe").is_err());
    }

    #[test]
    fn defaults_apply_to_omitted_fields() {
        let form = form(&[]).validate().unwrap();
        assert!(form.use_auto_mask);
        assert!(!form.use_auto_crop);
        assert_eq!(form.category, Category::UpperBody);
        assert_eq!(form.denoise_steps.get(), 30);
        assert_eq!(form.seed, -1);
    }

    #[test]
    fn empty_file_part_is_absent() {
        let mut raw = form(&[("use_auto_mask", "false")]);
        raw.insert("manual_mask_image", Bytes::new()).unwrap();
        let err = raw.validate().unwrap_err();
        assert_eq!(err.to_string(), MANUAL_MASK_REQUIRED);
    }

    #[test]
    fn manual_mask_is_dropped_in_auto_mode() {
        let mut raw = form(&[]);
        raw.insert("manual_mask_image", Bytes::from_static(b"mask"))
            .unwrap();
        assert!(raw.validate().unwrap().manual_mask_image.is_none());
    }

    #[test]
    fn out_of_range_steps_and_unknown_category_are_rejected() {
        assert!(matches!(
            form(&[("denoise_steps", "41")]).validate(),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            form(&[("denoise_steps", "twenty")]).validate(),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            form(&[("category", "shoes")]).validate(),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn missing_required_field_is_named() {
        let mut raw = form(&[]);
        raw.garment_image = None;
        let err = raw.validate().unwrap_err();
        assert_eq!(err.to_string(), "garment_image is required");
    }
}
