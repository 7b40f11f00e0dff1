//! Server configuration: built-in defaults, an optional TOML file and
//! `TRYON__`-prefixed environment variables, in that order of precedence.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;
use tryon_core::{DeviceMap, ModelSource, Precision};

pub const DEFAULT_CONFIG_PATH: &str = "config/tryon.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub models: ModelSettings,
    pub inference: InferenceSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Upper bound on a request body, in mebibytes.
    pub max_upload_mb: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSettings {
    pub base_repo: String,
    pub checkpoint_dir: PathBuf,
    pub config_dir: PathBuf,
    pub strict_paths: bool,
    pub precision: Precision,
    pub cpu: bool,
    pub use_flash_attn: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceSettings {
    pub guidance_scale: f64,
    pub warmup: bool,
    pub warmup_steps: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Settings {
    /// Loads settings, reading `path` when given (it must then exist) or
    /// [`DEFAULT_CONFIG_PATH`] when present.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let file = match path {
            Some(path) => File::from(path).format(FileFormat::Toml).required(true),
            None => File::with_name(DEFAULT_CONFIG_PATH)
                .format(FileFormat::Toml)
                .required(false),
        };

        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("server.max_upload_mb", 32)?
            .set_default("models.base_repo", "yisol/IDM-VTON")?
            .set_default("models.checkpoint_dir", "./ckpt")?
            .set_default("models.config_dir", "./configs")?
            .set_default("models.strict_paths", true)?
            .set_default("models.precision", "auto")?
            .set_default("models.cpu", false)?
            .set_default("models.use_flash_attn", false)?
            .set_default("inference.guidance_scale", tryon_core::pipeline::GUIDANCE_SCALE)?
            .set_default("inference.warmup", true)?
            .set_default("inference.warmup_steps", 3)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .add_source(file)
            .add_source(
                Environment::with_prefix("TRYON")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.server.port == 0 {
            return Err(SettingsError::Invalid {
                key: "server.port",
                reason: "must be non-zero".to_string(),
            });
        }
        if !(self.inference.guidance_scale > 0.) {
            return Err(SettingsError::Invalid {
                key: "inference.guidance_scale",
                reason: format!("must be positive, got {}", self.inference.guidance_scale),
            });
        }
        if self.inference.warmup && self.inference.warmup_steps == 0 {
            return Err(SettingsError::Invalid {
                key: "inference.warmup_steps",
                reason: "must be positive when warm-up is enabled".to_string(),
            });
        }
        if self.server.max_upload_mb == 0 {
            return Err(SettingsError::Invalid {
                key: "server.max_upload_mb",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.server.max_upload_mb * 1024 * 1024
    }

    pub fn device_map(&self) -> DeviceMap {
        if self.models.cpu {
            DeviceMap::ForceCpu
        } else {
            DeviceMap::default()
        }
    }

    pub fn model_source(&self) -> ModelSource {
        ModelSource {
            base_repo: self.models.base_repo.clone(),
            checkpoint_dir: self.models.checkpoint_dir.clone(),
            config_dir: self.models.config_dir.clone(),
            strict_paths: self.models.strict_paths,
            precision: self.models.precision,
            use_flash_attn: self.models.use_flash_attn,
            guidance_scale: self.inference.guidance_scale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn file_values_override_defaults() {
        let file = write_config(
            r#"
            [server]
            port = 9100

            [models]
            strict_paths = false
            precision = "f32"

            [logging]
            format = "pretty"
            "#,
        );
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert!(!settings.models.strict_paths);
        assert_eq!(settings.models.precision, Precision::F32);
        assert_eq!(settings.logging.format, LogFormat::Pretty);
        assert_eq!(settings.inference.warmup_steps, 3);
        settings.validate().unwrap();
    }

    #[test]
    fn explicit_config_file_must_exist() {
        assert!(Settings::load(Some(Path::new("/nonexistent/tryon.toml"))).is_err());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let file = write_config("[inference]\nguidance_scale = 0.0\n");
        let settings = Settings::load(Some(file.path())).unwrap();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid { key: "inference.guidance_scale", .. })
        ));

        let file = write_config("[server]\nport = 0\n");
        let settings = Settings::load(Some(file.path())).unwrap();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid { key: "server.port", .. })
        ));
    }

    #[test]
    fn model_source_mirrors_settings() {
        let file = write_config("[models]\ncpu = true\ncheckpoint_dir = \"/data/ckpt\"\n");
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.device_map(), DeviceMap::ForceCpu);
        let source = settings.model_source();
        assert_eq!(source.checkpoint_dir, PathBuf::from("/data/ckpt"));
        assert_eq!(source.base_repo, "yisol/IDM-VTON");
        assert_eq!(source.guidance_scale, 2.0);
    }
}
