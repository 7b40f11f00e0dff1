use std::future::Future;
use std::path::PathBuf;

use anyhow::{bail, Result};
use hf_hub::api::tokio::Api;
use tracing::warn;

use crate::pipeline::GUIDANCE_SCALE;
use crate::{DeviceMap, Precision, TryOnModel};

/// Where and how to load a model stack from.
#[derive(Debug, Clone)]
pub struct ModelSource {
    /// Hub repository holding the diffusion components.
    pub base_repo: String,
    /// Local directory with the auxiliary ONNX models and projection weights.
    pub checkpoint_dir: PathBuf,
    /// Local directory with the auxiliary model descriptions.
    pub config_dir: PathBuf,
    /// Refuse to load when either local directory is missing.
    pub strict_paths: bool,
    pub precision: Precision,
    pub use_flash_attn: bool,
    /// Classifier-free guidance weight the pipeline is built with.
    pub guidance_scale: f64,
}

impl Default for ModelSource {
    fn default() -> Self {
        Self {
            base_repo: "yisol/IDM-VTON".to_string(),
            checkpoint_dir: PathBuf::from("./ckpt"),
            config_dir: PathBuf::from("./configs"),
            strict_paths: true,
            precision: Precision::Auto,
            use_flash_attn: false,
            guidance_scale: GUIDANCE_SCALE,
        }
    }
}

impl ModelSource {
    /// Checks that the local checkpoint and config directories exist.
    ///
    /// With `strict_paths` off a missing directory is only logged, and the
    /// failure surfaces later from whichever model needs it.
    pub fn check_local_dirs(&self) -> Result<()> {
        let missing: Vec<_> = [&self.checkpoint_dir, &self.config_dir]
            .into_iter()
            .filter(|dir| !dir.is_dir())
            .map(|dir| dir.display().to_string())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        if self.strict_paths {
            bail!("required model directories not found: {}", missing.join(", "));
        }
        warn!(
            missing = %missing.join(", "),
            "model directories not found, loading will likely fail"
        );
        Ok(())
    }
}

pub trait Loader {
    type Model: TryOnModel;

    fn load(
        api: Api,
        source: ModelSource,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
