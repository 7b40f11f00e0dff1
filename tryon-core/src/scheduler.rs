use std::path::Path;

use anyhow::{Context, Result};
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    schedulers::{BetaSchedule, PredictionType, Scheduler, SchedulerConfig as _},
};
use serde::Deserialize;

/// Noise schedule parameters, read from a diffusers `scheduler_config.json`.
///
/// Stepping is always done with DDIM at zero eta: it draws no noise of its
/// own, so a seeded run only depends on the initial latents.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: String,
    pub num_train_timesteps: usize,
    pub steps_offset: usize,
    pub prediction_type: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: "scaled_linear".to_string(),
            num_train_timesteps: 1000,
            steps_offset: 1,
            prediction_type: "epsilon".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scheduler config {}", path.display()))?;
        serde_json::from_str(&raw).context("failed to parse scheduler config")
    }

    /// Builds a fresh scheduler for `steps` inference steps.
    pub fn build(&self, steps: usize) -> Result<Box<dyn Scheduler>> {
        let beta_schedule = match self.beta_schedule.as_str() {
            "linear" => BetaSchedule::Linear,
            "scaled_linear" => BetaSchedule::ScaledLinear,
            "squaredcos_cap_v2" => BetaSchedule::SquaredcosCapV2,
            other => anyhow::bail!("unsupported beta schedule {other:?}"),
        };
        let prediction_type = match self.prediction_type.as_str() {
            "epsilon" => PredictionType::Epsilon,
            "v_prediction" => PredictionType::VPrediction,
            "sample" => PredictionType::Sample,
            other => anyhow::bail!("unsupported prediction type {other:?}"),
        };
        let config = DDIMSchedulerConfig {
            beta_start: self.beta_start,
            beta_end: self.beta_end,
            beta_schedule,
            eta: 0.,
            steps_offset: self.steps_offset,
            prediction_type,
            train_timesteps: self.num_train_timesteps,
            ..Default::default()
        };
        Ok(config.build(steps)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_diffusers_config_and_ignores_unknown_keys() -> Result<()> {
        let raw = r#"{
            "_class_name": "DDPMScheduler",
            "beta_start": 0.001,
            "beta_end": 0.02,
            "beta_schedule": "linear",
            "num_train_timesteps": 1000,
            "clip_sample": false
        }"#;
        let config: SchedulerConfig = serde_json::from_str(raw)?;
        assert_eq!(config.beta_schedule, "linear");
        assert_eq!(config.steps_offset, 1);
        Ok(())
    }

    #[test]
    fn builds_one_timestep_per_step() -> Result<()> {
        let scheduler = SchedulerConfig::default().build(20)?;
        assert_eq!(scheduler.timesteps().len(), 20);
        Ok(())
    }

    #[test]
    fn rejects_unknown_schedules() {
        let config = SchedulerConfig {
            beta_schedule: "karras".to_string(),
            ..Default::default()
        };
        assert!(config.build(20).is_err());
    }
}
