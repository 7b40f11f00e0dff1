//! Auxiliary vision models served through ONNX Runtime: body pose, human
//! parsing and dense pose.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, ensure, Context, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use ndarray::{Array4, ArrayD, Ix3, Ix4};
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor as OrtTensor;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{BodyKeypoints, DensePoseEstimator, HumanParser, PoseEstimator, KEYPOINT_COUNT};

/// Input geometry and normalization of an auxiliary model, read from
/// `<config_dir>/<name>.json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuxModelConfig {
    pub input_width: u32,
    pub input_height: u32,
    /// Per-channel mean on the 0..1 scale, in the model's channel order.
    pub mean: [f32; 3],
    /// Per-channel standard deviation on the 0..1 scale.
    pub std: [f32; 3],
    /// Reverse the channel order of the incoming image before normalizing.
    #[serde(default)]
    pub reverse_channels: bool,
    /// Which session output carries the result.
    #[serde(default)]
    pub output_index: usize,
    /// Minimum score for a detection to count.
    #[serde(default)]
    pub threshold: f32,
}

impl AuxModelConfig {
    /// SCHP trained on ATR, fed BGR with ImageNet statistics.
    pub fn parsing() -> Self {
        Self {
            input_width: 512,
            input_height: 512,
            mean: [0.406, 0.456, 0.485],
            std: [0.225, 0.224, 0.229],
            reverse_channels: true,
            output_index: 0,
            threshold: 0.,
        }
    }

    /// OpenPose body-18; the second output holds the part heatmaps.
    pub fn openpose() -> Self {
        Self {
            input_width: 384,
            input_height: 512,
            mean: [0.502, 0.502, 0.502],
            std: [1.0039, 1.0039, 1.0039],
            reverse_channels: true,
            output_index: 1,
            threshold: 0.1,
        }
    }

    /// DensePose R50-FPN; the image already arrives in BGR order.
    pub fn densepose() -> Self {
        Self {
            input_width: 384,
            input_height: 512,
            mean: [0.406, 0.456, 0.485],
            std: [1. / 255., 1. / 255., 1. / 255.],
            reverse_channels: false,
            output_index: 0,
            threshold: 0.,
        }
    }

    /// Reads `<config_dir>/<name>.json`, falling back to `default` when absent.
    pub fn load_or(config_dir: &Path, name: &str, default: Self) -> Result<Self> {
        let path = config_dir.join(format!("{name}.json"));
        if !path.is_file() {
            debug!(path = %path.display(), "no model description, using built-in defaults");
            return Ok(default);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

struct OnnxModel {
    session: Mutex<Session>,
    output_name: String,
    config: AuxModelConfig,
}

impl OnnxModel {
    fn load(path: &Path, config: AuxModelConfig, use_cuda: bool) -> Result<Self> {
        let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
        let builder = if use_cuda {
            match builder
                .with_execution_providers([CUDAExecutionProvider::default().build().error_on_failure()])
            {
                Ok(builder) => builder,
                Err(e) => {
                    warn!(model = %path.display(), error = %e, "could not place model on the accelerator, running on CPU");
                    Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?
                }
            }
        } else {
            builder
        };
        let session = builder
            .commit_from_file(path)
            .with_context(|| format!("failed to load ONNX model {}", path.display()))?;
        let output_name = session
            .outputs
            .get(config.output_index)
            .with_context(|| {
                format!("{} has no output #{}", path.display(), config.output_index)
            })?
            .name
            .clone();
        Ok(Self {
            session: Mutex::new(session),
            output_name,
            config,
        })
    }

    fn to_input(&self, image: &RgbImage) -> Array4<f32> {
        let (width, height) = (self.config.input_width, self.config.input_height);
        let resized = imageops::resize(image, width, height, FilterType::CatmullRom);
        let AuxModelConfig { mean, std, .. } = self.config;
        let reverse = self.config.reverse_channels;
        Array4::from_shape_fn((1, 3, height as usize, width as usize), |(_, c, y, x)| {
            let channel = if reverse { 2 - c } else { c };
            let value = resized.get_pixel(x as u32, y as u32).0[channel] as f32 / 255.;
            (value - mean[c]) / std[c]
        })
    }

    fn run(&self, image: &RgbImage) -> Result<ArrayD<f32>> {
        let input = OrtTensor::from_array(self.to_input(image))?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("ONNX session lock poisoned"))?;
        let outputs = session
            .run(ort::inputs![input])
            .context("ONNX inference failed")?;
        let output = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .context("failed to extract ONNX output")?
            .to_owned();
        Ok(output)
    }
}

/// Per-pixel argmax over the class axis of (1, classes, h, w) logits.
fn argmax_classes(logits: ArrayD<f32>) -> Result<GrayImage> {
    let logits = logits
        .into_dimensionality::<Ix4>()
        .context("expected (1, classes, h, w) logits")?;
    let (_, classes, height, width) = logits.dim();
    ensure!(classes > 0 && classes <= 256, "unexpected class count {classes}");
    Ok(GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let best = (0..classes)
            .max_by(|&a, &b| logits[[0, a, y, x]].total_cmp(&logits[[0, b, y, x]]))
            .unwrap_or(0);
        Luma([best as u8])
    }))
}

pub struct OnnxHumanParser {
    model: OnnxModel,
}

impl OnnxHumanParser {
    pub fn load(path: &Path, config: AuxModelConfig, use_cuda: bool) -> Result<Self> {
        Ok(Self {
            model: OnnxModel::load(path, config, use_cuda)?,
        })
    }
}

impl HumanParser for OnnxHumanParser {
    fn parse(&self, image: &RgbImage) -> Result<GrayImage> {
        let labels = argmax_classes(self.model.run(image)?)?;
        Ok(imageops::resize(&labels, image.width(), image.height(), FilterType::Nearest))
    }
}

pub struct OnnxPoseEstimator {
    model: OnnxModel,
}

impl OnnxPoseEstimator {
    pub fn load(path: &Path, config: AuxModelConfig, use_cuda: bool) -> Result<Self> {
        Ok(Self {
            model: OnnxModel::load(path, config, use_cuda)?,
        })
    }
}

impl PoseEstimator for OnnxPoseEstimator {
    /// Single-person decoding: the peak of each part heatmap above the threshold.
    fn keypoints(&self, image: &RgbImage) -> Result<BodyKeypoints> {
        let heatmaps = self
            .model
            .run(image)?
            .into_dimensionality::<Ix4>()
            .context("expected (1, parts, h, w) heatmaps")?;
        let (_, parts, height, width) = heatmaps.dim();
        ensure!(parts >= KEYPOINT_COUNT, "pose model produced {parts} heatmaps");
        let scale_x = image.width() as f32 / width as f32;
        let scale_y = image.height() as f32 / height as f32;

        let mut keypoints = BodyKeypoints::default();
        for (part, slot) in keypoints.0.iter_mut().enumerate() {
            let map = heatmaps.slice(ndarray::s![0, part, .., ..]);
            let ((y, x), score) = map
                .indexed_iter()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(idx, v)| (idx, *v))
                .unwrap_or(((0usize, 0usize), f32::NEG_INFINITY));
            if score > self.model.config.threshold {
                *slot = Some(((x as f32 + 0.5) * scale_x, (y as f32 + 0.5) * scale_y));
            }
        }
        Ok(keypoints)
    }
}

/// Number of body-part indices in a dense-pose map, background included.
const DENSEPOSE_PARTS: u8 = 25;

pub struct OnnxDensePose {
    model: OnnxModel,
}

impl OnnxDensePose {
    pub fn load(path: &Path, config: AuxModelConfig, use_cuda: bool) -> Result<Self> {
        Ok(Self {
            model: OnnxModel::load(path, config, use_cuda)?,
        })
    }
}

impl DensePoseEstimator for OnnxDensePose {
    fn render(&self, bgr: &RgbImage) -> Result<RgbImage> {
        let output = self.model.run(bgr)?;
        let parts = match output.ndim() {
            4 => argmax_classes(output)?,
            3 => {
                let map = output.into_dimensionality::<Ix3>()?;
                let (_, height, width) = map.dim();
                GrayImage::from_fn(width as u32, height as u32, |x, y| {
                    let v = map[[0, y as usize, x as usize]].round();
                    Luma([v.clamp(0., (DENSEPOSE_PARTS - 1) as f32) as u8])
                })
            }
            n => anyhow::bail!("unexpected dense-pose output rank {n}"),
        };
        let parts = imageops::resize(&parts, bgr.width(), bgr.height(), FilterType::Nearest);
        Ok(render_parts_bgr(&parts))
    }
}

/// Parula-like ramp, RGB, sampled at evenly spaced stops.
const PARULA: [[f32; 3]; 6] = [
    [53., 42., 135.],
    [15., 92., 221.],
    [20., 132., 212.],
    [6., 167., 198.],
    [165., 190., 107.],
    [249., 251., 14.],
];

fn parula(t: f32) -> [u8; 3] {
    let t = t.clamp(0., 1.) * (PARULA.len() - 1) as f32;
    let i = (t.floor() as usize).min(PARULA.len() - 2);
    let f = t - i as f32;
    let (a, b) = (PARULA[i], PARULA[i + 1]);
    std::array::from_fn(|c| (a[c] + (b[c] - a[c]) * f).round() as u8)
}

/// Colors part indices by `index / 24` on the ramp, background black, in BGR.
pub fn render_parts_bgr(parts: &GrayImage) -> RgbImage {
    RgbImage::from_fn(parts.width(), parts.height(), |x, y| {
        let index = parts.get_pixel(x, y).0[0];
        if index == 0 {
            Rgb([0, 0, 0])
        } else {
            let [r, g, b] = parula(index as f32 / (DENSEPOSE_PARTS - 1) as f32);
            Rgb([b, g, r])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_picks_the_strongest_class() -> Result<()> {
        let mut logits = Array4::<f32>::zeros((1, 3, 2, 2));
        logits[[0, 2, 0, 0]] = 5.;
        logits[[0, 1, 1, 1]] = 1.;
        let labels = argmax_classes(logits.into_dyn())?;
        assert_eq!(labels.get_pixel(0, 0).0[0], 2);
        assert_eq!(labels.get_pixel(1, 1).0[0], 1);
        Ok(())
    }

    #[test]
    fn background_renders_black_and_parts_are_colored() {
        let mut parts = GrayImage::new(2, 1);
        parts.put_pixel(1, 0, Luma([24]));
        let img = render_parts_bgr(&parts);
        assert_eq!(img.get_pixel(0, 0), &Rgb([0, 0, 0]));
        // top of the ramp is yellow, stored as BGR
        assert_eq!(img.get_pixel(1, 0), &Rgb([14, 251, 249]));
    }

    #[test]
    fn missing_description_falls_back_to_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = AuxModelConfig::load_or(dir.path(), "openpose", AuxModelConfig::openpose())?;
        assert_eq!(config, AuxModelConfig::openpose());
        Ok(())
    }

    #[test]
    fn description_file_overrides_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("parsing.json"),
            r#"{"input_width": 473, "input_height": 473, "mean": [0.4, 0.4, 0.4], "std": [0.2, 0.2, 0.2]}"#,
        )?;
        let config = AuxModelConfig::load_or(dir.path(), "parsing", AuxModelConfig::parsing())?;
        assert_eq!(config.input_width, 473);
        assert!(!config.reverse_channels);
        Ok(())
    }
}
