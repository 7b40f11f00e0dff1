use anyhow::{ensure, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::models::DensePoseEstimator;
use crate::{AUX_HEIGHT, AUX_WIDTH, WORKING_HEIGHT, WORKING_WIDTH};

/// Swaps the first and third channel, converting RGB to BGR and back.
pub fn swap_red_blue(img: &RgbImage) -> RgbImage {
    let mut out = img.clone();
    out.pixels_mut().for_each(|p| p.0.swap(0, 2));
    out
}

/// Computes the dense-pose conditioning map for a working-resolution person.
///
/// Uploaded images are orientation-normalized when decoded, so the person is
/// only downsampled and reordered to BGR before the detector runs.
pub fn dense_pose_map(densepose: &dyn DensePoseEstimator, person: &RgbImage) -> Result<RgbImage> {
    let small = imageops::resize(person, AUX_WIDTH, AUX_HEIGHT, FilterType::CatmullRom);
    let rendered = densepose.render(&swap_red_blue(&small))?;
    ensure!(
        rendered.dimensions() == (AUX_WIDTH, AUX_HEIGHT),
        "dense-pose model rendered {}x{}, expected {AUX_WIDTH}x{AUX_HEIGHT}",
        rendered.width(),
        rendered.height()
    );
    let rgb = swap_red_blue(&rendered);
    Ok(imageops::resize(&rgb, WORKING_WIDTH, WORKING_HEIGHT, FilterType::CatmullRom))
}
