//! Garment-region masks and their human-readable preview.

use anyhow::{ensure, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use tracing::debug;

use crate::models::{HumanParser, PoseEstimator};
use crate::preprocess::resize_rgb;
use crate::{Category, AUX_HEIGHT, AUX_WIDTH, WORKING_HEIGHT, WORKING_WIDTH};

pub mod rules;

/// Derives the repaint mask from the pose and parsing models.
///
/// `person` is the working-resolution image; the models see it at the
/// auxiliary resolution and the mask is scaled back to the working canvas.
pub fn auto_mask(
    pose: &dyn PoseEstimator,
    parser: &dyn HumanParser,
    person: &RgbImage,
    category: Category,
) -> Result<GrayImage> {
    let small = imageops::resize(person, AUX_WIDTH, AUX_HEIGHT, FilterType::CatmullRom);
    let keypoints = pose.keypoints(&small)?;
    let labels = parser.parse(&small)?;
    ensure!(
        labels.dimensions() == (AUX_WIDTH, AUX_HEIGHT),
        "human parser returned a {}x{} label map for a {AUX_WIDTH}x{AUX_HEIGHT} image",
        labels.width(),
        labels.height()
    );
    let detected = keypoints.0.iter().filter(|k| k.is_some()).count();
    debug!(%category, detected, "derived automatic mask inputs");

    let mask = rules::garment_mask(category, &labels, &keypoints);
    Ok(imageops::resize(&mask, WORKING_WIDTH, WORKING_HEIGHT, FilterType::Nearest))
}

/// Thresholds a user-supplied mask at working resolution: any pixel with
/// luminance above zero is repainted.
pub fn manual_mask(mask: &DynamicImage) -> GrayImage {
    let rgb = resize_rgb(mask, WORKING_WIDTH, WORKING_HEIGHT);
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        Luma([if luma_601(rgb.get_pixel(x, y)) > 0 { 255 } else { 0 }])
    })
}

/// ITU-R 601 luma in 16-bit fixed point, rounded to nearest.
fn luma_601(Rgb([r, g, b]): &Rgb<u8>) -> u8 {
    let weighted = *r as u32 * 19595 + *g as u32 * 38470 + *b as u32 * 7471;
    ((weighted + 0x8000) >> 16) as u8
}

/// Preview of what the model will repaint: `(1 - mask) * person` in [-1, 1]
/// space mapped back to display range, so masked pixels come out mid-gray.
pub fn gray_visualization(mask: &GrayImage, person: &RgbImage) -> RgbImage {
    const MID_GRAY: Rgb<u8> = Rgb([127, 127, 127]);
    RgbImage::from_fn(person.width(), person.height(), |x, y| {
        if mask.get_pixel(x, y).0[0] > 0 {
            MID_GRAY
        } else {
            *person.get_pixel(x, y)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    #[test]
    fn manual_mask_is_binary_at_working_resolution() {
        let src = GrayImage::from_fn(100, 50, |x, _| Luma([if x < 50 { 0 } else { 3 }]));
        let mask = manual_mask(&DynamicImage::ImageLuma8(src));
        assert_eq!(mask.dimensions(), (WORKING_WIDTH, WORKING_HEIGHT));
        assert!(mask.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
        assert_eq!(mask.get_pixel(10, 500).0[0], 0);
        assert_eq!(mask.get_pixel(700, 500).0[0], 255);
    }

    #[test]
    fn manual_mask_counts_dim_blue_as_painted() {
        assert_eq!(luma_601(&Rgb([0, 0, 5])), 1);
        assert_eq!(luma_601(&Rgb([0, 0, 4])), 0);
        assert_eq!(luma_601(&Rgb([255, 255, 255])), 255);

        let mask = manual_mask(&DynamicImage::ImageRgb8(RgbImage::from_pixel(
            WORKING_WIDTH,
            WORKING_HEIGHT,
            Rgb([0, 0, 5]),
        )));
        assert!(mask.pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn visualization_grays_out_masked_pixels_only() {
        let person = RgbImage::from_pixel(4, 4, Rgb([200, 10, 30]));
        let mut mask = GrayImage::new(4, 4);
        mask.put_pixel(1, 1, Luma([255]));
        let vis = gray_visualization(&mask, &person);
        assert_eq!(vis.get_pixel(1, 1), &Rgb([127, 127, 127]));
        assert_eq!(vis.get_pixel(0, 0), &Rgb([200, 10, 30]));
        assert_eq!(DynamicImage::ImageRgb8(vis).dimensions(), (4, 4));
    }
}
