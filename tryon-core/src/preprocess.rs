//! Geometry shared by every stage: center cropping to the working aspect
//! ratio and resizing to and from the working canvas.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};

use crate::{WORKING_HEIGHT, WORKING_WIDTH};

const RESAMPLE: FilterType = FilterType::CatmullRom;

/// Resizes an image to exactly `width` x `height` and drops any alpha channel.
pub fn resize_rgb(img: &DynamicImage, width: u32, height: u32) -> RgbImage {
    if img.dimensions() == (width, height) {
        return img.to_rgb8();
    }
    img.resize_exact(width, height, RESAMPLE).to_rgb8()
}

pub fn to_working(img: &DynamicImage) -> RgbImage {
    resize_rgb(img, WORKING_WIDTH, WORKING_HEIGHT)
}

/// Largest centered 3:4 (width:height) window inside `width` x `height`,
/// as `(left, top, crop_width, crop_height)`.
///
/// Window edges sit at half-pixel positions when the spare width or height is
/// odd; both edges round half to even, so such windows gain one pixel.
pub fn center_crop_3x4(width: u32, height: u32) -> (u32, u32, u32, u32) {
    let target_w = (width as f64).min(height as f64 * 3. / 4.) as u32;
    let target_h = (height as f64).min(width as f64 * 4. / 3.) as u32;
    let (left, right) = centered_edges(width, target_w);
    let (top, bottom) = centered_edges(height, target_h);
    (left, top, (right - left).max(1), (bottom - top).max(1))
}

fn centered_edges(outer: u32, inner: u32) -> (u32, u32) {
    let start = ((outer - inner) as f64 / 2.).round_ties_even() as u32;
    let end = ((outer + inner) as f64 / 2.).round_ties_even() as u32;
    (start, end.min(outer))
}

/// How a person photo maps onto the working canvas and back.
#[derive(Debug, Clone)]
pub struct Framing {
    person: RgbImage,
    output_size: (u32, u32),
}

impl Framing {
    /// Optionally center-crops `img` to 3:4, then resizes to the working canvas.
    ///
    /// The crop happens before any resizing so the returned images come back
    /// at the crop's own size.
    pub fn new(img: &DynamicImage, auto_crop: bool) -> Self {
        let (width, height) = img.dimensions();
        if auto_crop {
            let (left, top, crop_w, crop_h) = center_crop_3x4(width, height);
            let cropped = img.crop_imm(left, top, crop_w, crop_h);
            Self {
                person: to_working(&cropped),
                output_size: (crop_w, crop_h),
            }
        } else {
            Self {
                person: to_working(img),
                output_size: (width, height),
            }
        }
    }

    /// The person image at working resolution.
    pub fn person(&self) -> &RgbImage {
        &self.person
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.output_size
    }

    /// Resizes a working-resolution image back to the caller's frame.
    pub fn restore(&self, img: RgbImage) -> DynamicImage {
        let (width, height) = self.output_size;
        let img = DynamicImage::ImageRgb8(img);
        if img.dimensions() == (width, height) {
            img
        } else {
            img.resize_exact(width, height, RESAMPLE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_of_wide_image_keeps_full_height() {
        assert_eq!(center_crop_3x4(1200, 900), (262, 0, 676, 900));
    }

    #[test]
    fn odd_margins_round_half_to_even() {
        // edges at 162.5 and 837.5 round outward
        assert_eq!(center_crop_3x4(1000, 900), (162, 0, 676, 900));
        // edges at 163.5 and 838.5 round inward
        assert_eq!(center_crop_3x4(1002, 900), (164, 0, 674, 900));
    }

    #[test]
    fn crop_of_tall_image_keeps_full_width() {
        assert_eq!(center_crop_3x4(600, 1000), (0, 100, 600, 800));
    }

    #[test]
    fn crop_of_exact_ratio_is_identity() {
        assert_eq!(center_crop_3x4(768, 1024), (0, 0, 768, 1024));
    }

    #[test]
    fn framing_restores_original_or_cropped_size() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(1200, 900));

        let plain = Framing::new(&img, false);
        assert_eq!(plain.person().dimensions(), (WORKING_WIDTH, WORKING_HEIGHT));
        let restored = plain.restore(plain.person().clone());
        assert_eq!(restored.dimensions(), (1200, 900));

        let cropped = Framing::new(&img, true);
        assert_eq!(cropped.person().dimensions(), (WORKING_WIDTH, WORKING_HEIGHT));
        assert_eq!(cropped.output_size(), (676, 900));
    }
}
