//! Category rules turning a human parse and body keypoints into the region
//! the diffusion model is allowed to repaint.

use image::{GrayImage, Luma};

use crate::models::BodyKeypoints;
use crate::Category;

/// ATR human-parsing labels.
pub mod label {
    pub const BACKGROUND: u8 = 0;
    pub const HAT: u8 = 1;
    pub const HAIR: u8 = 2;
    pub const SUNGLASSES: u8 = 3;
    pub const UPPER_CLOTHES: u8 = 4;
    pub const SKIRT: u8 = 5;
    pub const PANTS: u8 = 6;
    pub const DRESS: u8 = 7;
    pub const BELT: u8 = 8;
    pub const LEFT_SHOE: u8 = 9;
    pub const RIGHT_SHOE: u8 = 10;
    pub const FACE: u8 = 11;
    pub const LEFT_LEG: u8 = 12;
    pub const RIGHT_LEG: u8 = 13;
    pub const LEFT_ARM: u8 = 14;
    pub const RIGHT_ARM: u8 = 15;
    pub const BAG: u8 = 16;
    pub const SCARF: u8 = 17;
}

use label::*;

const ARMS: [(usize, usize); 4] = [
    (BodyKeypoints::RIGHT_SHOULDER, BodyKeypoints::RIGHT_ELBOW),
    (BodyKeypoints::RIGHT_ELBOW, BodyKeypoints::RIGHT_WRIST),
    (BodyKeypoints::LEFT_SHOULDER, BodyKeypoints::LEFT_ELBOW),
    (BodyKeypoints::LEFT_ELBOW, BodyKeypoints::LEFT_WRIST),
];

const LEGS: [(usize, usize); 5] = [
    (BodyKeypoints::RIGHT_HIP, BodyKeypoints::LEFT_HIP),
    (BodyKeypoints::RIGHT_HIP, BodyKeypoints::RIGHT_KNEE),
    (BodyKeypoints::RIGHT_KNEE, BodyKeypoints::RIGHT_ANKLE),
    (BodyKeypoints::LEFT_HIP, BodyKeypoints::LEFT_KNEE),
    (BodyKeypoints::LEFT_KNEE, BodyKeypoints::LEFT_ANKLE),
];

struct Rule {
    garment: &'static [u8],
    protected: &'static [u8],
    arms: bool,
    legs: bool,
}

fn rule(category: Category) -> Rule {
    match category {
        Category::UpperBody => Rule {
            garment: &[UPPER_CLOTHES, DRESS, SCARF, LEFT_ARM, RIGHT_ARM],
            protected: &[
                HAT, HAIR, SUNGLASSES, FACE, SKIRT, PANTS, LEFT_LEG, RIGHT_LEG, LEFT_SHOE,
                RIGHT_SHOE, BAG,
            ],
            arms: true,
            legs: false,
        },
        Category::LowerBody => Rule {
            garment: &[SKIRT, PANTS, BELT, LEFT_LEG, RIGHT_LEG],
            protected: &[
                HAT, HAIR, SUNGLASSES, FACE, UPPER_CLOTHES, LEFT_ARM, RIGHT_ARM, LEFT_SHOE,
                RIGHT_SHOE, BAG,
            ],
            arms: false,
            legs: true,
        },
        Category::Dresses => Rule {
            garment: &[
                UPPER_CLOTHES, SKIRT, PANTS, DRESS, BELT, LEFT_LEG, RIGHT_LEG, LEFT_ARM,
                RIGHT_ARM, SCARF,
            ],
            protected: &[HAT, HAIR, SUNGLASSES, FACE, LEFT_SHOE, RIGHT_SHOE, BAG],
            arms: true,
            legs: true,
        },
    }
}

/// Builds the binary (0/255) repaint mask at the resolution of `labels`.
pub fn garment_mask(category: Category, labels: &GrayImage, keypoints: &BodyKeypoints) -> GrayImage {
    let rule = rule(category);
    let (width, height) = labels.dimensions();

    let mut mask = GrayImage::from_fn(width, height, |x, y| {
        let l = labels.get_pixel(x, y).0[0];
        Luma([if rule.garment.contains(&l) { 255 } else { 0 }])
    });

    // Limb strokes cover sleeves and trouser legs the parser may attribute to skin.
    let limb_radius = (width / 40).max(2) as i32;
    let mut limbs: Vec<(usize, usize)> = Vec::new();
    if rule.arms {
        limbs.extend_from_slice(&ARMS);
    }
    if rule.legs {
        limbs.extend_from_slice(&LEGS);
    }
    for (a, b) in limbs {
        if let (Some(a), Some(b)) = (keypoints.get(a), keypoints.get(b)) {
            draw_thick_line(&mut mask, a, b, limb_radius);
        }
    }

    let grow = (width / 64).max(1);
    mask = dilate(&mask, grow);
    mask = erode(&dilate(&mask, grow * 2), grow * 2);

    for (m, l) in mask.pixels_mut().zip(labels.pixels()) {
        if rule.protected.contains(&l.0[0]) {
            m.0[0] = 0;
        }
    }
    mask
}

fn draw_thick_line(mask: &mut GrayImage, from: (f32, f32), to: (f32, f32), radius: i32) {
    let (dx, dy) = (to.0 - from.0, to.1 - from.1);
    let steps = dx.abs().max(dy.abs()).ceil().max(1.) as i32;
    for i in 0..=steps {
        let t = i as f32 / steps as f32;
        let cx = (from.0 + dx * t).round() as i32;
        let cy = (from.1 + dy * t).round() as i32;
        stamp_disc(mask, cx, cy, radius);
    }
}

fn stamp_disc(mask: &mut GrayImage, cx: i32, cy: i32, radius: i32) {
    let (width, height) = (mask.width() as i32, mask.height() as i32);
    for y in (cy - radius).max(0)..=(cy + radius).min(height - 1) {
        for x in (cx - radius).max(0)..=(cx + radius).min(width - 1) {
            if (x - cx).pow(2) + (y - cy).pow(2) <= radius * radius {
                mask.put_pixel(x as u32, y as u32, Luma([255]));
            }
        }
    }
}

pub(crate) fn dilate(mask: &GrayImage, radius: u32) -> GrayImage {
    box_filter(mask, radius, u8::max, 0)
}

pub(crate) fn erode(mask: &GrayImage, radius: u32) -> GrayImage {
    box_filter(mask, radius, u8::min, 255)
}

/// Separable square-window max/min filter; out-of-bounds pixels read as `pad`.
fn box_filter(mask: &GrayImage, radius: u32, op: fn(u8, u8) -> u8, pad: u8) -> GrayImage {
    let (width, height) = mask.dimensions();
    let r = radius as i64;
    let sample = |img: &GrayImage, x: i64, y: i64| -> u8 {
        if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
            pad
        } else {
            img.get_pixel(x as u32, y as u32).0[0]
        }
    };
    let horizontal = GrayImage::from_fn(width, height, |x, y| {
        let v = (-r..=r).fold(pad, |acc, d| op(acc, sample(mask, x as i64 + d, y as i64)));
        Luma([v])
    });
    GrayImage::from_fn(width, height, |x, y| {
        let v = (-r..=r).fold(pad, |acc, d| op(acc, sample(&horizontal, x as i64, y as i64 + d)));
        Luma([v])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band_labels() -> GrayImage {
        // face on top, upper clothes in the middle, pants at the bottom
        GrayImage::from_fn(64, 96, |_, y| {
            Luma([match y {
                0..=19 => FACE,
                20..=59 => UPPER_CLOTHES,
                _ => PANTS,
            }])
        })
    }

    fn is_binary(mask: &GrayImage) -> bool {
        mask.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255)
    }

    #[test]
    fn upper_body_covers_top_and_spares_face_and_legs() {
        let mask = garment_mask(Category::UpperBody, &band_labels(), &BodyKeypoints::default());
        assert!(is_binary(&mask));
        assert_eq!(mask.get_pixel(32, 40).0[0], 255);
        assert_eq!(mask.get_pixel(32, 5).0[0], 0);
        assert_eq!(mask.get_pixel(32, 90).0[0], 0);
    }

    #[test]
    fn lower_body_spares_upper_clothes() {
        let mask = garment_mask(Category::LowerBody, &band_labels(), &BodyKeypoints::default());
        assert_eq!(mask.get_pixel(32, 40).0[0], 0);
        assert_eq!(mask.get_pixel(32, 80).0[0], 255);
    }

    #[test]
    fn dresses_cover_both_halves() {
        let mask = garment_mask(Category::Dresses, &band_labels(), &BodyKeypoints::default());
        assert_eq!(mask.get_pixel(32, 40).0[0], 255);
        assert_eq!(mask.get_pixel(32, 80).0[0], 255);
        assert_eq!(mask.get_pixel(32, 5).0[0], 0);
    }

    #[test]
    fn arm_keypoints_extend_the_mask_over_background() {
        let labels = GrayImage::new(64, 96);
        let mut keypoints = BodyKeypoints::default();
        keypoints.0[BodyKeypoints::RIGHT_SHOULDER] = Some((10.0, 30.0));
        keypoints.0[BodyKeypoints::RIGHT_ELBOW] = Some((10.0, 50.0));

        let upper = garment_mask(Category::UpperBody, &labels, &keypoints);
        assert_eq!(upper.get_pixel(10, 40).0[0], 255);
        assert_eq!(upper.get_pixel(50, 40).0[0], 0);

        let lower = garment_mask(Category::LowerBody, &labels, &keypoints);
        assert!(lower.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn closing_fills_small_holes() {
        let mut mask = GrayImage::from_pixel(20, 20, Luma([255]));
        mask.put_pixel(10, 10, Luma([0]));
        let closed = erode(&dilate(&mask, 1), 1);
        assert_eq!(closed.get_pixel(10, 10).0[0], 255);
    }
}
