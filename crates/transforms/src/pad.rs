use image::{imageops, Rgb, RgbImage};
use rand::RngCore;

use crate::{
    compose::Transform,
    errors::{Error, Result},
    types::{ImageData, Sample},
};

/// Fill color for padded borders, roughly the ImageNet mean.
pub const PAD_FILL: [u8; 3] = [124, 116, 104];

/// Pads the image symmetrically up to `target` (width, height). Sides that
/// already exceed the target are left as they are.
#[derive(Debug, Clone, Copy)]
pub struct CenterPad {
    pub target: (u32, u32),
}

impl Transform for CenterPad {
    fn apply(&self, sample: Sample, _rng: &mut dyn RngCore) -> Result<Sample> {
        pad_to(sample, self.target.0, self.target.1)
    }
}

/// Pads the shorter side so the image becomes square.
#[derive(Debug, Default, Clone, Copy)]
pub struct SquarePad;

impl Transform for SquarePad {
    fn apply(&self, sample: Sample, _rng: &mut dyn RngCore) -> Result<Sample> {
        let (w, h) = sample.image.size()?;
        let side = w.max(h);
        pad_to(sample, side, side)
    }
}

/// Pads each side up to the smallest `k * multiple + 1` that holds it, so
/// that a network with stride `multiple` sees aligned feature maps.
#[derive(Debug, Clone, Copy)]
pub struct CenterPadTight {
    pub multiple: u32,
}

impl CenterPadTight {
    pub fn new(multiple: u32) -> Result<Self> {
        if multiple == 0 {
            return Err(Error::InvalidConfig(
                "pad multiple must be greater than zero".to_string(),
            ));
        }
        Ok(Self { multiple })
    }

    fn tight(&self, side: u32) -> u32 {
        side.saturating_sub(1).div_ceil(self.multiple) * self.multiple + 1
    }
}

impl Transform for CenterPadTight {
    fn apply(&self, sample: Sample, _rng: &mut dyn RngCore) -> Result<Sample> {
        let (w, h) = sample.image.size()?;
        pad_to(sample, self.tight(w), self.tight(h))
    }
}

fn pad_to(mut sample: Sample, target_w: u32, target_h: u32) -> Result<Sample> {
    let img = sample.image.into_pixels()?;
    let (w, h) = img.dimensions();
    let new_w = w.max(target_w);
    let new_h = h.max(target_h);
    if (new_w, new_h) == (w, h) {
        sample.image = ImageData::Pixels(img);
        return Ok(sample);
    }

    let left = (new_w - w) / 2;
    let top = (new_h - h) / 2;
    let mut canvas = RgbImage::from_pixel(new_w, new_h, Rgb(PAD_FILL));
    imageops::replace(&mut canvas, &img, left as i64, top as i64);
    sample.image = ImageData::Pixels(canvas);

    let (dx, dy) = (left as f32, top as f32);
    for ann in &mut sample.annotations {
        ann.translate(dx, dy);
    }
    let meta = &mut sample.meta;
    meta.offset[0] -= dx;
    meta.offset[1] -= dy;
    meta.valid_area[0] += dx;
    meta.valid_area[1] += dy;

    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{annotations::NormalizeAnnotations, types::Annotation};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn center_pad_shifts_annotations() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(0, 0, Rgb([1, 2, 3]));
        let ann = Annotation::new(vec![[0.5, 0.5, 2.0]]);
        let mut rng = StdRng::seed_from_u64(0);
        let sample = NormalizeAnnotations
            .apply(Sample::new(img, vec![ann]), &mut rng)
            .unwrap();

        let out = CenterPad { target: (8, 6) }.apply(sample, &mut rng).unwrap();
        let pixels = out.image.pixels().unwrap();
        assert_eq!(pixels.dimensions(), (8, 6));
        assert_eq!(pixels.get_pixel(2, 2).0, [1, 2, 3]);
        assert_eq!(pixels.get_pixel(0, 0).0, PAD_FILL);
        assert_eq!(out.annotations[0].keypoints[0], [2.5, 2.5, 2.0]);
        assert_eq!(out.meta.offset, [-2.0, -2.0]);
        assert_eq!(out.meta.valid_area, [2.0, 2.0, 4.0, 2.0]);
    }

    #[test]
    fn square_pad_only_grows_short_side() {
        let mut rng = StdRng::seed_from_u64(0);
        let out = SquarePad
            .apply(Sample::new(RgbImage::new(10, 4), Vec::new()), &mut rng)
            .unwrap();
        assert_eq!(out.image.size().unwrap(), (10, 10));
        assert_eq!(out.meta.offset, [0.0, -3.0]);
    }

    #[test]
    fn tight_pad_rounds_up_to_stride_plus_one() {
        let pad = CenterPadTight::new(16).unwrap();
        assert_eq!(pad.tight(1), 1);
        assert_eq!(pad.tight(17), 17);
        assert_eq!(pad.tight(18), 33);

        let ann = Annotation::new(vec![[1.0, 1.0, 2.0]]);
        let mut rng = StdRng::seed_from_u64(0);
        let sample = NormalizeAnnotations
            .apply(Sample::new(RgbImage::new(20, 17), vec![ann]), &mut rng)
            .unwrap();
        let out = pad.apply(sample, &mut rng).unwrap();
        assert_eq!(out.image.size().unwrap(), (33, 17));
        assert_eq!(out.meta.offset, [-6.0, 0.0]);
        assert_eq!(out.meta.valid_area, [6.0, 0.0, 20.0, 17.0]);
        assert_eq!(out.annotations[0].keypoints[0], [7.0, 1.0, 2.0]);
        assert!(CenterPadTight::new(0).is_err());
    }
}
