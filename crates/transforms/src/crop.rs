use image::imageops;
use rand::{Rng, RngCore};

use crate::{
    compose::Transform,
    errors::{Error, Result},
    types::{ImageData, Sample},
};

/// Random crop with both sides limited to `long_edge`. Sides already
/// shorter than `long_edge` are kept whole.
#[derive(Debug, Clone, Copy)]
pub struct Crop {
    pub long_edge: u32,
}

impl Crop {
    pub fn new(long_edge: u32) -> Result<Self> {
        if long_edge == 0 {
            return Err(Error::InvalidConfig(
                "crop long_edge must be greater than zero".to_string(),
            ));
        }
        Ok(Self { long_edge })
    }
}

impl Transform for Crop {
    fn apply(&self, mut sample: Sample, rng: &mut dyn RngCore) -> Result<Sample> {
        let img = sample.image.into_pixels()?;
        let (w, h) = img.dimensions();
        let cw = w.min(self.long_edge);
        let ch = h.min(self.long_edge);
        let x0 = if w > cw { rng.gen_range(0..=w - cw) } else { 0 };
        let y0 = if h > ch { rng.gen_range(0..=h - ch) } else { 0 };

        let cropped = imageops::crop_imm(&img, x0, y0, cw, ch).to_image();
        sample.image = ImageData::Pixels(cropped);

        let (dx, dy) = (x0 as f32, y0 as f32);
        let (cw, ch) = (cw as f32, ch as f32);
        for ann in &mut sample.annotations {
            ann.translate(-dx, -dy);
            if let Some(bbox) = ann.bbox.as_mut() {
                *bbox = clip_box(*bbox, cw, ch);
            }
        }

        let meta = &mut sample.meta;
        meta.offset[0] += dx;
        meta.offset[1] += dy;
        let mut area = meta.valid_area;
        area[0] -= dx;
        area[1] -= dy;
        meta.valid_area = clip_box(area, cw, ch);

        Ok(sample)
    }
}

/// Intersects an `[x, y, w, h]` box with `[0, 0, width, height]`.
pub(crate) fn clip_box(bbox: [f32; 4], width: f32, height: f32) -> [f32; 4] {
    let x1 = bbox[0].clamp(0.0, width);
    let y1 = bbox[1].clamp(0.0, height);
    let x2 = (bbox[0] + bbox[2]).clamp(0.0, width);
    let y2 = (bbox[1] + bbox[3]).clamp(0.0, height);
    [x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{annotations::NormalizeAnnotations, types::Annotation};
    use image::{Rgb, RgbImage};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn crop_moves_keypoints_with_pixels() {
        // A single bright pixel marks the keypoint location.
        let mut img = RgbImage::new(40, 30);
        img.put_pixel(25, 17, Rgb([255, 255, 255]));
        let ann = Annotation::new(vec![[25.5, 17.5, 2.0]]).with_bbox([20.0, 10.0, 15.0, 15.0]);

        let mut rng = StdRng::seed_from_u64(5);
        let sample = NormalizeAnnotations
            .apply(Sample::new(img, vec![ann]), &mut rng)
            .unwrap();
        let out = Crop::new(20).unwrap().apply(sample, &mut rng).unwrap();

        let pixels = out.image.pixels().unwrap();
        assert_eq!(pixels.dimensions(), (20, 20));
        let [x, y, _] = out.annotations[0].keypoints[0];
        assert_eq!(x + out.meta.offset[0], 25.5);
        assert_eq!(y + out.meta.offset[1], 17.5);
        if (0.0..20.0).contains(&x) && (0.0..20.0).contains(&y) {
            assert_eq!(pixels.get_pixel(x as u32, y as u32).0, [255, 255, 255]);
        }
        let bbox = out.annotations[0].bbox.unwrap();
        assert!(bbox[0] >= 0.0 && bbox[0] + bbox[2] <= 20.0);
        assert!(bbox[1] >= 0.0 && bbox[1] + bbox[3] <= 20.0);
    }

    #[test]
    fn small_images_are_left_whole() {
        let sample = Sample::new(RgbImage::new(10, 8), Vec::new());
        let mut rng = StdRng::seed_from_u64(1);
        let out = Crop::new(32).unwrap().apply(sample, &mut rng).unwrap();
        assert_eq!(out.image.size().unwrap(), (10, 8));
        assert_eq!(out.meta.offset, [0.0, 0.0]);
    }

    #[test]
    fn clip_box_intersects() {
        assert_eq!(clip_box([-5.0, 2.0, 10.0, 30.0], 8.0, 20.0), [0.0, 2.0, 5.0, 18.0]);
        assert_eq!(clip_box([50.0, 50.0, 5.0, 5.0], 8.0, 8.0), [8.0, 8.0, 0.0, 0.0]);
    }
}
