use image::{imageops, RgbImage};
use rand::{Rng, RngCore};

use crate::{
    compose::Transform,
    errors::Result,
    types::{ImageData, Sample},
};

/// Rotates by a random multiple of 90 degrees clockwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct RotateBy90;

impl Transform for RotateBy90 {
    fn apply(&self, sample: Sample, rng: &mut dyn RngCore) -> Result<Sample> {
        let quarter_turns = rng.gen_range(0..4u32);
        rotate_quarter_turns(sample, quarter_turns)
    }
}

/// Rotates clockwise `quarter_turns` times, updating coordinates along with
/// the pixels.
pub fn rotate_quarter_turns(mut sample: Sample, quarter_turns: u32) -> Result<Sample> {
    let mut img: RgbImage = sample.image.into_pixels()?;
    for _ in 0..quarter_turns % 4 {
        let h = img.height() as f32;
        img = imageops::rotate90(&img);

        for ann in &mut sample.annotations {
            for kp in &mut ann.keypoints {
                let (x, y) = (kp[0], kp[1]);
                kp[0] = h - y;
                kp[1] = x;
            }
            if let Some(bbox) = ann.bbox.as_mut() {
                *bbox = rotate_box(*bbox, h);
            }
        }
        sample.meta.valid_area = rotate_box(sample.meta.valid_area, h);
        sample.meta.rotation = (sample.meta.rotation + 90.0) % 360.0;
    }
    sample.image = ImageData::Pixels(img);
    Ok(sample)
}

fn rotate_box([x, y, w, h]: [f32; 4], image_height: f32) -> [f32; 4] {
    [image_height - (y + h), x, h, w]
}
