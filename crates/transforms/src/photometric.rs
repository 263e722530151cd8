use candle_core::{Device, Tensor};
use image::{codecs::jpeg::JpegEncoder, imageops, ImageFormat, RgbImage};
use rand::{seq::SliceRandom, Rng, RngCore};

use crate::{
    compose::Transform,
    errors::{Error, Result},
    types::{ImageData, Sample},
};

/// Converts RGB pixels into a `[3, H, W]` `f32` tensor scaled to `[0, 1]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToTensor;

impl Transform for ToTensor {
    fn apply(&self, sample: Sample, _rng: &mut dyn RngCore) -> Result<Sample> {
        let Sample {
            image,
            annotations,
            meta,
        } = sample;
        let img = image.into_pixels()?;
        let (w, h) = img.dimensions();
        let data: Vec<f32> = img
            .into_raw()
            .into_iter()
            .map(|v| v as f32 / 255.0)
            .collect();
        let tensor = Tensor::from_vec(data, (h as usize, w as usize, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .contiguous()?;
        Ok(Sample {
            image: ImageData::Tensor(tensor),
            annotations,
            meta,
        })
    }
}

/// Per-channel `(x - mean) / std` on a tensor image.
#[derive(Debug, Clone, Copy)]
pub struct Normalize {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalize {
    pub fn new(mean: [f32; 3], std: [f32; 3]) -> Result<Self> {
        if std.iter().any(|s| *s <= 0.0) {
            return Err(Error::InvalidConfig(
                "normalization std must be positive".to_string(),
            ));
        }
        Ok(Self { mean, std })
    }
}

impl Transform for Normalize {
    fn apply(&self, sample: Sample, _rng: &mut dyn RngCore) -> Result<Sample> {
        let Sample {
            image,
            annotations,
            meta,
        } = sample;
        let tensor = image.into_tensor()?;
        let device = tensor.device().clone();
        let mean = Tensor::from_slice(&self.mean, (3, 1, 1), &device)?.to_dtype(tensor.dtype())?;
        let std = Tensor::from_slice(&self.std, (3, 1, 1), &device)?.to_dtype(tensor.dtype())?;
        let normalized = tensor.broadcast_sub(&mean)?.broadcast_div(&std)?;
        Ok(Sample {
            image: ImageData::Tensor(normalized),
            annotations,
            meta,
        })
    }
}

/// Random brightness, contrast, saturation and hue perturbation, applied
/// in a random order. Each strength is the maximum relative change; hue is
/// a fraction of the full color wheel.
#[derive(Debug, Clone, Copy)]
pub struct ColorJitter {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub hue: f32,
}

impl ColorJitter {
    pub fn new(brightness: f32, contrast: f32, saturation: f32, hue: f32) -> Self {
        Self {
            brightness: brightness.max(0.0),
            contrast: contrast.max(0.0),
            saturation: saturation.max(0.0),
            hue: hue.clamp(0.0, 0.5),
        }
    }
}

impl Transform for ColorJitter {
    fn apply(&self, mut sample: Sample, rng: &mut dyn RngCore) -> Result<Sample> {
        let mut img = sample.image.into_pixels()?;

        let mut order = [0u8, 1, 2, 3];
        order.shuffle(rng);
        for op in order {
            match op {
                0 if self.brightness > 0.0 => {
                    let factor = rng.gen_range((1.0 - self.brightness)..=(1.0 + self.brightness));
                    map_channels(&mut img, |c, _| c * factor);
                }
                1 if self.contrast > 0.0 => {
                    let factor = rng.gen_range((1.0 - self.contrast)..=(1.0 + self.contrast));
                    let mean = mean_luma(&img);
                    map_channels(&mut img, |c, _| (c - mean) * factor + mean);
                }
                2 if self.saturation > 0.0 => {
                    let factor =
                        rng.gen_range((1.0 - self.saturation)..=(1.0 + self.saturation));
                    map_channels(&mut img, |c, gray| (c - gray) * factor + gray);
                }
                3 if self.hue > 0.0 => {
                    let shift = rng.gen_range(-self.hue..=self.hue);
                    let degrees = (shift * 360.0).round() as i32;
                    if degrees != 0 {
                        img = imageops::huerotate(&img, degrees);
                    }
                }
                _ => {}
            }
        }

        sample.image = ImageData::Pixels(img);
        Ok(sample)
    }
}

/// Replaces the image by its luma replicated over three channels with the
/// given probability.
#[derive(Debug, Clone, Copy)]
pub struct RandomGrayscale {
    pub probability: f32,
}

impl Transform for RandomGrayscale {
    fn apply(&self, mut sample: Sample, rng: &mut dyn RngCore) -> Result<Sample> {
        if rng.gen::<f32>() >= self.probability {
            return Ok(sample);
        }
        let mut img = sample.image.into_pixels()?;
        map_channels(&mut img, |_, gray| gray);
        sample.image = ImageData::Pixels(img);
        Ok(sample)
    }
}

/// Round-trips the image through a lossy JPEG encode to inject
/// compression artifacts.
#[derive(Debug, Clone, Copy)]
pub struct JpegCompression {
    pub quality: u8,
}

impl Default for JpegCompression {
    fn default() -> Self {
        Self { quality: 50 }
    }
}

impl Transform for JpegCompression {
    fn apply(&self, mut sample: Sample, _rng: &mut dyn RngCore) -> Result<Sample> {
        let img = sample.image.into_pixels()?;
        let mut buffer = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buffer, self.quality.clamp(1, 100));
        encoder.encode_image(&img)?;
        let decoded = image::load_from_memory_with_format(&buffer, ImageFormat::Jpeg)?.to_rgb8();
        sample.image = ImageData::Pixels(decoded);
        Ok(sample)
    }
}

/// Gaussian blur with sigma drawn uniformly from `[0, max_sigma)`.
#[derive(Debug, Clone, Copy)]
pub struct Blur {
    pub max_sigma: f32,
}

impl Default for Blur {
    fn default() -> Self {
        Self { max_sigma: 5.0 }
    }
}

impl Transform for Blur {
    fn apply(&self, mut sample: Sample, rng: &mut dyn RngCore) -> Result<Sample> {
        let img = sample.image.into_pixels()?;
        let sigma = self.max_sigma * rng.gen::<f32>();
        let img = if sigma > 0.0 {
            imageops::blur(&img, sigma)
        } else {
            img
        };
        sample.image = ImageData::Pixels(img);
        Ok(sample)
    }
}

fn luma(pixel: &[u8; 3]) -> f32 {
    0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32
}

fn mean_luma(img: &RgbImage) -> f32 {
    let count = (img.width() as usize * img.height() as usize).max(1);
    let total: f64 = img.pixels().map(|p| luma(&p.0) as f64).sum();
    (total / count as f64) as f32
}

/// Rewrites every channel value through `f(value, pixel_luma)`.
fn map_channels(img: &mut RgbImage, f: impl Fn(f32, f32) -> f32) {
    for pixel in img.pixels_mut() {
        let gray = luma(&pixel.0);
        for channel in pixel.0.iter_mut() {
            *channel = f(*channel as f32, gray).round().clamp(0.0, 255.0) as u8;
        }
    }
}
