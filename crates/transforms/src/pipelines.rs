use serde::{Deserialize, Serialize};

use crate::{
    annotations::NormalizeAnnotations,
    compose::{Compose, RandomApply},
    errors::{Error, Result},
    photometric::{Blur, ColorJitter, JpegCompression, Normalize, RandomGrayscale, ToTensor},
};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Options for the standard training augmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    #[serde(default)]
    pub add_noise: bool,
    #[serde(default = "default_blur_max_sigma")]
    pub blur_max_sigma: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            add_noise: false,
            blur_max_sigma: default_blur_max_sigma(),
        }
    }
}

impl AugmentationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.blur_max_sigma.is_finite() && self.blur_max_sigma >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "blur_max_sigma must be a non-negative number (got {})",
                self.blur_max_sigma
            )));
        }
        Ok(())
    }
}

fn default_blur_max_sigma() -> f32 {
    5.0
}

/// Annotation normalization, tensor conversion and ImageNet normalization.
pub fn eval_pipeline() -> Compose {
    Compose::default()
        .then(NormalizeAnnotations)
        .then(ToTensor)
        .then(Normalize {
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        })
}

/// Photometric training augmentation followed by the eval pipeline.
pub fn train_pipeline(config: &AugmentationConfig) -> Result<Compose> {
    config.validate()?;

    let mut pipeline = Compose::default()
        .then(NormalizeAnnotations)
        .then(ColorJitter::new(0.1, 0.1, 0.1, 0.1))
        .then(RandomApply::new(JpegCompression::default(), 0.1));
    if config.add_noise {
        pipeline.push(RandomApply::new(
            Blur {
                max_sigma: config.blur_max_sigma,
            },
            0.5,
        ));
        pipeline.push(RandomGrayscale { probability: 0.01 });
    }
    pipeline.push(eval_pipeline());

    log::debug!(
        "built training pipeline with {} stages (add_noise={})",
        pipeline.len(),
        config.add_noise
    );
    Ok(pipeline)
}
