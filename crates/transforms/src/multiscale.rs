use rand::RngCore;

use crate::{
    compose::Transform,
    errors::{Error, Result},
    types::Sample,
};

/// Fans one sample out into several views, one per branch, for
/// test-time multi-scale evaluation. Each branch sees its own copy of the
/// input and records its own meta, so predictions from every view can be
/// mapped back onto the source image independently.
pub struct MultiScale {
    transforms: Vec<Box<dyn Transform>>,
}

impl MultiScale {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Result<Self> {
        if transforms.is_empty() {
            return Err(Error::InvalidConfig(
                "multi-scale needs at least one branch".to_string(),
            ));
        }
        Ok(Self { transforms })
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Output `i` is branch `i` applied to a clone of `sample`.
    pub fn apply_all(&self, sample: &Sample, rng: &mut dyn RngCore) -> Result<Vec<Sample>> {
        self.transforms
            .iter()
            .map(|t| t.apply(sample.clone(), rng))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        annotations::NormalizeAnnotations, compose::Compose, hflip::HFlip,
        scale::RescaleAbsolute, types::Annotation,
    };
    use image::RgbImage;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn each_branch_keeps_its_own_meta() {
        let mut rng = StdRng::seed_from_u64(0);
        let sample = NormalizeAnnotations
            .apply(
                Sample::new(
                    RgbImage::new(40, 20),
                    vec![Annotation::new(vec![[10.0, 5.0, 2.0]])],
                ),
                &mut rng,
            )
            .unwrap();

        let flip = HFlip::with_permutation(vec![0]).unwrap();
        let branches: Vec<Box<dyn Transform>> = vec![
            Box::new(Compose::default()),
            Box::new(RescaleAbsolute::new(80).unwrap()),
            Box::new(
                Compose::default()
                    .then(RescaleAbsolute::new(20).unwrap())
                    .then(flip),
            ),
        ];
        let multi = MultiScale::new(branches).unwrap();
        let views = multi.apply_all(&sample, &mut rng).unwrap();

        assert_eq!(views.len(), 3);
        assert_eq!(views[0].meta, sample.meta);
        assert_eq!(views[1].meta.scale, [2.0, 2.0]);
        assert!(!views[1].meta.hflip);
        assert_eq!(views[2].meta.scale, [0.5, 0.5]);
        assert!(views[2].meta.hflip);
        assert_eq!(views[1].image.size().unwrap(), (80, 40));
        assert_eq!(views[2].image.size().unwrap(), (20, 10));
        // the input is untouched
        assert_eq!(sample.annotations[0].keypoints[0], [10.0, 5.0, 2.0]);
    }

    #[test]
    fn needs_a_branch() {
        assert!(MultiScale::new(Vec::new()).is_err());
    }
}
