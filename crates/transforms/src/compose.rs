use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

use crate::{
    errors::{Error, Result},
    types::Sample,
};

/// A single augmentation step over `(image, annotations, meta)`.
///
/// Implementations keep no mutable state between calls; all randomness is
/// drawn from the generator handed in by the caller, so a pipeline is
/// reproducible given a seed.
pub trait Transform: Send + Sync {
    fn apply(&self, sample: Sample, rng: &mut dyn RngCore) -> Result<Sample>;
}

/// Runs its transforms in order.
#[derive(Default)]
pub struct Compose {
    transforms: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self { transforms }
    }

    pub fn push(&mut self, transform: impl Transform + 'static) {
        self.transforms.push(Box::new(transform));
    }

    pub fn then(mut self, transform: impl Transform + 'static) -> Self {
        self.push(transform);
        self
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl Transform for Compose {
    fn apply(&self, sample: Sample, rng: &mut dyn RngCore) -> Result<Sample> {
        self.transforms
            .iter()
            .try_fold(sample, |sample, transform| transform.apply(sample, rng))
    }
}

/// Applies the wrapped transform with the given probability.
pub struct RandomApply {
    transform: Box<dyn Transform>,
    probability: f32,
}

impl RandomApply {
    pub fn new(transform: impl Transform + 'static, probability: f32) -> Self {
        Self {
            transform: Box::new(transform),
            probability: probability.clamp(0.0, 1.0),
        }
    }
}

impl Transform for RandomApply {
    fn apply(&self, sample: Sample, rng: &mut dyn RngCore) -> Result<Sample> {
        if rng.gen::<f32>() >= self.probability {
            return Ok(sample);
        }
        self.transform.apply(sample, rng)
    }
}

/// Picks one of its transforms with equal probability. When the sample has
/// an `image_id` the pick is a pure function of `image_id + salt`, so the
/// same image always gets the same branch (for example a fixed validation
/// augmentation); otherwise the pick is drawn from the caller's generator.
pub struct DeterministicEqualChoice {
    transforms: Vec<Box<dyn Transform>>,
    salt: u64,
}

impl DeterministicEqualChoice {
    pub fn new(transforms: Vec<Box<dyn Transform>>, salt: u64) -> Result<Self> {
        if transforms.is_empty() {
            return Err(Error::InvalidConfig(
                "choice needs at least one transform".to_string(),
            ));
        }
        Ok(Self { transforms, salt })
    }

    fn pick(&self, image_id: Option<u64>, rng: &mut dyn RngCore) -> usize {
        let n = self.transforms.len();
        match image_id {
            Some(id) => StdRng::seed_from_u64(id.wrapping_add(self.salt)).gen_range(0..n),
            None => rng.gen_range(0..n),
        }
    }
}

impl Transform for DeterministicEqualChoice {
    fn apply(&self, sample: Sample, rng: &mut dyn RngCore) -> Result<Sample> {
        let index = self.pick(sample.meta.image_id, rng);
        self.transforms[index].apply(sample, rng)
    }
}
