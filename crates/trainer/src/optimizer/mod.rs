use candle_core::{backprop::GradStore, Var};

use crate::TrainingError;

/// Parameter update rule driven by the batch step.
///
/// Gradients live in the `GradStore` returned by `backward()`, not on the
/// parameters, so `zero_grad` only resets optimizer-side bookkeeping; the
/// trainer drops its accumulated store at the same point.
pub trait Optimizer {
    fn step(&mut self, grads: &GradStore) -> Result<(), TrainingError>;
    fn zero_grad(&mut self);
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
}

/// Adapts any `candle_nn` optimizer (SGD, AdamW, ...) to [`Optimizer`].
#[derive(Debug)]
pub struct CandleOptimizer<O> {
    inner: O,
    steps: usize,
}

impl<O: candle_nn::Optimizer> CandleOptimizer<O> {
    pub fn new(vars: Vec<Var>, config: O::Config) -> Result<Self, TrainingError> {
        if vars.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        let inner = O::new(vars, config)?;
        Ok(Self::from_optimizer(inner))
    }

    pub fn from_optimizer(inner: O) -> Self {
        Self { inner, steps: 0 }
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> usize {
        self.steps
    }
}

impl<O: candle_nn::Optimizer> Optimizer for CandleOptimizer<O> {
    fn step(&mut self, grads: &GradStore) -> Result<(), TrainingError> {
        self.inner.step(grads)?;
        self.steps += 1;
        Ok(())
    }

    fn zero_grad(&mut self) {}

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }
}
