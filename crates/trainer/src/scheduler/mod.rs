use serde::Deserialize;

use crate::TrainingError;

/// Per-batch learning-rate schedule.
pub trait LRScheduler: Send {
    /// Advances one step and returns the new rate.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStrategy {
    #[default]
    None,
    ConstantWithWarmup,
    WarmupStepDecay,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: ScheduleStrategy,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub warmup_steps: usize,
    /// Fraction of the base rate used at step 0 of the warm-up.
    #[serde(default = "default_warmup_start_factor")]
    pub warmup_start_factor: f64,
    #[serde(default)]
    pub decay_steps: Vec<usize>,
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: ScheduleStrategy::default(),
            learning_rate: default_learning_rate(),
            warmup_steps: 0,
            warmup_start_factor: default_warmup_start_factor(),
            decay_steps: Vec::new(),
            decay_factor: default_decay_factor(),
        }
    }
}

impl SchedulerConfig {
    pub(crate) fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.strategy == ScheduleStrategy::None {
            return errors;
        }
        if self.learning_rate <= 0.0 {
            errors.push("scheduler.learning_rate must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.warmup_start_factor) {
            errors.push("scheduler.warmup_start_factor must be in [0, 1]".to_string());
        }
        if !(self.decay_factor > 0.0 && self.decay_factor <= 1.0) {
            errors.push("scheduler.decay_factor must be in (0, 1]".to_string());
        }
        if self.decay_steps.windows(2).any(|w| w[0] >= w[1]) {
            errors.push("scheduler.decay_steps must be strictly increasing".to_string());
        }
        errors
    }

    pub fn build(&self) -> Result<Option<Box<dyn LRScheduler>>, TrainingError> {
        let errors = self.validation_errors();
        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }
        let warmup = Warmup {
            steps: self.warmup_steps,
            start_factor: self.warmup_start_factor,
        };
        Ok(match self.strategy {
            ScheduleStrategy::None => None,
            ScheduleStrategy::ConstantWithWarmup => {
                Some(Box::new(ConstantWithWarmup::new(self.learning_rate, warmup)))
            }
            ScheduleStrategy::WarmupStepDecay => Some(Box::new(WarmupStepDecay::new(
                self.learning_rate,
                warmup,
                self.decay_steps.clone(),
                self.decay_factor,
            ))),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Warmup {
    pub steps: usize,
    pub start_factor: f64,
}

impl Warmup {
    fn factor(&self, step: usize) -> f64 {
        if step >= self.steps {
            return 1.0;
        }
        let progress = step as f64 / self.steps as f64;
        self.start_factor + (1.0 - self.start_factor) * progress
    }
}

pub struct ConstantWithWarmup {
    base_lr: f64,
    warmup: Warmup,
    step: usize,
    current_lr: f64,
}

impl ConstantWithWarmup {
    pub fn new(base_lr: f64, warmup: Warmup) -> Self {
        Self {
            base_lr,
            warmup,
            step: 0,
            current_lr: base_lr * warmup.factor(0),
        }
    }
}

impl LRScheduler for ConstantWithWarmup {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.current_lr = self.base_lr * self.warmup.factor(self.step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

/// Linear warm-up, then the rate is multiplied by `decay_factor` at each
/// step boundary passed.
pub struct WarmupStepDecay {
    base_lr: f64,
    warmup: Warmup,
    decay_steps: Vec<usize>,
    decay_factor: f64,
    step: usize,
    current_lr: f64,
}

impl WarmupStepDecay {
    pub fn new(base_lr: f64, warmup: Warmup, decay_steps: Vec<usize>, decay_factor: f64) -> Self {
        let mut schedule = Self {
            base_lr,
            warmup,
            decay_steps,
            decay_factor,
            step: 0,
            current_lr: 0.0,
        };
        schedule.current_lr = schedule.compute_lr(0);
        schedule
    }

    fn compute_lr(&self, step: usize) -> f64 {
        let passed = self.decay_steps.iter().filter(|&&b| step >= b).count();
        self.base_lr * self.warmup.factor(step) * self.decay_factor.powi(passed as i32)
    }
}

impl LRScheduler for WarmupStepDecay {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.current_lr = self.compute_lr(self.step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_warmup_start_factor() -> f64 {
    1e-3
}

fn default_decay_factor() -> f64 {
    0.1
}
