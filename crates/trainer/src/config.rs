use candle_core::Device;
use serde::Deserialize;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};
use transforms::AugmentationConfig;

use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub visualization: Option<VisualizationConfig>,
    #[serde(default)]
    pub augmentation: AugmentationConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.trainer.output.as_os_str().is_empty() {
            errors.push("trainer.output must not be empty".to_string());
        }

        if self.trainer.epochs == 0 {
            errors.push("trainer.epochs must be greater than 0".to_string());
        }

        if self.trainer.log_interval == 0 {
            errors.push("trainer.log_interval must be greater than 0".to_string());
        }

        if self.trainer.stride_apply == 0 {
            errors.push("trainer.stride_apply must be greater than 0".to_string());
        }

        if let Some(decay) = self.trainer.ema_decay {
            if !(decay > 0.0 && decay <= 1.0) {
                errors.push(format!("trainer.ema_decay must be in (0, 1] (got {decay})"));
            }
        }

        if let Some(profile) = &self.trainer.profile {
            if profile.extension().and_then(|ext| ext.to_str()) != Some("json") {
                errors.push("trainer.profile must name a .json trace file".to_string());
            }
        }

        if let Some(device) = &self.trainer.device {
            if let Err(err) = DeviceSpec::parse(device) {
                errors.push(err);
            }
        }

        if self.logging.flush_every == 0 {
            errors.push("logging.flush_every must be greater than 0".to_string());
        }

        if let Some(vis) = &self.visualization {
            if vis.command.is_empty() {
                errors.push("visualization.command must name a program".to_string());
            }
            if vis.every_n_epochs == 0 || vis.every_n_batches == 0 {
                errors.push(
                    "visualization.every_n_epochs and every_n_batches must be greater than 0"
                        .to_string(),
                );
            }
        }

        errors.extend(self.scheduler.validation_errors());

        if let Err(err) = self.augmentation.validate() {
            errors.push(format!("augmentation: {err}"));
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.trainer.output, base);
        if let Some(profile) = self.trainer.profile.as_mut() {
            absolutize_in_place(profile, base);
        }
        if let Some(dir) = self.logging.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
        if let Some(vis) = self.visualization.as_mut() {
            absolutize_in_place(&mut vis.train_image_dir, base);
            absolutize_in_place(&mut vis.image_output_dir, base);
            if let Some(dir) = vis.working_dir.as_mut() {
                absolutize_in_place(dir, base);
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainerConfig {
    /// Checkpoint base path; epoch files are written next to it.
    pub output: PathBuf,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default)]
    pub fix_batch_norm: bool,
    #[serde(default = "default_stride_apply")]
    pub stride_apply: usize,
    #[serde(default)]
    pub ema_decay: Option<f64>,
    #[serde(default)]
    pub profile: Option<PathBuf>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            tensorboard_dir: None,
            flush_every: default_flush_every(),
        }
    }
}

/// External prediction job whose rendered images are pushed to the
/// metrics sink during training.
#[derive(Debug, Clone, Deserialize)]
pub struct VisualizationConfig {
    /// Program followed by its leading arguments.
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Directory the batch `file_name`s are relative to.
    pub train_image_dir: PathBuf,
    pub image_output_dir: PathBuf,
    #[serde(default = "default_vis_every_n_epochs")]
    pub every_n_epochs: usize,
    #[serde(default = "default_vis_every_n_batches")]
    pub every_n_batches: usize,
}

/// Resolved trainer options with the device materialized.
#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub output: PathBuf,
    pub log_interval: usize,
    pub fix_batch_norm: bool,
    pub stride_apply: usize,
    pub ema_decay: Option<f64>,
    pub profile: Option<PathBuf>,
    pub device: Option<Device>,
    pub meta: serde_json::Value,
    pub visualization: Option<VisualizationConfig>,
}

impl TrainerSettings {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            log_interval: default_log_interval(),
            fix_batch_norm: false,
            stride_apply: default_stride_apply(),
            ema_decay: None,
            profile: None,
            device: None,
            meta: serde_json::Value::Null,
            visualization: None,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Result<Self, TrainingError> {
        let trainer = &config.trainer;
        let device = match &trainer.device {
            Some(spec) => Some(
                DeviceSpec::parse(spec)
                    .map_err(|err| TrainingError::validation(vec![err]))?
                    .materialize()?,
            ),
            None => None,
        };
        Ok(Self {
            output: trainer.output.clone(),
            log_interval: trainer.log_interval,
            fix_batch_norm: trainer.fix_batch_norm,
            stride_apply: trainer.stride_apply,
            ema_decay: trainer.ema_decay,
            profile: trainer.profile.clone(),
            device,
            meta: trainer.meta.clone(),
            visualization: config.visualization.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    pub fn parse(value: &str) -> Result<Self, String> {
        let value = value.trim().to_ascii_lowercase();
        let ordinal = |rest: &str| {
            rest.parse::<usize>()
                .map_err(|_| format!("invalid device ordinal in '{value}'"))
        };
        match value.as_str() {
            "cpu" => Ok(DeviceSpec::Cpu),
            "cuda" => Ok(DeviceSpec::Cuda(0)),
            "metal" => Ok(DeviceSpec::Metal(0)),
            other => {
                if let Some(rest) = other.strip_prefix("cuda:") {
                    Ok(DeviceSpec::Cuda(ordinal(rest)?))
                } else if let Some(rest) = other.strip_prefix("metal:") {
                    Ok(DeviceSpec::Metal(ordinal(rest)?))
                } else {
                    Err(format!(
                        "unsupported device '{other}' (expected cpu, cuda:N or metal:N)"
                    ))
                }
            }
        }
    }

    pub fn materialize(self) -> Result<Device, TrainingError> {
        match self {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|err| {
                TrainingError::initialization(format!("cuda:{ordinal} unavailable: {err}"))
            }),
            DeviceSpec::Metal(ordinal) => Device::new_metal(ordinal).map_err(|err| {
                TrainingError::initialization(format!("metal:{ordinal} unavailable: {err}"))
            }),
        }
    }
}

/// Directories the run writes into, created up front by the entry point.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub checkpoint_dir: PathBuf,
    pub tensorboard_dir: Option<PathBuf>,
    pub image_output_dir: Option<PathBuf>,
}

impl OutputPaths {
    pub fn prepare(config: &TrainingConfig) -> Result<Self, TrainingError> {
        let checkpoint_dir = match config.trainer.output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let paths = Self {
            checkpoint_dir,
            tensorboard_dir: config.logging.tensorboard_dir.clone(),
            image_output_dir: config
                .visualization
                .as_ref()
                .map(|vis| vis.image_output_dir.clone()),
        };
        for dir in std::iter::once(&paths.checkpoint_dir)
            .chain(paths.tensorboard_dir.iter())
            .chain(paths.image_output_dir.iter())
        {
            fs::create_dir_all(dir).map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to create output directory {}: {err}",
                    dir.display()
                ))
            })?;
        }
        Ok(paths)
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_epochs() -> usize {
    75
}

fn default_log_interval() -> usize {
    10
}

fn default_stride_apply() -> usize {
    1
}

fn default_flush_every() -> usize {
    20
}

fn default_vis_every_n_epochs() -> usize {
    30
}

fn default_vis_every_n_batches() -> usize {
    100
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    Tensor(candle_core::Error),
    /// After a checkpoint write a parameter was found off its training
    /// device, or no longer the tensor the optimizer steps. Training state is
    /// unusable past this point.
    DevicePlacement(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TrainingError::DevicePlacement(_))
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::Tensor(err) => write!(f, "tensor error: {}", err),
            TrainingError::DevicePlacement(msg) => {
                write!(f, "fatal: model parameters misplaced: {}", msg)
            }
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::Tensor(err) => Some(err),
            TrainingError::ConfigFormat(_)
            | TrainingError::Validation(_)
            | TrainingError::Initialization(_)
            | TrainingError::Runtime(_)
            | TrainingError::DevicePlacement(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Tensor(value)
    }
}

impl From<transforms::TransformError> for TrainingError {
    fn from(value: transforms::TransformError) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}
