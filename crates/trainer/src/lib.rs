pub mod checkpoint;
pub mod config;
pub mod data;
pub mod ema;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod network;
pub mod optimizer;
pub mod profile;
pub mod scheduler;
pub mod trainer;
pub mod visualize;

pub use checkpoint::{CheckpointRecord, LoadedCheckpoint};
pub use config::{
    DeviceSpec, LoggingConfig, OutputPaths, TrainerSettings, TrainingConfig, TrainingError,
    VisualizationConfig,
};
pub use data::{Batch, DataLoader, InMemoryLoader, SampleMeta};
pub use ema::EmaState;
pub use logging::{MetricsSink, NullSink, TensorBoardWriter};
pub use loss::{Loss, LossOutput, MultiHeadMse};
pub use metrics::{BatchLosses, EpochAccumulator};
pub use network::Network;
pub use optimizer::{CandleOptimizer, Optimizer};
pub use scheduler::{LRScheduler, ScheduleStrategy, SchedulerConfig};
pub use trainer::{EpochSummary, Trainer};
