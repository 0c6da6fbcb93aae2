pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod pipeline;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::CheckpointRecord;
pub use config::{TrainingConfig, TrainingError};
pub use data::{split_table, Batch, DataLoader, DataTable, SampleSource, Splits, Target};
pub use logging::{Logger, LoggingSettings};
pub use loss::{HungarianMatcher, LossMetrics, LossOutput, SetCriterion};
pub use metrics::{AverageMeter, EpochResult};
pub use optimizer::TrainerOptimizer;
pub use pipeline::{run, RunReport};
pub use scheduler::{LRScheduler, ReduceLrOnPlateau, SchedulerState};
pub use trainer::{Trainer, TrainingSummary};
