pub mod checkpoint;
pub mod config;
pub mod data;
pub mod epoch;
pub mod history;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod seed;
pub mod trainer;

pub use checkpoint::{CheckpointManager, CheckpointRecord, CheckpointSlots};
pub use config::{SelectionMetric, TrainingConfig, TrainingError};
pub use data::{
    split_data_subsets, BatchSource, DataLoader, Dataset, SplitIndices, SplitStrategy,
    TensorDataset,
};
pub use logging::{
    Logger, LoggingSettings, MemorySink, MetricsSink, NullSink, TensorBoardWriter,
};
pub use loss::{subs_weighted_bce, CrossEntropyLoss, LossFunction, Reduction, SubstructureBce};
pub use optimizer::{AdamConfig, TrainerOptimizer};
pub use scheduler::{LRScheduler, SchedulerConfig};
pub use seed::Determinism;
pub use trainer::{DataSplits, FitOptions, FitOutcome, Trainer};
