//! Data pipeline: labeled table → partitions → samples → batches.

pub mod loader;
pub mod source;
pub mod split;
pub mod table;

pub use loader::{collate, Batch, Batches, DataLoader};
pub use source::{FrameSource, InMemorySource, Sample, SampleSource, Target};
pub use split::{split_table, Partition, PartitionKind, Splits};
pub use table::{DataTable, TableRow};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;
