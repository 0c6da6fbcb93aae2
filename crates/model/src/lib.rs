pub mod config;
pub mod model;

pub use config::DetectorConfig;
pub use model::{DetectionModel, DetectionOutput, QueryDetector};
