//! Set-prediction objective: bipartite matching of queries to ground-truth
//! objects followed by classification and box regression terms.

pub mod boxes;
mod criterion;
mod matcher;

pub use criterion::{LossMetrics, LossOutput, LossTerm, LossWeights, SetCriterion};
pub use matcher::{linear_sum_assignment, HungarianMatcher, MatchIndices};

fn to_runtime_error(err: candle_core::Error) -> crate::TrainingError {
    crate::TrainingError::runtime(err.to_string())
}
