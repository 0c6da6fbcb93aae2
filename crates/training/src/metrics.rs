use std::time::{Duration, Instant};

/// Sample-weighted running mean of a per-batch loss.
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    sum: f64,
    count: u64,
    avg: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` as the mean over `n` samples.
    pub fn update(&mut self, value: f64, n: usize) {
        if n == 0 {
            return;
        }
        self.sum += value * n as f64;
        self.count += n as u64;
        self.avg = self.sum / self.count as f64;
    }

    pub fn avg(&self) -> f64 {
        self.avg
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Losses recorded for one completed epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochResult {
    pub epoch: usize,
    pub train_loss: f64,
    pub valid_loss: f64,
    pub learning_rate: f64,
    pub duration: Duration,
}

/// Per-epoch wall clock.
#[derive(Debug)]
pub struct EpochTimer {
    start: Instant,
}

impl EpochTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
