use serde::{Deserialize, Serialize};

use crate::{
    config::{PlateauMode, SchedulerConfig},
    TrainingError,
};

/// Learning-rate policy driven by a per-epoch metric.
pub trait LRScheduler: Send {
    /// Feeds one observation of the monitored metric and returns the rate to use next.
    fn step(&mut self, metric: f64) -> f64;
    fn learning_rate(&self) -> f64;
}

/// Serializable view of the plateau tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub learning_rate: f64,
    pub best: f64,
    pub num_bad_epochs: usize,
    pub steps: usize,
    pub reductions: usize,
}

/// Halves (by `factor`) the rate once the metric stops improving for more
/// than `patience` consecutive steps.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    mode: PlateauMode,
    factor: f64,
    patience: usize,
    threshold: f64,
    min_lr: f64,
    eps: f64,
    current_lr: f64,
    best: f64,
    num_bad_epochs: usize,
    steps: usize,
    reductions: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(cfg: &SchedulerConfig, base_lr: f64) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if !(cfg.factor > 0.0 && cfg.factor < 1.0) {
            return Err(TrainingError::initialization(
                "plateau factor must be in (0, 1)",
            ));
        }
        if cfg.min_lr < 0.0 || cfg.min_lr > base_lr {
            return Err(TrainingError::initialization(
                "scheduler min_lr must be in [0, base_lr]",
            ));
        }
        let best = match cfg.mode {
            PlateauMode::Min => f64::INFINITY,
            PlateauMode::Max => f64::NEG_INFINITY,
        };
        Ok(Self {
            mode: cfg.mode,
            factor: cfg.factor,
            patience: cfg.patience,
            threshold: cfg.threshold,
            min_lr: cfg.min_lr,
            eps: 1e-8,
            current_lr: base_lr,
            best,
            num_bad_epochs: 0,
            steps: 0,
            reductions: 0,
        })
    }

    pub fn num_bad_epochs(&self) -> usize {
        self.num_bad_epochs
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn reductions(&self) -> usize {
        self.reductions
    }

    pub fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            learning_rate: self.current_lr,
            best: self.best,
            num_bad_epochs: self.num_bad_epochs,
            steps: self.steps,
            reductions: self.reductions,
        }
    }

    fn is_better(&self, metric: f64) -> bool {
        match self.mode {
            PlateauMode::Min => metric < self.best * (1.0 - self.threshold),
            PlateauMode::Max => metric > self.best * (1.0 + self.threshold),
        }
    }

    fn reduce(&mut self) {
        let candidate = (self.current_lr * self.factor).max(self.min_lr);
        if self.current_lr - candidate > self.eps {
            self.current_lr = candidate;
            self.reductions += 1;
        }
    }
}

impl LRScheduler for ReduceLrOnPlateau {
    fn step(&mut self, metric: f64) -> f64 {
        self.steps = self.steps.saturating_add(1);

        if metric.is_finite() && self.is_better(metric) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.num_bad_epochs > self.patience {
            self.reduce();
            self.num_bad_epochs = 0;
        }

        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}
