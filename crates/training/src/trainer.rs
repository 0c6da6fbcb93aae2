use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use model::DetectionModel;

use crate::{
    checkpoint::{self, CheckpointRecord},
    data::DataLoader,
    logging::Logger,
    loss::{LossOutput, SetCriterion},
    metrics::{AverageMeter, EpochResult, EpochTimer},
    optimizer::TrainerOptimizer,
    scheduler::{LRScheduler, ReduceLrOnPlateau, SchedulerState},
    TrainingConfig, TrainingError,
};

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub epochs: Vec<EpochResult>,
    /// Lowest validation loss seen; infinite if no epoch produced a finite loss.
    pub best_loss: f64,
    /// Zero-based index of the epoch that produced `best_loss`.
    pub best_epoch: Option<usize>,
    pub checkpoints: Vec<CheckpointRecord>,
}

/// Epoch-loop driver: train, validate, adapt the learning rate, checkpoint,
/// and track the best validation loss.
pub struct Trainer {
    config: TrainingConfig,
    model: Box<dyn DetectionModel>,
    criterion: SetCriterion,
    optimizer: TrainerOptimizer,
    scheduler: ReduceLrOnPlateau,
    logger: Logger,
    best_loss: f64,
    best_epoch: Option<usize>,
    epoch: usize,
}

impl Trainer {
    pub fn new(
        config: TrainingConfig,
        model: Box<dyn DetectionModel>,
        logger: Logger,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        let criterion = SetCriterion::from_config(&config.loss, config.model.num_classes)?;
        let optimizer = TrainerOptimizer::from_varmap(model.varmap(), &config.optimizer)?;
        let scheduler =
            ReduceLrOnPlateau::new(&config.scheduler, config.optimizer.learning_rate)?;

        Ok(Self {
            config,
            model,
            criterion,
            optimizer,
            scheduler,
            logger,
            best_loss: f64::INFINITY,
            best_epoch: None,
            epoch: 0,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &dyn DetectionModel {
        self.model.as_ref()
    }

    pub fn logger_mut(&mut self) -> &mut Logger {
        &mut self.logger
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.snapshot()
    }

    /// Runs every remaining epoch of the configured budget.
    pub fn run(
        &mut self,
        train: &DataLoader,
        validation: &DataLoader,
    ) -> Result<TrainingSummary, TrainingError> {
        let epochs = self.config.runtime.epochs;
        self.logger.info("***** Running training *****")?;
        self.logger.info(format!("  Num examples = {}", train.len()))?;
        self.logger.info(format!("  Num Epochs = {}", epochs))?;
        self.logger.info(format!(
            "  Number of GPUs = {}",
            gpu_count(self.model.device())
        ))?;
        if validation.is_empty() {
            self.logger
                .warn("validation partition is empty; validation loss will read 0")?;
        }

        let mut results = Vec::with_capacity(epochs.saturating_sub(self.epoch));
        let mut checkpoints = Vec::with_capacity(epochs.saturating_sub(self.epoch));

        while self.epoch < epochs {
            let epoch = self.epoch;
            let timer = EpochTimer::start();

            let train_loss = self.train_epoch(train, epoch)?;
            let valid_loss = self.evaluate(validation)?;

            let previous_lr = self.optimizer.learning_rate();
            let lr = self.scheduler.step(valid_loss);
            self.optimizer.set_learning_rate(lr);
            if lr < previous_lr {
                self.logger.info(format!(
                    "Epoch {}: reducing learning rate to {:.4e}",
                    epoch + 1,
                    lr
                ))?;
            }

            let result = EpochResult {
                epoch,
                train_loss,
                valid_loss,
                learning_rate: lr,
                duration: timer.elapsed(),
            };
            self.logger.log_epoch(&result)?;
            if !self.logger.echoes_stdout() {
                println!(
                    "|EPOCH {}| TRAIN_LOSS {}| VALID_LOSS {}|",
                    epoch + 1,
                    train_loss,
                    valid_loss
                );
            }

            let path = checkpoint::checkpoint_path(&self.config.runtime.checkpoint, epoch);
            let record = checkpoint::save_model_weights(self.model.varmap(), &path)?;
            self.logger.log_checkpoint(&record)?;
            checkpoints.push(record);

            if valid_loss < self.best_loss {
                self.best_loss = valid_loss;
                self.best_epoch = Some(epoch);
                let message = format!("Best model found at Epoch {}........Saving Model", epoch + 1);
                self.logger.info(&message)?;
                if !self.logger.echoes_stdout() {
                    println!("{message}");
                }
                if self.config.runtime.checkpoint.save_best {
                    let best_path = checkpoint::best_checkpoint_path(&self.config.runtime.checkpoint);
                    let record = checkpoint::save_model_weights(self.model.varmap(), &best_path)?;
                    self.logger.log_checkpoint(&record)?;
                }
            }

            results.push(result);
            self.epoch += 1;
        }

        self.logger.flush();
        Ok(TrainingSummary {
            epochs: results,
            best_loss: self.best_loss,
            best_epoch: self.best_epoch,
            checkpoints,
        })
    }

    /// One pass over `loader` with parameter updates. Returns the
    /// sample-weighted mean loss.
    pub fn train_epoch(&mut self, loader: &DataLoader, epoch: usize) -> Result<f64, TrainingError> {
        self.model.set_training(true);
        let mut meter = AverageMeter::new();

        for batch in loader.batches(epoch) {
            let batch = batch?;
            if batch.is_empty() {
                continue;
            }
            let outputs = self.model.forward(&batch.inputs)?;
            let LossOutput { loss, metrics } = self.criterion.compute(&outputs, &batch.targets)?;
            if !metrics.total.is_finite() {
                return Err(TrainingError::runtime(format!(
                    "non-finite training loss at epoch {}",
                    epoch + 1
                )));
            }
            self.optimizer.step(&loss)?;
            meter.update(metrics.total, batch.len());
        }

        Ok(meter.avg())
    }

    /// Loss pass without updates. The model's training flag is restored
    /// afterwards.
    pub fn evaluate(&mut self, loader: &DataLoader) -> Result<f64, TrainingError> {
        let was_training = self.model.is_training();
        self.model.set_training(false);

        let result: Result<f64, TrainingError> = (|| {
            let mut meter = AverageMeter::new();
            for batch in loader.batches(0) {
                let batch = batch?;
                if batch.is_empty() {
                    continue;
                }
                let outputs = self.model.forward(&batch.inputs)?.detach();
                let LossOutput { metrics, .. } = self.criterion.compute(&outputs, &batch.targets)?;
                meter.update(metrics.total, batch.len());
            }
            Ok(meter.avg())
        })();

        self.model.set_training(was_training);
        result
    }
}

/// Prefers Metal, then CUDA, falling back to CPU.
pub fn select_device() -> Device {
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => return device,
            Err(err) => eprintln!("failed to initialize metal device, falling back: {err}"),
        }
    }
    if cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => return device,
            Err(err) => eprintln!("cuda reported available but initialization failed: {err}"),
        }
    }
    Device::Cpu
}

/// Accelerators used by a single-device run.
pub fn gpu_count(device: &Device) -> usize {
    if device.is_cuda() || device.is_metal() {
        1
    } else {
        0
    }
}
