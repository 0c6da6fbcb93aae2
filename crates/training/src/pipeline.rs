use std::{fs, path::Path, sync::Arc};

use model::{DetectionModel, DetectorConfig, QueryDetector};

use crate::{
    checkpoint,
    data::{split_table, DataLoader, DataTable, FrameSource, Partition, Splits},
    logging::Logger,
    trainer::{select_device, Trainer, TrainingSummary},
    TrainingConfig, TrainingError,
};

/// Everything a finished run reports back to the caller.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub train_examples: usize,
    pub validation_examples: usize,
    pub test_examples: usize,
    pub summary: TrainingSummary,
    /// Mean loss over the held-out partition, when `runtime.evaluate_test` is set.
    pub test_loss: Option<f64>,
}

/// Full job: directories, log, partitioning, loaders, model, epoch loop.
pub fn run(config: &TrainingConfig) -> Result<RunReport, TrainingError> {
    run_with_weights(config, None)
}

/// Like [`run`], optionally warm-starting the detector from a weight file.
pub fn run_with_weights(
    config: &TrainingConfig,
    initial_weights: Option<&Path>,
) -> Result<RunReport, TrainingError> {
    config.validate()?;
    create_dir(&config.runtime.checkpoint.directory)?;
    create_dir(&config.runtime.logging.directory)?;

    let mut logger = Logger::from_config(&config.runtime.logging)?;
    logger.info("Training started")?;

    let table = DataTable::from_csv(&config.data.table_path)?;
    if table.is_empty() {
        logger.warn(format!(
            "frame table {} has no rows",
            config.data.table_path.display()
        ))?;
    }
    let Splits {
        train,
        validation,
        test,
    } = split_table(&table, &config.data.split)?;
    for partition in [&train, &validation, &test] {
        logger.info(format!(
            "{} partition: {} examples",
            partition.kind(),
            partition.len()
        ))?;
    }

    let train_loader = loader(config, &train, true)?;
    let val_loader = loader(config, &validation, false)?;
    let test_loader = loader(config, &test, false)?;

    let device = select_device();
    let mut detector_cfg = DetectorConfig::new(
        config.model.num_classes,
        config.model.num_queries,
        config.model.hidden_dim,
        device,
    );
    detector_cfg.dropout_p = config.model.dropout;
    let detector = QueryDetector::new(detector_cfg)?;
    if let Some(path) = initial_weights {
        checkpoint::load_model_weights(detector.varmap(), path)?;
        logger.info(format!("loaded initial weights from {}", path.display()))?;
    }

    let mut trainer = Trainer::new(config.clone(), Box::new(detector), logger)?;
    let summary = trainer.run(&train_loader, &val_loader)?;

    let test_loss = if config.runtime.evaluate_test {
        let loss = trainer.evaluate(&test_loader)?;
        trainer
            .logger_mut()
            .info(format!("|TEST| LOSS {}| EXAMPLES {}|", loss, test.len()))?;
        Some(loss)
    } else {
        None
    };

    trainer.logger_mut().info("Training completed")?;
    trainer.logger_mut().flush();

    Ok(RunReport {
        train_examples: train.len(),
        validation_examples: validation.len(),
        test_examples: test.len(),
        summary,
        test_loss,
    })
}

fn loader(
    config: &TrainingConfig,
    partition: &Partition,
    shuffle: bool,
) -> Result<DataLoader, TrainingError> {
    let source = FrameSource::new(
        partition,
        &config.data.root_dir,
        config.data.image_size,
        &config.data.columns,
    )?;
    DataLoader::new(
        Arc::new(source),
        config.data.batch_size,
        shuffle,
        config.data.num_workers,
        config.runtime.seed,
    )
}

fn create_dir(path: &Path) -> Result<(), TrainingError> {
    fs::create_dir_all(path).map_err(|err| {
        TrainingError::initialization(format!(
            "failed to create directory {}: {err}",
            path.display()
        ))
    })
}
