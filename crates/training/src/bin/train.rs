use std::path::PathBuf;

use clap::Parser;
use training::{pipeline, TrainingConfig, TrainingError};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Query-based detector training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        default_value = "configs/qgdetr.toml",
        help = "Path to training config file"
    )]
    config: PathBuf,

    #[arg(long, value_name = "N", help = "Override runtime.epochs")]
    epochs: Option<usize>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Initialize the detector from a saved safetensors weight file"
    )]
    init_weights: Option<PathBuf>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if let Some(epochs) = args.epochs {
        config.runtime.epochs = epochs;
    }
    config.validate()?;

    let report = pipeline::run_with_weights(&config, args.init_weights.as_deref())?;

    println!(
        "finished {} epochs (train={}, val={}, test={})",
        report.summary.epochs.len(),
        report.train_examples,
        report.validation_examples,
        report.test_examples
    );
    if let Some(epoch) = report.summary.best_epoch {
        println!(
            "best validation loss {:.6} at epoch {}",
            report.summary.best_loss,
            epoch + 1
        );
    }
    if let Some(loss) = report.test_loss {
        println!("test loss {:.6}", loss);
    }
    Ok(())
}
