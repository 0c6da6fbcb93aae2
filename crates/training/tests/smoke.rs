use std::{fs, path::Path};

use image::{Rgb, RgbImage};
use tempfile::tempdir;
use training::{pipeline, TrainingConfig};

const CONFIG: &str = r#"
[data]
table_path = "frames.csv"
root_dir = "frames"
batch_size = 4
image_size = 16

[data.split]
max_train_rows = 20
validation_fraction = 0.2
seed = 42

[model]
num_classes = 3
num_queries = 6
hidden_dim = 16

[optimizer]
learning_rate = 0.001

[runtime]
epochs = 2
seed = 42

[runtime.checkpoint]
directory = "checkpoint"

[runtime.logging]
directory = "logs"
enable_stdout = false
tensorboard = "logs/tb"
"#;

/// 30 train-labeled rows and 5 held-out rows over a handful of synthetic frames.
fn write_fixture(root: &Path) {
    let frames = root.join("frames");
    fs::create_dir_all(&frames).unwrap();
    for idx in 0..4u8 {
        let img = RgbImage::from_fn(24, 18, |x, y| {
            Rgb([idx * 40, (x * 10) as u8, (y * 12) as u8])
        });
        img.save(frames.join(format!("frame_{idx}.png"))).unwrap();
    }

    let mut csv = String::from("frame_path,boxes,labels,split\n");
    for row in 0..35usize {
        let split = if row < 30 { "train" } else { "val-new-cl" };
        let (boxes, labels) = if row % 5 == 0 {
            ("[]".to_string(), "[]".to_string())
        } else {
            (
                format!(
                    "\"[[0.5,0.5,0.3,0.4],[0.{},0.3,0.1,0.2]]\"",
                    row % 9 + 1
                ),
                format!("\"[{},{}]\"", row % 2, (row + 1) % 2),
            )
        };
        csv.push_str(&format!(
            "frame_{}.png,{},{},{}\n",
            row % 4,
            boxes,
            labels,
            split
        ));
    }
    fs::write(root.join("frames.csv"), csv).unwrap();
    fs::write(root.join("qgdetr.toml"), CONFIG).unwrap();
}

fn log_messages(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter_map(|line| line.split_once(" - INFO - ").map(|(_, m)| m.to_string()))
        .collect()
}

#[test]
fn smoke_two_epoch_run() {
    let dir = tempdir().expect("tempdir");
    write_fixture(dir.path());

    let config = TrainingConfig::load(dir.path().join("qgdetr.toml")).expect("config");
    assert!(config.data.table_path.is_absolute());

    let report = pipeline::run(&config).expect("training run");

    assert_eq!(report.train_examples, 16);
    assert_eq!(report.validation_examples, 4);
    assert_eq!(report.test_examples, 5);
    assert_eq!(report.summary.epochs.len(), 2);
    assert_eq!(report.test_loss, None);

    let checkpoint_dir = dir.path().join("checkpoint");
    for epoch in 1..=2 {
        let path = checkpoint_dir.join(format!("QGdetrF_best_no_aug{epoch}exp_logs.safetensors"));
        assert!(path.is_file(), "missing checkpoint {}", path.display());
    }
    assert_eq!(fs::read_dir(&checkpoint_dir).unwrap().count(), 2);
    for record in &report.summary.checkpoints {
        record.verify().expect("checkpoint digest");
    }

    let messages = log_messages(&dir.path().join("logs/training_logs.txt"));
    assert_eq!(messages.first().map(String::as_str), Some("Training started"));
    assert_eq!(messages.last().map(String::as_str), Some("Training completed"));
    assert!(messages.contains(&"***** Running training *****".to_string()));
    assert!(messages.contains(&"  Num examples = 16".to_string()));
    assert!(messages.contains(&"  Num Epochs = 2".to_string()));
    assert!(messages.contains(&"train partition: 16 examples".to_string()));
    assert!(messages.contains(&"validation partition: 4 examples".to_string()));
    assert!(messages.contains(&"test partition: 5 examples".to_string()));
    assert_eq!(
        messages
            .iter()
            .filter(|m| m.starts_with("|EPOCH "))
            .count(),
        2
    );

    let best: Vec<&String> = messages
        .iter()
        .filter(|m| m.starts_with("Best model found"))
        .collect();
    assert!(!best.is_empty() && best.len() <= 2);
    assert_eq!(best[0], "Best model found at Epoch 1........Saving Model");
    let second_improved =
        report.summary.epochs[1].valid_loss < report.summary.epochs[0].valid_loss;
    assert_eq!(best.len() == 2, second_improved);

    assert!(dir.path().join("logs/tb").read_dir().unwrap().count() >= 1);
}

#[test]
fn warm_start_and_test_evaluation() {
    let dir = tempdir().expect("tempdir");
    write_fixture(dir.path());

    let mut config = TrainingConfig::load(dir.path().join("qgdetr.toml")).expect("config");
    config.runtime.epochs = 1;
    let first = pipeline::run(&config).expect("first run");
    let weights = first.summary.checkpoints[0].path.clone();

    config.runtime.evaluate_test = true;
    config.runtime.checkpoint.directory = dir.path().join("checkpoint_resumed");
    let second = pipeline::run_with_weights(&config, Some(&weights)).expect("warm start");

    let test_loss = second.test_loss.expect("test loss");
    assert!(test_loss.is_finite());

    let messages = log_messages(&dir.path().join("logs/training_logs.txt"));
    // Both runs append to the same log.
    assert_eq!(
        messages.iter().filter(|m| *m == "Training started").count(),
        2
    );
    assert!(messages
        .iter()
        .any(|m| m.starts_with("loaded initial weights from ")));
    assert!(messages.iter().any(|m| m.starts_with("|TEST| LOSS ")));
}
