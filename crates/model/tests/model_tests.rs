use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{DetectionModel, DetectorConfig, QueryDetector};

fn build_config() -> DetectorConfig {
    DetectorConfig {
        num_classes: 4,
        num_queries: 5,
        hidden_dim: 16,
        backbone_channels: vec![8],
        bbox_head_layers: 2,
        dropout_p: None,
        dtype: DType::F32,
        device: Device::Cpu,
    }
}

fn frames(count: usize) -> Result<Vec<Tensor>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(Tensor::rand(0f32, 1f32, (3, 16, 16), &Device::Cpu)?);
    }
    Ok(out)
}

#[test]
fn forward_produces_per_query_logits_and_boxes() -> Result<()> {
    let detector = QueryDetector::new(build_config())?;

    let output = detector.forward(&frames(2)?)?;

    assert_eq!(output.logits.dims(), &[2, 5, 4]);
    assert_eq!(output.boxes.dims(), &[2, 5, 4]);
    let boxes = output.boxes.flatten_all()?.to_vec1::<f32>()?;
    assert!(boxes.iter().all(|v| (0.0..=1.0).contains(v)));
    Ok(())
}

#[test]
fn forward_rejects_mismatched_frames() -> Result<()> {
    let detector = QueryDetector::new(build_config())?;
    let inputs = vec![
        Tensor::zeros((3, 16, 16), DType::F32, &Device::Cpu)?,
        Tensor::zeros((3, 8, 8), DType::F32, &Device::Cpu)?,
    ];

    assert!(detector.forward(&inputs).is_err());
    assert!(detector.forward(&[]).is_err());
    Ok(())
}

#[test]
fn parameters_are_registered_by_name() -> Result<()> {
    let detector = QueryDetector::new(build_config())?;
    let names: Vec<String> = detector
        .varmap()
        .data()
        .lock()
        .expect("varmap lock")
        .keys()
        .cloned()
        .collect();

    assert!(names.iter().any(|n| n.starts_with("backbone.0")));
    assert!(names.iter().any(|n| n.starts_with("query_embed")));
    assert!(names.iter().any(|n| n.starts_with("class_embed")));
    assert!(names.iter().any(|n| n.starts_with("bbox_embed.1")));
    Ok(())
}

#[test]
fn evaluation_mode_is_deterministic() -> Result<()> {
    let mut config = build_config();
    config.dropout_p = Some(0.5);
    let detector = QueryDetector::new(config)?;
    detector.set_training(false);
    assert!(!detector.is_training());

    let inputs = frames(1)?;
    let first = detector.forward(&inputs)?.logits.flatten_all()?.to_vec1::<f32>()?;
    let second = detector.forward(&inputs)?.logits.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn config_validation_rejects_single_class() {
    let mut config = build_config();
    config.num_classes = 1;
    assert!(QueryDetector::new(config).is_err());
}
