use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{Device, Error, Result, Tensor, D};
use candle_nn::{ops, Conv2d, Conv2dConfig, Embedding, Linear, Module, VarBuilder, VarMap};

use crate::config::DetectorConfig;

/// Raw per-query predictions for a batch of frames.
#[derive(Debug, Clone)]
pub struct DetectionOutput {
    /// Class logits shaped `(batch, queries, num_classes)`; the last class is no-object.
    pub logits: Tensor,
    /// Normalized `(cx, cy, w, h)` boxes shaped `(batch, queries, 4)`.
    pub boxes: Tensor,
}

impl DetectionOutput {
    pub fn detach(&self) -> Self {
        Self {
            logits: self.logits.detach(),
            boxes: self.boxes.detach(),
        }
    }
}

/// Set-prediction network driven by the trainer.
///
/// Implementations own their parameters in a [`VarMap`] so checkpoints and
/// optimizers can address them by name.
pub trait DetectionModel: Send + Sync {
    fn forward(&self, inputs: &[Tensor]) -> Result<DetectionOutput>;

    /// Switches layers such as dropout between training and evaluation behaviour.
    fn set_training(&self, training: bool);

    fn is_training(&self) -> bool;

    fn varmap(&self) -> &VarMap;

    fn device(&self) -> &Device;
}

/// Small DETR-style detector: a strided conv backbone pooled into a frame
/// embedding, a fixed set of learned object queries, and per-query class and
/// box heads.
pub struct QueryDetector {
    config: DetectorConfig,
    varmap: VarMap,
    backbone: Vec<Conv2d>,
    input_proj: Linear,
    query_embed: Embedding,
    decoder: Linear,
    class_head: Linear,
    bbox_head: Vec<Linear>,
    training: AtomicBool,
}

impl QueryDetector {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);

        let conv_cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let mut backbone = Vec::with_capacity(config.backbone_channels.len() + 1);
        let mut in_channels = 3;
        let widths = config
            .backbone_channels
            .iter()
            .copied()
            .chain(std::iter::once(config.hidden_dim));
        for (idx, out_channels) in widths.enumerate() {
            backbone.push(candle_nn::conv2d(
                in_channels,
                out_channels,
                3,
                conv_cfg,
                vb.pp(format!("backbone.{idx}")),
            )?);
            in_channels = out_channels;
        }

        let hidden = config.hidden_dim;
        let input_proj = candle_nn::linear(hidden, hidden, vb.pp("input_proj"))?;
        let query_embed = candle_nn::embedding(config.num_queries, hidden, vb.pp("query_embed"))?;
        let decoder = candle_nn::linear(hidden, hidden, vb.pp("decoder"))?;
        let class_head = candle_nn::linear(hidden, config.num_classes, vb.pp("class_embed"))?;

        let mut bbox_head = Vec::with_capacity(config.bbox_head_layers);
        for layer in 0..config.bbox_head_layers {
            let out_dim = if layer + 1 == config.bbox_head_layers {
                4
            } else {
                hidden
            };
            bbox_head.push(candle_nn::linear(
                hidden,
                out_dim,
                vb.pp(format!("bbox_embed.{layer}")),
            )?);
        }

        Ok(Self {
            config,
            varmap,
            backbone,
            input_proj,
            query_embed,
            decoder,
            class_head,
            bbox_head,
            training: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn stack_inputs(&self, inputs: &[Tensor]) -> Result<Tensor> {
        if inputs.is_empty() {
            return Err(Error::Msg("detector received an empty batch".into()));
        }
        let expected = inputs[0].dims();
        if expected.len() != 3 || expected[0] != 3 {
            return Err(Error::Msg(format!(
                "frames must be shaped [3, height, width], got {:?}",
                expected
            )));
        }
        for (idx, frame) in inputs.iter().enumerate().skip(1) {
            if frame.dims() != expected {
                return Err(Error::Msg(format!(
                    "frame {} has shape {:?}, expected {:?}",
                    idx,
                    frame.dims(),
                    expected
                )));
            }
        }
        Tensor::stack(inputs, 0)?
            .to_device(&self.config.device)?
            .to_dtype(self.config.dtype)
    }

    fn maybe_dropout(&self, xs: Tensor) -> Result<Tensor> {
        match self.config.dropout_p {
            Some(p) if p > 0.0 && self.is_training() => ops::dropout(&xs, p),
            _ => Ok(xs),
        }
    }
}

impl DetectionModel for QueryDetector {
    fn forward(&self, inputs: &[Tensor]) -> Result<DetectionOutput> {
        let mut features = self.stack_inputs(inputs)?;
        for conv in &self.backbone {
            features = conv.forward(&features)?.relu()?;
        }
        // (batch, hidden, h, w) -> (batch, hidden)
        let pooled = features.flatten_from(2)?.mean(2)?;
        let frame_embed = self.input_proj.forward(&pooled)?.relu()?;

        let queries = self.query_embed.embeddings().unsqueeze(0)?;
        let hidden = frame_embed.unsqueeze(1)?.broadcast_add(&queries)?;
        let hidden = self.decoder.forward(&hidden)?.relu()?;
        let hidden = self.maybe_dropout(hidden)?;

        let logits = self.class_head.forward(&hidden)?;

        let mut boxes = hidden;
        let last = self.bbox_head.len() - 1;
        for (idx, layer) in self.bbox_head.iter().enumerate() {
            boxes = layer.forward(&boxes)?;
            if idx < last {
                boxes = boxes.relu()?;
            }
        }
        let boxes = ops::sigmoid(&boxes)?;

        if logits.dim(D::Minus1)? != self.config.num_classes {
            return Err(Error::Msg("class head produced unexpected width".into()));
        }

        Ok(DetectionOutput { logits, boxes })
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn device(&self) -> &Device {
        &self.config.device
    }
}
