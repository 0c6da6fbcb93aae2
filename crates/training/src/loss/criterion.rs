use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use model::DetectionOutput;

use super::{
    boxes::{cxcywh_to_xyxy, paired_generalized_iou},
    matcher::{HungarianMatcher, MatchIndices},
    to_runtime_error,
};
use crate::{config::LossConfig, data::Target, TrainingError};

const EPS: f64 = 1e-12;

/// Individually selectable loss families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossTerm {
    /// Weighted cross entropy over all queries.
    Labels,
    /// L1 and GIoU on matched boxes.
    Boxes,
    /// Predicted versus true object count; reported only.
    Cardinality,
}

/// Coefficients applied when summing the terms into the optimized scalar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeights {
    pub loss_ce: f64,
    pub loss_bbox: f64,
    pub loss_giou: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            loss_ce: 1.0,
            loss_bbox: 1.0,
            loss_giou: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossMetrics {
    pub loss_ce: f64,
    pub loss_bbox: f64,
    pub loss_giou: f64,
    pub cardinality_error: f64,
    pub total: f64,
}

#[derive(Debug)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

/// DETR-style set criterion.
///
/// `num_classes` counts real classes only; index `num_classes` of the logits
/// is the no-object class and is weighted by `eos_coef`.
#[derive(Debug, Clone)]
pub struct SetCriterion {
    num_classes: usize,
    matcher: HungarianMatcher,
    weights: LossWeights,
    eos_coef: f32,
    losses: Vec<LossTerm>,
    class_weights: Vec<f32>,
}

impl SetCriterion {
    pub fn new(
        num_classes: usize,
        matcher: HungarianMatcher,
        weights: LossWeights,
        eos_coef: f32,
        losses: Vec<LossTerm>,
    ) -> Result<Self, TrainingError> {
        if num_classes == 0 {
            return Err(TrainingError::initialization(
                "criterion requires at least one object class",
            ));
        }
        if !eos_coef.is_finite() || eos_coef < 0.0 {
            return Err(TrainingError::initialization(
                "no-object coefficient must be finite and >= 0",
            ));
        }
        if losses.is_empty() {
            return Err(TrainingError::initialization(
                "criterion requires at least one loss term",
            ));
        }

        let mut class_weights = vec![1.0f32; num_classes + 1];
        class_weights[num_classes] = eos_coef;

        Ok(Self {
            num_classes,
            matcher,
            weights,
            eos_coef,
            losses,
            class_weights,
        })
    }

    /// Criterion for a classifier of width `classifier_width` (real classes
    /// plus no-object) with every loss term enabled.
    pub fn from_config(cfg: &LossConfig, classifier_width: usize) -> Result<Self, TrainingError> {
        let matcher = HungarianMatcher::new(cfg.cost_class, cfg.cost_bbox, cfg.cost_giou)?;
        Self::new(
            classifier_width.saturating_sub(1),
            matcher,
            LossWeights::default(),
            cfg.null_class_coef,
            vec![LossTerm::Labels, LossTerm::Boxes, LossTerm::Cardinality],
        )
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn eos_coef(&self) -> f32 {
        self.eos_coef
    }

    pub fn compute(
        &self,
        outputs: &DetectionOutput,
        targets: &[Target],
    ) -> Result<LossOutput, TrainingError> {
        let (batch, num_queries, width) = outputs.logits.dims3().map_err(to_runtime_error)?;
        if width != self.num_classes + 1 {
            return Err(TrainingError::runtime(format!(
                "logits carry {} classes, criterion expects {}",
                width,
                self.num_classes + 1
            )));
        }
        if batch != targets.len() {
            return Err(TrainingError::runtime(format!(
                "batch has {} predictions but {} targets",
                batch,
                targets.len()
            )));
        }
        for target in targets {
            if let Some(label) = target.labels.iter().find(|&&l| l as usize >= self.num_classes) {
                return Err(TrainingError::data(format!(
                    "label {} out of range for {} classes",
                    label, self.num_classes
                )));
            }
        }

        let indices = self.matcher.match_batch(outputs, targets)?;
        let num_boxes = targets.iter().map(Target::len).sum::<usize>().max(1) as f64;

        let mut metrics = LossMetrics::default();
        let mut loss: Option<Tensor> = None;
        let mut accumulate = |term: Tensor, weight: f64| -> Result<(), TrainingError> {
            let scaled = term.affine(weight, 0.0).map_err(to_runtime_error)?;
            loss = Some(match loss.take() {
                Some(acc) => (acc + scaled).map_err(to_runtime_error)?,
                None => scaled,
            });
            Ok(())
        };

        for term in &self.losses {
            match term {
                LossTerm::Labels => {
                    let ce = self.loss_labels(outputs, targets, &indices, num_queries)?;
                    metrics.loss_ce = scalar(&ce)?;
                    accumulate(ce, self.weights.loss_ce)?;
                }
                LossTerm::Boxes => {
                    let (l1, giou) = self.loss_boxes(outputs, targets, &indices, num_queries, num_boxes)?;
                    metrics.loss_bbox = scalar(&l1)?;
                    metrics.loss_giou = scalar(&giou)?;
                    accumulate(l1, self.weights.loss_bbox)?;
                    accumulate(giou, self.weights.loss_giou)?;
                }
                LossTerm::Cardinality => {
                    metrics.cardinality_error = self.cardinality_error(outputs, targets)?;
                }
            }
        }

        let loss = match loss {
            Some(loss) => loss,
            None => Tensor::zeros((), DType::F32, outputs.logits.device()).map_err(to_runtime_error)?,
        };
        metrics.total = scalar(&loss)?;

        Ok(LossOutput { loss, metrics })
    }

    fn loss_labels(
        &self,
        outputs: &DetectionOutput,
        targets: &[Target],
        indices: &[MatchIndices],
        num_queries: usize,
    ) -> Result<Tensor, TrainingError> {
        let device = outputs.logits.device();
        let batch = indices.len();
        let rows = batch * num_queries;

        let mut target_classes = vec![self.num_classes as u32; rows];
        for (b, (pairs, target)) in indices.iter().zip(targets).enumerate() {
            for &(query, object) in pairs {
                target_classes[b * num_queries + query] = target.labels[object];
            }
        }
        let sample_weights: Vec<f32> = target_classes
            .iter()
            .map(|&c| self.class_weights[c as usize])
            .collect();
        let total_weight: f64 = sample_weights.iter().map(|&w| w as f64).sum();

        let logits = outputs
            .logits
            .reshape((rows, self.num_classes + 1))
            .and_then(|l| l.to_dtype(DType::F32))
            .map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits, D::Minus1).map_err(to_runtime_error)?;
        let classes = Tensor::from_vec(target_classes, (rows, 1), device).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&classes, 1)
            .and_then(|t| t.squeeze(1))
            .and_then(|t| t.neg())
            .map_err(to_runtime_error)?;
        let weights = Tensor::from_vec(sample_weights, rows, device).map_err(to_runtime_error)?;

        nll.mul(&weights)
            .and_then(|t| t.sum_all())
            .and_then(|t| t.affine(1.0 / total_weight.max(EPS), 0.0))
            .map_err(to_runtime_error)
    }

    fn loss_boxes(
        &self,
        outputs: &DetectionOutput,
        targets: &[Target],
        indices: &[MatchIndices],
        num_queries: usize,
        num_boxes: f64,
    ) -> Result<(Tensor, Tensor), TrainingError> {
        let device = outputs.boxes.device();
        let mut flat_index = Vec::new();
        let mut target_boxes = Vec::new();
        for (b, (pairs, target)) in indices.iter().zip(targets).enumerate() {
            for &(query, object) in pairs {
                flat_index.push((b * num_queries + query) as u32);
                target_boxes.extend_from_slice(&target.boxes[object]);
            }
        }

        let pred_boxes = outputs
            .boxes
            .to_dtype(DType::F32)
            .and_then(|b| b.reshape((indices.len() * num_queries, 4)))
            .map_err(to_runtime_error)?;

        if flat_index.is_empty() {
            // Keeps the result attached to the graph.
            let zero = pred_boxes
                .sum_all()
                .and_then(|t| t.affine(0.0, 0.0))
                .map_err(to_runtime_error)?;
            return Ok((zero.clone(), zero));
        }

        let matched = flat_index.len();
        let index = Tensor::from_vec(flat_index, matched, device).map_err(to_runtime_error)?;
        let src = pred_boxes.index_select(&index, 0).map_err(to_runtime_error)?;
        let tgt = Tensor::from_vec(target_boxes, (matched, 4), device).map_err(to_runtime_error)?;

        let l1 = (&src - &tgt)
            .and_then(|d| d.abs())
            .and_then(|d| d.sum_all())
            .and_then(|d| d.affine(1.0 / num_boxes, 0.0))
            .map_err(to_runtime_error)?;

        let giou = cxcywh_to_xyxy(&src)
            .and_then(|s| Ok((s, cxcywh_to_xyxy(&tgt)?)))
            .and_then(|(s, t)| paired_generalized_iou(&s, &t))
            .and_then(|g| g.affine(-1.0, 1.0))
            .and_then(|g| g.sum_all())
            .and_then(|g| g.affine(1.0 / num_boxes, 0.0))
            .map_err(to_runtime_error)?;

        Ok((l1, giou))
    }

    fn cardinality_error(
        &self,
        outputs: &DetectionOutput,
        targets: &[Target],
    ) -> Result<f64, TrainingError> {
        let predicted = outputs
            .logits
            .detach()
            .argmax(D::Minus1)
            .and_then(|a| a.to_dtype(DType::U32))
            .and_then(|a| a.to_vec2::<u32>())
            .map_err(to_runtime_error)?;
        if predicted.is_empty() {
            return Ok(0.0);
        }
        let no_object = self.num_classes as u32;
        let total: f64 = predicted
            .iter()
            .zip(targets)
            .map(|(queries, target)| {
                let count = queries.iter().filter(|&&c| c != no_object).count() as f64;
                (count - target.len() as f64).abs()
            })
            .sum();
        Ok(total / predicted.len() as f64)
    }
}

fn scalar(tensor: &Tensor) -> Result<f64, TrainingError> {
    tensor
        .to_dtype(DType::F64)
        .and_then(|t| t.to_scalar::<f64>())
        .map_err(to_runtime_error)
}
