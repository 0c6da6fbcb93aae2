use candle_core::{DType, D};
use candle_nn::ops;
use model::DetectionOutput;

use super::{
    boxes::{box_cxcywh_to_xyxy, generalized_box_iou},
    to_runtime_error,
};
use crate::{data::Target, TrainingError};

/// `(query, target)` pairs for one sample, sorted by query index.
pub type MatchIndices = Vec<(usize, usize)>;

/// Assigns each ground-truth object to a distinct query by minimizing a
/// weighted sum of class, L1 box and GIoU costs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HungarianMatcher {
    pub cost_class: f32,
    pub cost_bbox: f32,
    pub cost_giou: f32,
}

impl Default for HungarianMatcher {
    fn default() -> Self {
        Self {
            cost_class: 1.0,
            cost_bbox: 1.0,
            cost_giou: 1.0,
        }
    }
}

impl HungarianMatcher {
    pub fn new(cost_class: f32, cost_bbox: f32, cost_giou: f32) -> Result<Self, TrainingError> {
        if cost_class == 0.0 && cost_bbox == 0.0 && cost_giou == 0.0 {
            return Err(TrainingError::initialization(
                "matcher costs cannot all be zero",
            ));
        }
        if [cost_class, cost_bbox, cost_giou]
            .iter()
            .any(|c| !c.is_finite() || *c < 0.0)
        {
            return Err(TrainingError::initialization(
                "matcher costs must be finite and non-negative",
            ));
        }
        Ok(Self {
            cost_class,
            cost_bbox,
            cost_giou,
        })
    }

    /// Matches every sample of the batch. Gradients do not flow through the
    /// assignment.
    pub fn match_batch(
        &self,
        outputs: &DetectionOutput,
        targets: &[Target],
    ) -> Result<Vec<MatchIndices>, TrainingError> {
        let probs = ops::softmax(&outputs.logits.detach(), D::Minus1)
            .and_then(|p| p.to_dtype(DType::F32))
            .and_then(|p| p.to_vec3::<f32>())
            .map_err(to_runtime_error)?;
        let boxes = outputs
            .boxes
            .detach()
            .to_dtype(DType::F32)
            .and_then(|b| b.to_vec3::<f32>())
            .map_err(to_runtime_error)?;

        if probs.len() != targets.len() {
            return Err(TrainingError::runtime(format!(
                "matcher received {} predictions for {} targets",
                probs.len(),
                targets.len()
            )));
        }

        probs
            .iter()
            .zip(&boxes)
            .zip(targets)
            .map(|((sample_probs, sample_boxes), target)| {
                self.match_sample(sample_probs, sample_boxes, target)
            })
            .collect()
    }

    fn match_sample(
        &self,
        probs: &[Vec<f32>],
        boxes: &[Vec<f32>],
        target: &Target,
    ) -> Result<MatchIndices, TrainingError> {
        if target.is_empty() {
            return Ok(Vec::new());
        }
        let num_queries = probs.len();
        let num_targets = target.len();
        let target_xyxy: Vec<[f32; 4]> = target.boxes.iter().copied().map(box_cxcywh_to_xyxy).collect();

        let mut cost = Vec::with_capacity(num_queries * num_targets);
        for (query_probs, query_box) in probs.iter().zip(boxes) {
            let pred = [query_box[0], query_box[1], query_box[2], query_box[3]];
            let pred_xyxy = box_cxcywh_to_xyxy(pred);
            for (t, &label) in target.labels.iter().enumerate() {
                let class_prob = query_probs.get(label as usize).copied().ok_or_else(|| {
                    TrainingError::data(format!(
                        "label {} exceeds classifier width {}",
                        label,
                        query_probs.len()
                    ))
                })?;
                let l1: f32 = pred
                    .iter()
                    .zip(&target.boxes[t])
                    .map(|(p, g)| (p - g).abs())
                    .sum();
                let giou = generalized_box_iou(pred_xyxy, target_xyxy[t]);
                cost.push(
                    (self.cost_bbox * l1 - self.cost_class * class_prob - self.cost_giou * giou)
                        as f64,
                );
            }
        }

        if cost.iter().any(|c| !c.is_finite()) {
            return Err(TrainingError::runtime(
                "matching cost contains non-finite values",
            ));
        }

        Ok(linear_sum_assignment(&cost, num_queries, num_targets))
    }
}

/// Minimum-cost assignment on a row-major `rows x cols` matrix. Matches
/// `min(rows, cols)` pairs and returns them as `(row, col)` sorted by row.
pub fn linear_sum_assignment(cost: &[f64], rows: usize, cols: usize) -> Vec<(usize, usize)> {
    debug_assert_eq!(cost.len(), rows * cols);
    if rows == 0 || cols == 0 {
        return Vec::new();
    }

    if rows <= cols {
        let mut pairs = solve(|r, c| cost[r * cols + c], rows, cols);
        pairs.sort_unstable();
        pairs
    } else {
        let mut pairs: Vec<(usize, usize)> = solve(|r, c| cost[c * cols + r], cols, rows)
            .into_iter()
            .map(|(c, r)| (r, c))
            .collect();
        pairs.sort_unstable();
        pairs
    }
}

/// Kuhn-Munkres with potentials, O(n^2 m). Requires `n <= m`.
fn solve(cost: impl Fn(usize, usize) -> f64, n: usize, m: usize) -> Vec<(usize, usize)> {
    // 1-based; column 0 is a virtual source.
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    let mut owner = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for row in 1..=n {
        owner[0] = row;
        let mut col0 = 0usize;
        let mut min_slack = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];

        loop {
            used[col0] = true;
            let row0 = owner[col0];
            let mut delta = f64::INFINITY;
            let mut col1 = 0usize;

            for col in 1..=m {
                if used[col] {
                    continue;
                }
                let reduced = cost(row0 - 1, col - 1) - u[row0] - v[col];
                if reduced < min_slack[col] {
                    min_slack[col] = reduced;
                    way[col] = col0;
                }
                if min_slack[col] < delta {
                    delta = min_slack[col];
                    col1 = col;
                }
            }

            for col in 0..=m {
                if used[col] {
                    u[owner[col]] += delta;
                    v[col] -= delta;
                } else {
                    min_slack[col] -= delta;
                }
            }

            col0 = col1;
            if owner[col0] == 0 {
                break;
            }
        }

        loop {
            let prev = way[col0];
            owner[col0] = owner[prev];
            col0 = prev;
            if col0 == 0 {
                break;
            }
        }
    }

    (1..=m)
        .filter(|&col| owner[col] != 0)
        .map(|col| (owner[col] - 1, col - 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn total(cost: &[f64], cols: usize, pairs: &[(usize, usize)]) -> f64 {
        pairs.iter().map(|&(r, c)| cost[r * cols + c]).sum()
    }

    fn brute_force(cost: &[f64], n: usize) -> f64 {
        fn permute(cols: &mut Vec<usize>, k: usize, cost: &[f64], n: usize, best: &mut f64) {
            if k == n {
                let sum: f64 = cols.iter().enumerate().map(|(r, &c)| cost[r * n + c]).sum();
                *best = best.min(sum);
                return;
            }
            for i in k..n {
                cols.swap(k, i);
                permute(cols, k + 1, cost, n, best);
                cols.swap(k, i);
            }
        }
        let mut best = f64::INFINITY;
        permute(&mut (0..n).collect(), 0, cost, n, &mut best);
        best
    }

    #[test]
    fn solves_small_square_problem() {
        let cost = [4.0, 1.0, 3.0, 2.0, 0.0, 5.0, 3.0, 2.0, 2.0];
        let pairs = linear_sum_assignment(&cost, 3, 3);
        assert_eq!(pairs, vec![(0, 1), (1, 0), (2, 2)]);
        assert_eq!(total(&cost, 3, &pairs), 5.0);
    }

    #[test]
    fn matches_brute_force_on_random_matrices() {
        let mut rng = StdRng::seed_from_u64(7);
        for n in 1..=5 {
            for _ in 0..20 {
                let cost: Vec<f64> = (0..n * n).map(|_| rng.gen_range(-3.0..3.0)).collect();
                let pairs = linear_sum_assignment(&cost, n, n);
                assert_eq!(pairs.len(), n);
                assert!((total(&cost, n, &pairs) - brute_force(&cost, n)).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn handles_rectangular_matrices() {
        // More queries than targets: each target column gets its cheapest distinct row.
        let wide_rows = [9.0, 9.0, 1.0, 9.0, 9.0, 2.0, 3.0, 9.0];
        let pairs = linear_sum_assignment(&wide_rows, 4, 2);
        assert_eq!(pairs, vec![(1, 0), (2, 1)]);

        let tall = [5.0, 1.0, 7.0, 2.0, 8.0, 0.5];
        let pairs = linear_sum_assignment(&tall, 2, 3);
        assert_eq!(pairs, vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn matcher_pairs_objects_with_nearest_queries() {
        // Three queries, two real classes plus no-object.
        let logits = Tensor::new(
            &[[[4.0f32, 0.0, 0.0], [0.0, 0.0, 4.0], [0.0, 4.0, 0.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let boxes = Tensor::new(
            &[[
                [0.2f32, 0.2, 0.1, 0.1],
                [0.5, 0.5, 0.3, 0.3],
                [0.8, 0.8, 0.2, 0.2],
            ]],
            &Device::Cpu,
        )
        .unwrap();
        let outputs = DetectionOutput { logits, boxes };
        let target = Target::new(
            vec![1, 0],
            vec![[0.79, 0.81, 0.2, 0.2], [0.21, 0.2, 0.1, 0.1]],
        )
        .unwrap();

        let matcher = HungarianMatcher::default();
        let indices = matcher.match_batch(&outputs, &[target]).unwrap();

        assert_eq!(indices, vec![vec![(0, 1), (2, 0)]]);
    }

    #[test]
    fn empty_target_yields_empty_assignment() {
        let logits = Tensor::zeros((2, 4, 3), DType::F32, &Device::Cpu).unwrap();
        let boxes = Tensor::full(0.5f32, (2, 4, 4), &Device::Cpu).unwrap();
        let outputs = DetectionOutput { logits, boxes };
        let targets = vec![
            Target::default(),
            Target::new(vec![1], vec![[0.5, 0.5, 0.2, 0.2]]).unwrap(),
        ];

        let indices = HungarianMatcher::default()
            .match_batch(&outputs, &targets)
            .unwrap();

        assert!(indices[0].is_empty());
        assert_eq!(indices[1].len(), 1);
    }

    #[test]
    fn rejects_degenerate_costs() {
        assert!(HungarianMatcher::new(0.0, 0.0, 0.0).is_err());
        assert!(HungarianMatcher::new(-1.0, 1.0, 1.0).is_err());
        assert!(HungarianMatcher::new(1.0, 5.0, 2.0).is_ok());
    }
}
