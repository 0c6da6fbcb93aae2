//! Box conversions and generalized IoU, on plain arrays for the matcher and
//! on tensors for the differentiable loss.

use candle_core::{Result, Tensor};

/// `(cx, cy, w, h)` to `(x0, y0, x1, y1)`.
pub fn box_cxcywh_to_xyxy(b: [f32; 4]) -> [f32; 4] {
    let [cx, cy, w, h] = b;
    [cx - 0.5 * w, cy - 0.5 * h, cx + 0.5 * w, cy + 0.5 * h]
}

pub fn box_area(b: [f32; 4]) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

/// Generalized IoU of two `xyxy` boxes, in `[-1, 1]`.
pub fn generalized_box_iou(a: [f32; 4], b: [f32; 4]) -> f32 {
    let area_a = box_area(a);
    let area_b = box_area(b);

    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = iw * ih;
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        return 0.0;
    }
    let iou = inter / union;

    let cw = (a[2].max(b[2]) - a[0].min(b[0])).max(0.0);
    let ch = (a[3].max(b[3]) - a[1].min(b[1])).max(0.0);
    let enclosing = cw * ch;
    if enclosing <= 0.0 {
        return iou;
    }
    iou - (enclosing - union) / enclosing
}

/// Row-wise `cxcywh -> xyxy` on an `(n, 4)` tensor.
pub fn cxcywh_to_xyxy(boxes: &Tensor) -> Result<Tensor> {
    let cx = boxes.narrow(1, 0, 1)?;
    let cy = boxes.narrow(1, 1, 1)?;
    let half_w = (boxes.narrow(1, 2, 1)? * 0.5)?;
    let half_h = (boxes.narrow(1, 3, 1)? * 0.5)?;
    Tensor::cat(
        &[
            (&cx - &half_w)?,
            (&cy - &half_h)?,
            (&cx + &half_w)?,
            (&cy + &half_h)?,
        ],
        1,
    )
}

/// Generalized IoU between corresponding rows of two `(n, 4)` `xyxy`
/// tensors. Returns shape `(n,)`.
pub fn paired_generalized_iou(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let col = |t: &Tensor, i: usize| t.narrow(1, i, 1);
    let (ax0, ay0, ax1, ay1) = (col(a, 0)?, col(a, 1)?, col(a, 2)?, col(a, 3)?);
    let (bx0, by0, bx1, by1) = (col(b, 0)?, col(b, 1)?, col(b, 2)?, col(b, 3)?);

    let area_a = ((&ax1 - &ax0)?.relu()? * (&ay1 - &ay0)?.relu()?)?;
    let area_b = ((&bx1 - &bx0)?.relu()? * (&by1 - &by0)?.relu()?)?;

    let iw = (ax1.minimum(&bx1)? - ax0.maximum(&bx0)?)?.relu()?;
    let ih = (ay1.minimum(&by1)? - ay0.maximum(&by0)?)?.relu()?;
    let inter = (iw * ih)?;
    let union = ((area_a + area_b)? - &inter)?;
    let iou = inter.div(&union)?;

    let cw = (ax1.maximum(&bx1)? - ax0.minimum(&bx0)?)?.relu()?;
    let ch = (ay1.maximum(&by1)? - ay0.minimum(&by0)?)?.relu()?;
    let enclosing = (cw * ch)?;
    let penalty = (&enclosing - &union)?.div(&enclosing)?;

    (iou - penalty)?.squeeze(1)
}
