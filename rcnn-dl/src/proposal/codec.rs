use crate::{common::*, error::DetectorError};

/// Upper bound of the log-scale deltas, prevents overflow in `exp()`.
pub const BBOX_XFORM_CLIP: f64 = 4.135166556742356; // ln(1000 / 16)

/// Apply regression deltas on reference boxes.
///
/// The `boxes` is a `[N, 4]` tensor of corner boxes. The `deltas` is a
/// `[N, 4 * K]` tensor holding `K` groups of `(dx, dy, dw, dh)`. The output
/// has the shape of `deltas`.
pub fn decode_boxes(boxes: &Tensor, deltas: &Tensor) -> Result<Tensor> {
    let (num_boxes, box_cols) = boxes.size2()?;
    let (num_deltas, delta_cols) = deltas.size2()?;
    ensure!(
        box_cols == 4 && num_boxes == num_deltas && delta_cols % 4 == 0,
        DetectorError::shape(format!(
            "expect [N, 4] boxes and [N, 4K] deltas, but get {:?} and {:?}",
            boxes.size(),
            deltas.size()
        ))
    );

    if num_boxes == 0 {
        return Ok(Tensor::zeros(
            &[0, delta_cols],
            (Kind::Float, deltas.device()),
        ));
    }

    let boxes = boxes.to_kind(Kind::Float);
    let x1 = boxes.select(1, 0).reshape(&[-1, 1]);
    let y1 = boxes.select(1, 1).reshape(&[-1, 1]);
    let x2 = boxes.select(1, 2).reshape(&[-1, 1]);
    let y2 = boxes.select(1, 3).reshape(&[-1, 1]);

    let widths = &x2 - &x1 + 1.0;
    let heights = &y2 - &y1 + 1.0;
    let ctr_x = x1 + &widths * 0.5;
    let ctr_y = y1 + &heights * 0.5;

    let deltas = deltas.to_kind(Kind::Float).reshape(&[num_deltas, -1, 4]);
    let dx = deltas.select(2, 0);
    let dy = deltas.select(2, 1);
    let dw = deltas.select(2, 2).clamp_max(BBOX_XFORM_CLIP);
    let dh = deltas.select(2, 3).clamp_max(BBOX_XFORM_CLIP);

    let pred_ctr_x = dx * &widths + ctr_x;
    let pred_ctr_y = dy * &heights + ctr_y;
    let pred_w = dw.exp() * &widths;
    let pred_h = dh.exp() * &heights;

    let pred_x1 = &pred_ctr_x - &pred_w * 0.5;
    let pred_y1 = &pred_ctr_y - &pred_h * 0.5;
    let pred_x2 = &pred_ctr_x + &pred_w * 0.5 - 1.0;
    let pred_y2 = &pred_ctr_y + &pred_h * 0.5 - 1.0;

    let pred = Tensor::stack(&[pred_x1, pred_y1, pred_x2, pred_y2], 2).view([num_deltas, delta_cols]);
    Ok(pred)
}

/// Compute the `[N, 4]` regression deltas that move `boxes` onto `targets`.
pub fn encode_boxes(boxes: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (num_boxes, box_cols) = boxes.size2()?;
    let (num_targets, target_cols) = targets.size2()?;
    ensure!(
        box_cols == 4 && target_cols == 4 && num_boxes == num_targets,
        DetectorError::shape(format!(
            "expect two [N, 4] tensors, but get {:?} and {:?}",
            boxes.size(),
            targets.size()
        ))
    );

    let boxes = boxes.to_kind(Kind::Float);
    let targets = targets.to_kind(Kind::Float);

    let ex_widths = boxes.select(1, 2) - boxes.select(1, 0) + 1.0;
    let ex_heights = boxes.select(1, 3) - boxes.select(1, 1) + 1.0;
    let ex_ctr_x = boxes.select(1, 0) + &ex_widths * 0.5;
    let ex_ctr_y = boxes.select(1, 1) + &ex_heights * 0.5;

    let gt_widths = targets.select(1, 2) - targets.select(1, 0) + 1.0;
    let gt_heights = targets.select(1, 3) - targets.select(1, 1) + 1.0;
    let gt_ctr_x = targets.select(1, 0) + &gt_widths * 0.5;
    let gt_ctr_y = targets.select(1, 1) + &gt_heights * 0.5;

    let dx = (gt_ctr_x - ex_ctr_x) / &ex_widths;
    let dy = (gt_ctr_y - ex_ctr_y) / &ex_heights;
    let dw = (gt_widths / ex_widths).log();
    let dh = (gt_heights / ex_heights).log();

    Ok(Tensor::stack(&[dx, dy, dw, dh], 1))
}

/// Clamp `[N, 4 * K]` corner boxes into an image.
pub fn clip_boxes(boxes: &Tensor, image_height: f64, image_width: f64) -> Result<Tensor> {
    let (num_boxes, cols) = boxes.size2()?;
    ensure!(
        cols % 4 == 0,
        DetectorError::shape(format!("expect [N, 4K] boxes, but get {:?}", boxes.size()))
    );
    if num_boxes == 0 {
        return Ok(boxes.shallow_clone());
    }

    let max_x = image_width - 1.0;
    let max_y = image_height - 1.0;
    let boxes = boxes.reshape(&[num_boxes, -1, 4]);
    let x1 = boxes.select(2, 0).clamp_min(0.0).clamp_max(max_x);
    let y1 = boxes.select(2, 1).clamp_min(0.0).clamp_max(max_y);
    let x2 = boxes.select(2, 2).clamp_min(0.0).clamp_max(max_x);
    let y2 = boxes.select(2, 3).clamp_min(0.0).clamp_max(max_y);

    Ok(Tensor::stack(&[x1, y1, x2, y2], 2).view([num_boxes, cols]))
}
