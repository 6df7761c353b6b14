use crate::{common::*, error::DetectorError};

/// Greedy non-maximum suppression.
///
/// It returns the indexes of kept boxes in descending score order. A box is
/// suppressed if its IoU with a kept box is above `iou_threshold`.
pub fn nms(boxes: &Tensor, scores: &Tensor, iou_threshold: f64) -> Result<Tensor> {
    tch::no_grad(|| -> Result<_> {
        let device = boxes.device();
        let (num_boxes, cols) = boxes.size2()?;
        ensure!(
            cols == 4 && scores.size1()? == num_boxes,
            DetectorError::shape(format!(
                "expect [N, 4] boxes and [N] scores, but get {:?} and {:?}",
                boxes.size(),
                scores.size()
            ))
        );

        let score_vec = Vec::<f32>::from(&scores.to_kind(Kind::Float).reshape(&[-1]));
        let coord_vec = Vec::<f32>::from(&boxes.to_kind(Kind::Float).reshape(&[-1]));
        let rects: Vec<XYXY<f32>> = coord_vec
            .chunks(4)
            .map(|c| XYXY::try_from_xyxy([c[0], c[1], c[2], c[3]]))
            .collect::<Result<_>>()?;

        let order: Vec<usize> = (0..rects.len())
            .sorted_by(|&lhs, &rhs| score_vec[rhs].total_cmp(&score_vec[lhs]))
            .collect();

        let mut suppressed = vec![false; rects.len()];
        let mut keep: Vec<i64> = vec![];

        for (nth, &index) in order.iter().enumerate() {
            if suppressed[index] {
                continue;
            }
            keep.push(index as i64);

            let rect = &rects[index];
            for &other in &order[(nth + 1)..] {
                if !suppressed[other] && rect.iou_with(&rects[other], 0.0) as f64 > iou_threshold {
                    suppressed[other] = true;
                }
            }
        }

        Ok(Tensor::of_slice(&keep).to_device(device))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_suppresses_duplicates() -> Result<()> {
        let boxes = Tensor::of_slice(&[
            0f32, 0.0, 9.0, 9.0, // duplicate of the best box
            0.0, 0.0, 9.0, 10.0, // best
            50.0, 50.0, 59.0, 59.0, // disjoint
            2.0, 2.0, 11.0, 11.0, // overlapping, IoU about 0.52
        ])
        .view([4, 4]);
        let scores = Tensor::of_slice(&[0.8f32, 0.9, 0.1, 0.7]);

        let keep = nms(&boxes, &scores, 0.7)?;
        assert_eq!(Vec::<i64>::from(&keep), vec![1, 3, 2]);

        let keep = nms(&boxes, &scores, 0.5)?;
        assert_eq!(Vec::<i64>::from(&keep), vec![1, 2]);
        Ok(())
    }

    #[test]
    fn nms_keeps_disjoint_boxes() -> Result<()> {
        let boxes = Tensor::of_slice(&[0f32, 0.0, 9.0, 9.0, 20.0, 20.0, 29.0, 29.0]).view([2, 4]);
        let scores = Tensor::of_slice(&[0.1f32, 0.2]);
        let keep = nms(&boxes, &scores, 0.0)?;
        assert_eq!(Vec::<i64>::from(&keep), vec![1, 0]);
        Ok(())
    }

    #[test]
    fn nms_on_empty_input() -> Result<()> {
        let boxes = Tensor::zeros(&[0, 4], (Kind::Float, Device::Cpu));
        let scores = Tensor::zeros(&[0], (Kind::Float, Device::Cpu));
        let keep = nms(&boxes, &scores, 0.7)?;
        assert_eq!(keep.numel(), 0);
        Ok(())
    }
}
