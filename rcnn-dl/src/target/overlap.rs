use crate::{common::*, error::DetectorError};

/// Pairwise IoU of `[N, 4]` boxes and `[K, 4]` query boxes in inclusive
/// pixel coordinates. It returns a `[N, K]` tensor.
pub fn bbox_overlaps(boxes: &Tensor, query: &Tensor) -> Result<Tensor> {
    let (_, box_cols) = boxes.size2()?;
    let (_, query_cols) = query.size2()?;
    ensure!(
        box_cols == 4 && query_cols == 4,
        DetectorError::shape(format!(
            "expect [N, 4] and [K, 4] boxes, but get {:?} and {:?}",
            boxes.size(),
            query.size()
        ))
    );

    let boxes = boxes.to_kind(Kind::Float);
    let query = query.to_kind(Kind::Float);

    let bx1 = boxes.select(1, 0).reshape(&[-1, 1]);
    let by1 = boxes.select(1, 1).reshape(&[-1, 1]);
    let bx2 = boxes.select(1, 2).reshape(&[-1, 1]);
    let by2 = boxes.select(1, 3).reshape(&[-1, 1]);

    let qx1 = query.select(1, 0).reshape(&[1, -1]);
    let qy1 = query.select(1, 1).reshape(&[1, -1]);
    let qx2 = query.select(1, 2).reshape(&[1, -1]);
    let qy2 = query.select(1, 3).reshape(&[1, -1]);

    let box_areas = (&bx2 - &bx1 + 1.0) * (&by2 - &by1 + 1.0);
    let query_areas = (&qx2 - &qx1 + 1.0) * (&qy2 - &qy1 + 1.0);

    let inter_w = (bx2.minimum(&qx2) - bx1.maximum(&qx1) + 1.0).clamp_min(0.0);
    let inter_h = (by2.minimum(&qy2) - by1.maximum(&qy1) + 1.0).clamp_min(0.0);
    let inter_areas = inter_w * inter_h;
    let union_areas = box_areas + query_areas - &inter_areas;

    Ok(inter_areas / union_areas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn overlaps_agree_with_scalar_iou() -> Result<()> {
        let boxes = [[0.0, 0.0, 9.0, 9.0], [5.0, 0.0, 14.0, 9.0], [3.0, 4.0, 20.0, 30.0]];
        let query = [[0.0, 0.0, 9.0, 9.0], [20.0, 20.0, 29.0, 29.0]];

        let to_tensor = |rows: &[[f64; 4]]| {
            let values: Vec<f32> = rows.iter().flatten().map(|&v| v as f32).collect();
            Tensor::of_slice(&values).view([-1, 4])
        };
        let overlaps = bbox_overlaps(&to_tensor(&boxes), &to_tensor(&query))?;
        assert_eq!(overlaps.size(), vec![3, 2]);

        let values = Vec::<f32>::from(&overlaps.view([-1]));
        for (index, (lhs, rhs)) in boxes.iter().cartesian_product(query.iter()).enumerate() {
            let expect = XYXY::from_xyxy(*lhs).iou_with(&XYXY::from_xyxy(*rhs), 0.0);
            assert_abs_diff_eq!(values[index] as f64, expect, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn overlaps_with_empty_query() -> Result<()> {
        let boxes = Tensor::of_slice(&[0f32, 0.0, 9.0, 9.0]).view([1, 4]);
        let query = Tensor::zeros(&[0, 4], (Kind::Float, Device::Cpu));
        assert_eq!(bbox_overlaps(&boxes, &query)?.size(), vec![1, 0]);
        Ok(())
    }
}
