//! Conversion of inference outputs into scored detections.

use crate::{
    common::*,
    error::DetectorError,
    input::ImageInfo,
    model::TestOutput,
    proposal::{clip_boxes, decode_boxes, nms},
};

#[derive(Debug, Clone)]
pub struct DetectionPostProcessInit {
    pub score_threshold: R64,
    pub nms_threshold: R64,
    pub max_per_image: usize,
}

impl Default for DetectionPostProcessInit {
    fn default() -> Self {
        Self {
            score_threshold: r64(0.05),
            nms_threshold: r64(0.3),
            max_per_image: 100,
        }
    }
}

impl DetectionPostProcessInit {
    pub fn build(self) -> Result<DetectionPostProcess> {
        let Self {
            score_threshold,
            nms_threshold,
            max_per_image,
        } = self;

        ensure!(
            (0.0..=1.0).contains(&score_threshold.raw()),
            DetectorError::config("score_threshold must be in range [0, 1]")
        );
        ensure!(
            (0.0..=1.0).contains(&nms_threshold.raw()),
            DetectorError::config("nms_threshold must be in range [0, 1]")
        );

        Ok(DetectionPostProcess {
            score_threshold,
            nms_threshold,
            max_per_image,
        })
    }
}

/// A detected object in original image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class: i64,
    pub score: f64,
    pub bbox: XYXY<f64>,
}

#[derive(Debug)]
pub struct DetectionPostProcess {
    score_threshold: R64,
    nms_threshold: R64,
    max_per_image: usize,
}

impl DetectionPostProcess {
    /// Decode class specific boxes, then threshold and suppress them per class.
    ///
    /// The background class 0 is skipped. The detections are sorted by score
    /// and at most `max_per_image` are kept.
    pub fn forward(&self, output: &TestOutput, image_info: &ImageInfo) -> Result<Vec<Detection>> {
        tch::no_grad(|| -> Result<_> {
            let TestOutput {
                cls_prob,
                bbox_pred,
                rois,
                ..
            } = output;
            let (num_rois, num_classes) = cls_prob.size2()?;
            ensure!(
                bbox_pred.size() == [num_rois, num_classes * 4] && rois.size() == [num_rois, 5],
                DetectorError::shape(format!(
                    "inconsistent test outputs: probs {:?}, deltas {:?}, regions {:?}",
                    cls_prob.size(),
                    bbox_pred.size(),
                    rois.size()
                ))
            );

            // back to the original image scale
            let scale = image_info.scale;
            let boxes = rois.narrow(1, 1, 4).to_kind(Kind::Float) / scale;
            let pred_boxes = decode_boxes(&boxes, &bbox_pred.to_kind(Kind::Float))?;
            let pred_boxes = clip_boxes(
                &pred_boxes,
                (image_info.height / scale).round(),
                (image_info.width / scale).round(),
            )?;

            let mut detections = vec![];

            for class in 1..num_classes {
                let scores = cls_prob.select(1, class).to_kind(Kind::Float);
                let keep = scores.gt(self.score_threshold.raw()).nonzero().view([-1]);
                if keep.numel() == 0 {
                    continue;
                }

                let boxes = pred_boxes.narrow(1, class * 4, 4).index_select(0, &keep);
                let scores = scores.index_select(0, &keep);
                let kept = nms(&boxes, &scores, self.nms_threshold.raw())?;

                let coords = Vec::<f32>::from(&boxes.index_select(0, &kept).reshape(&[-1]));
                let scores = Vec::<f32>::from(&scores.index_select(0, &kept));

                for (coord, score) in izip!(coords.chunks(4), scores) {
                    let bbox = XYXY::try_from_xyxy([
                        coord[0] as f64,
                        coord[1] as f64,
                        coord[2] as f64,
                        coord[3] as f64,
                    ])?;
                    detections.push(Detection {
                        class,
                        score: score as f64,
                        bbox,
                    });
                }
            }

            let detections: Vec<_> = detections
                .into_iter()
                .sorted_by(|lhs, rhs| rhs.score.total_cmp(&lhs.score))
                .take(self.max_per_image)
                .collect();
            debug!("{} detections after post-processing", detections.len());

            Ok(detections)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_output(probs: &[f32], boxes: &[f32]) -> TestOutput {
        let num_rois = (boxes.len() / 4) as i64;
        let boxes = Tensor::of_slice(boxes).view([num_rois, 4]);
        let cls_prob = Tensor::of_slice(probs).view([num_rois, 2]);

        TestOutput {
            cls_score: cls_prob.log(),
            cls_prob,
            bbox_pred: Tensor::zeros(&[num_rois, 8], (Kind::Float, Device::Cpu)),
            rois: Tensor::cat(&[Tensor::zeros(&[num_rois, 1], (Kind::Float, Device::Cpu)), boxes], 1),
        }
    }

    #[test]
    fn duplicates_and_low_scores_are_removed() -> Result<()> {
        #[rustfmt::skip]
        let output = test_output(
            &[
                0.1, 0.9,
                0.2, 0.8,
                0.97, 0.03,
            ],
            &[
                0.0, 0.0, 9.0, 9.0,
                0.0, 0.0, 9.0, 10.0,
                20.0, 20.0, 29.0, 29.0,
            ],
        );
        let image_info = ImageInfo::new(50.0, 50.0, 1.0)?;
        let detections = DetectionPostProcessInit::default()
            .build()?
            .forward(&output, &image_info)?;

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class, 1);
        assert!((detections[0].score - 0.9).abs() < 1e-6);
        assert_eq!(detections[0].bbox.xyxy(), [0.0, 0.0, 9.0, 9.0]);
        Ok(())
    }

    #[test]
    fn detections_are_capped_and_rescaled() -> Result<()> {
        #[rustfmt::skip]
        let output = test_output(
            &[
                0.4, 0.6,
                0.1, 0.9,
            ],
            &[
                0.0, 0.0, 19.0, 19.0,
                40.0, 40.0, 59.0, 59.0,
            ],
        );
        let image_info = ImageInfo::new(100.0, 100.0, 2.0)?;
        let detections = DetectionPostProcessInit {
            max_per_image: 1,
            ..Default::default()
        }
        .build()?
        .forward(&output, &image_info)?;

        assert_eq!(detections.len(), 1);
        assert!((detections[0].score - 0.9).abs() < 1e-6);
        let [x1, y1, x2, y2] = detections[0].bbox.xyxy();
        assert!((x1 - 20.0).abs() < 1e-4 && (y1 - 20.0).abs() < 1e-4);
        assert!((x2 - 29.5).abs() < 1e-4 && (y2 - 29.5).abs() < 1e-4);
        Ok(())
    }
}
