use super::{bbox_overlaps, sample_to_count, sample_with_replacement};
use crate::{
    common::*,
    error::DetectorError,
    input::GroundTruth,
    proposal::{encode_boxes, Proposals},
};

/// Sampled proposals and their classification and regression targets.
#[derive(Debug, TensorLike)]
pub struct ProposalTargets {
    /// `[B, 5]` sampled regions with the batch index column.
    pub rois: Tensor,
    pub roi_scores: Tensor,
    /// `[B]` class labels, 0 for background.
    pub labels: Tensor,
    /// `[B, 4 * num_classes]` targets, only the slots of the assigned class are set.
    pub bbox_targets: Tensor,
    pub bbox_inside_weights: Tensor,
    pub bbox_outside_weights: Tensor,
    /// Number of leading foreground rows.
    pub num_foreground: i64,
}

#[derive(Debug, Clone)]
pub struct ProposalTargetLayerInit {
    pub batch_size: usize,
    pub fg_fraction: R64,
    pub fg_threshold: R64,
    pub bg_threshold_lo: R64,
    pub bg_threshold_hi: R64,
    pub use_gt: bool,
    /// Normalize the targets by `(target - means) / stds` when set.
    pub normalize: Option<([f64; 4], [f64; 4])>,
}

impl ProposalTargetLayerInit {
    pub fn build(self) -> Result<ProposalTargetLayer> {
        let Self {
            batch_size,
            fg_fraction,
            fg_threshold,
            bg_threshold_lo,
            bg_threshold_hi,
            use_gt,
            normalize,
        } = self;

        ensure!(
            batch_size > 0,
            DetectorError::config("batch_size must be positive")
        );
        ensure!(
            (0.0..=1.0).contains(&fg_fraction.raw()),
            DetectorError::config("fg_fraction must be in range [0, 1]")
        );
        ensure!(
            bg_threshold_lo <= bg_threshold_hi,
            DetectorError::config("bg_threshold_lo must not exceed bg_threshold_hi")
        );
        if let Some((_, stds)) = &normalize {
            ensure!(
                stds.iter().all(|&std| std > 0.0),
                DetectorError::config("normalization stds must be positive")
            );
        }

        Ok(ProposalTargetLayer {
            batch_size,
            fg_fraction,
            fg_threshold,
            bg_threshold_lo,
            bg_threshold_hi,
            use_gt,
            normalize,
        })
    }
}

/// Samples proposals into a fixed size batch for the second stage.
#[derive(Debug)]
pub struct ProposalTargetLayer {
    batch_size: usize,
    fg_fraction: R64,
    fg_threshold: R64,
    bg_threshold_lo: R64,
    bg_threshold_hi: R64,
    use_gt: bool,
    normalize: Option<([f64; 4], [f64; 4])>,
}

impl ProposalTargetLayer {
    pub fn forward<R>(
        &self,
        proposals: &Proposals,
        gt: &GroundTruth,
        num_classes: i64,
        rng: &mut R,
    ) -> Result<ProposalTargets>
    where
        R: Rng,
    {
        tch::no_grad(|| -> Result<_> {
            let Self {
                batch_size,
                fg_fraction,
                fg_threshold,
                bg_threshold_lo,
                bg_threshold_hi,
                use_gt,
                ..
            } = *self;
            let device = proposals.rois.device();
            let gt_boxes = gt.boxes();
            let gt_labels = gt.labels();

            if !gt.is_empty() {
                let max_label = i64::from(gt_labels.max());
                ensure!(
                    max_label < num_classes && i64::from(gt_labels.min()) >= 0,
                    DetectorError::shape(format!(
                        "ground truth class {} is out of range of {} classes",
                        max_label, num_classes
                    ))
                );
            }

            // candidate regions
            let (all_rois, all_scores) = {
                let rois = proposals.rois.detach().to_kind(Kind::Float);
                let scores = proposals.scores.detach().to_kind(Kind::Float).reshape(&[-1]);

                if use_gt && !gt.is_empty() {
                    let num_gt = gt.num_boxes();
                    let gt_rois = Tensor::cat(
                        &[
                            Tensor::zeros(&[num_gt, 1], (Kind::Float, device)),
                            gt_boxes.shallow_clone(),
                        ],
                        1,
                    );
                    let gt_scores = Tensor::zeros(&[num_gt], (Kind::Float, device));
                    (
                        Tensor::cat(&[rois, gt_rois], 0),
                        Tensor::cat(&[scores, gt_scores], 0),
                    )
                } else {
                    (rois, scores)
                }
            };
            let (num_rois, _) = all_rois.size2()?;
            ensure!(
                num_rois > 0,
                DetectorError::shape("cannot sample targets from zero proposals")
            );
            let all_boxes = all_rois.narrow(1, 1, 4);

            // match each region to the ground truth of max overlap
            let (max_overlaps, gt_assignment) = if gt.is_empty() {
                (
                    Tensor::zeros(&[num_rois], (Kind::Float, device)),
                    Tensor::zeros(&[num_rois], (Kind::Int64, device)),
                )
            } else {
                bbox_overlaps(&all_boxes, &gt_boxes)?.max_dim(1, false)
            };
            let max_overlaps = Vec::<f32>::from(&max_overlaps);

            let fg_candidates: Vec<i64> = (0..num_rois)
                .filter(|&index| max_overlaps[index as usize] as f64 >= fg_threshold.raw())
                .collect();
            let bg_candidates: Vec<i64> = (0..num_rois)
                .filter(|&index| {
                    let overlap = max_overlaps[index as usize] as f64;
                    overlap < bg_threshold_hi.raw() && overlap >= bg_threshold_lo.raw()
                })
                .collect();

            // sample a fixed number of regions
            let (fg_indexes, bg_indexes) = {
                let fg_per_image = (fg_fraction.raw() * batch_size as f64).round() as usize;

                match (fg_candidates.is_empty(), bg_candidates.is_empty()) {
                    (false, false) => {
                        let num_fg = fg_per_image.min(fg_candidates.len());
                        let fg = sample_to_count(&fg_candidates, num_fg, rng);
                        let bg = sample_to_count(&bg_candidates, batch_size - num_fg, rng);
                        (fg, bg)
                    }
                    (false, true) => (sample_to_count(&fg_candidates, batch_size, rng), vec![]),
                    (true, false) => (vec![], sample_to_count(&bg_candidates, batch_size, rng)),
                    (true, true) => {
                        warn!(
                            "no foreground or background proposals found, sample background from all {} proposals",
                            num_rois
                        );
                        let all: Vec<i64> = (0..num_rois).collect();
                        (vec![], sample_with_replacement(&all, batch_size, rng))
                    }
                }
            };
            let num_foreground = fg_indexes.len() as i64;
            let keep = {
                let keep: Vec<i64> = fg_indexes.into_iter().chain(bg_indexes).collect();
                Tensor::of_slice(&keep).to_device(device)
            };
            let num_keep = keep.size1()?;

            let rois = all_rois.index_select(0, &keep);
            let roi_scores = all_scores.index_select(0, &keep);
            let assignment = gt_assignment.index_select(0, &keep);

            // background rows get the label 0
            let labels = {
                let fg_mask = Tensor::arange(num_keep, (Kind::Int64, device)).lt(num_foreground);
                if gt.is_empty() {
                    Tensor::zeros(&[num_keep], (Kind::Int64, device))
                } else {
                    gt_labels.index_select(0, &assignment) * fg_mask.to_kind(Kind::Int64)
                }
            };

            // class specific regression targets
            let target_data = if gt.is_empty() {
                Tensor::zeros(&[num_keep, 4], (Kind::Float, device))
            } else {
                let matched_gt = gt_boxes.index_select(0, &assignment);
                let targets = encode_boxes(&rois.narrow(1, 1, 4), &matched_gt)?;
                match &self.normalize {
                    Some((means, stds)) => {
                        let means = Tensor::of_slice(&means.map(|v| v as f32)).to_device(device);
                        let stds = Tensor::of_slice(&stds.map(|v| v as f32)).to_device(device);
                        (targets - means.view([1, 4])) / stds.view([1, 4])
                    }
                    None => targets,
                }
            };
            let class_mask = labels
                .one_hot(num_classes)
                .to_kind(Kind::Float)
                * labels.gt(0).to_kind(Kind::Float).view([-1, 1]);
            let class_mask = class_mask.view([num_keep, num_classes, 1]);
            let bbox_targets =
                (target_data.view([num_keep, 1, 4]) * &class_mask).view([num_keep, num_classes * 4]);
            let bbox_inside_weights = class_mask
                .expand(&[num_keep, num_classes, 4], false)
                .contiguous()
                .view([num_keep, num_classes * 4]);
            let bbox_outside_weights = bbox_inside_weights.gt(0.0).to_kind(Kind::Float);

            Ok(ProposalTargets {
                rois,
                roi_scores,
                labels,
                bbox_targets,
                bbox_inside_weights,
                bbox_outside_weights,
                num_foreground,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(batch_size: usize, normalize: bool) -> Result<ProposalTargetLayer> {
        ProposalTargetLayerInit {
            batch_size,
            fg_fraction: r64(0.25),
            fg_threshold: r64(0.5),
            bg_threshold_lo: r64(0.0),
            bg_threshold_hi: r64(0.5),
            use_gt: false,
            normalize: normalize.then(|| ([0.0; 4], [0.1, 0.1, 0.2, 0.2])),
        }
        .build()
    }

    fn proposals() -> Proposals {
        let rois = Tensor::of_slice(&[
            0f32, 0.0, 0.0, 15.0, 15.0, // foreground of gt 0
            0.0, 2.0, 2.0, 17.0, 17.0, // foreground of gt 0
            0.0, 40.0, 40.0, 55.0, 55.0, // foreground of gt 1
            0.0, 8.0, 8.0, 23.0, 23.0, // background
            0.0, 60.0, 0.0, 75.0, 15.0, // background
        ])
        .view([5, 5]);
        let scores = Tensor::of_slice(&[0.9f32, 0.8, 0.7, 0.6, 0.5]);
        Proposals { rois, scores }
    }

    fn ground_truth() -> GroundTruth {
        GroundTruth::from_boxes(
            &[[0.0, 0.0, 15.0, 15.0, 1.0], [40.0, 40.0, 55.0, 55.0, 2.0]],
            Device::Cpu,
        )
    }

    #[test]
    fn sampled_batch_has_fixed_size() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let targets = layer(8, false)?.forward(&proposals(), &ground_truth(), 3, &mut rng)?;

        assert_eq!(targets.rois.size(), vec![8, 5]);
        assert_eq!(targets.labels.size(), vec![8]);
        assert_eq!(targets.bbox_targets.size(), vec![8, 12]);
        assert_eq!(targets.num_foreground, 2);

        let labels = Vec::<i64>::from(&targets.labels);
        assert!(labels[..2].iter().all(|&label| label == 1 || label == 2));
        assert!(labels[2..].iter().all(|&label| label == 0));
        Ok(())
    }

    #[test]
    fn targets_only_in_assigned_class_slots() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(2);
        let targets = layer(8, false)?.forward(&proposals(), &ground_truth(), 3, &mut rng)?;
        let labels = Vec::<i64>::from(&targets.labels);

        for (row, &label) in labels.iter().enumerate() {
            let inside = Vec::<f32>::from(&targets.bbox_inside_weights.i(row as i64));
            let outside = Vec::<f32>::from(&targets.bbox_outside_weights.i(row as i64));
            let regression = Vec::<f32>::from(&targets.bbox_targets.i(row as i64));

            for slot in 0..12 {
                let in_class = label > 0 && slot / 4 == label as usize;
                assert_eq!(inside[slot], if in_class { 1.0 } else { 0.0 });
                assert_eq!(outside[slot], inside[slot]);
                if !in_class {
                    assert_eq!(regression[slot], 0.0);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn normalized_targets_are_scaled() -> Result<()> {
        let gt = GroundTruth::from_boxes(&[[2.0, 2.0, 17.0, 17.0, 1.0]], Device::Cpu);
        let proposals = Proposals {
            rois: Tensor::of_slice(&[0f32, 0.0, 0.0, 15.0, 15.0]).view([1, 5]),
            scores: Tensor::of_slice(&[0.9f32]),
        };

        let raw = layer(1, false)?.forward(&proposals, &gt, 2, &mut StdRng::seed_from_u64(0))?;
        let normalized = layer(1, true)?.forward(&proposals, &gt, 2, &mut StdRng::seed_from_u64(0))?;

        let raw = Vec::<f32>::from(&raw.bbox_targets.i(0));
        let normalized = Vec::<f32>::from(&normalized.bbox_targets.i(0));
        assert!((raw[4] - 0.125).abs() < 1e-6);
        assert!((normalized[4] - 1.25).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn empty_ground_truth_is_all_background() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let targets =
            layer(6, false)?.forward(&proposals(), &GroundTruth::empty(Device::Cpu), 3, &mut rng)?;

        assert_eq!(targets.num_foreground, 0);
        assert_eq!(Vec::<i64>::from(&targets.labels), vec![0; 6]);
        assert_eq!(i64::from(targets.bbox_inside_weights.sum(Kind::Int64)), 0);
        Ok(())
    }

    #[test]
    fn out_of_range_class_is_rejected() {
        let mut rng = StdRng::seed_from_u64(3);
        let result = layer(4, false)
            .and_then(|layer| layer.forward(&proposals(), &ground_truth(), 2, &mut rng));
        assert!(result.is_err());
    }
}
