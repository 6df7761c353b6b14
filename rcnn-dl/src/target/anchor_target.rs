use super::{bbox_overlaps, subsample};
use crate::{
    common::*,
    error::DetectorError,
    input::{GroundTruth, ImageInfo},
    proposal::encode_boxes,
};

/// Training targets of the region proposal network, one row per anchor.
#[derive(Debug, TensorLike)]
pub struct AnchorTargets {
    /// `[N]` labels, 1 for foreground, 0 for background and -1 to ignore.
    pub labels: Tensor,
    /// `[N, 4]` regression targets, non-zero only on foreground anchors.
    pub bbox_targets: Tensor,
    pub bbox_inside_weights: Tensor,
    pub bbox_outside_weights: Tensor,
}

impl AnchorTargets {
    pub fn num_foreground(&self) -> i64 {
        i64::from(self.labels.eq(1).sum(Kind::Int64))
    }

    pub fn num_background(&self) -> i64 {
        i64::from(self.labels.eq(0).sum(Kind::Int64))
    }
}

#[derive(Debug, Clone)]
pub struct AnchorTargetLayerInit {
    pub positive_overlap: R64,
    pub negative_overlap: R64,
    pub clobber_positives: bool,
    pub batch_size: usize,
    pub fg_fraction: R64,
    pub positive_weight: R64,
    pub allowed_border: R64,
}

impl AnchorTargetLayerInit {
    pub fn build(self) -> Result<AnchorTargetLayer> {
        let Self {
            positive_overlap,
            negative_overlap,
            clobber_positives,
            batch_size,
            fg_fraction,
            positive_weight,
            allowed_border,
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
            positive_weight < 0.0 || (positive_weight > 0.0 && positive_weight < 1.0),
            DetectorError::config("positive_weight must be negative or in range (0, 1)")
        );

        Ok(AnchorTargetLayer {
            positive_overlap,
            negative_overlap,
            clobber_positives,
            batch_size,
            fg_fraction,
            positive_weight,
            allowed_border,
        })
    }
}

/// Assigns foreground and background labels to anchors.
#[derive(Debug)]
pub struct AnchorTargetLayer {
    positive_overlap: R64,
    negative_overlap: R64,
    clobber_positives: bool,
    batch_size: usize,
    fg_fraction: R64,
    positive_weight: R64,
    allowed_border: R64,
}

impl AnchorTargetLayer {
    pub fn forward<R>(
        &self,
        anchors: &Tensor,
        gt: &GroundTruth,
        image_info: &ImageInfo,
        rng: &mut R,
    ) -> Result<AnchorTargets>
    where
        R: Rng,
    {
        tch::no_grad(|| -> Result<_> {
            let Self {
                positive_overlap,
                negative_overlap,
                clobber_positives,
                batch_size,
                fg_fraction,
                positive_weight,
                allowed_border,
            } = *self;
            let device = anchors.device();
            let anchors = anchors.to_kind(Kind::Float);
            let (num_anchors, _) = anchors.size2()?;

            // keep anchors inside the image
            let inside_indexes = {
                let border = allowed_border.raw();
                let mask = anchors
                    .select(1, 0)
                    .ge(-border)
                    .logical_and(&anchors.select(1, 1).ge(-border))
                    .logical_and(&anchors.select(1, 2).lt(image_info.width + border))
                    .logical_and(&anchors.select(1, 3).lt(image_info.height + border));
                mask.nonzero().view([-1])
            };
            let num_inside = inside_indexes.size1()? as usize;
            let inside_anchors = anchors.index_select(0, &inside_indexes);

            // label anchors by overlaps
            let mut labels = vec![-1i64; num_inside];
            let gt_boxes = gt.boxes();
            let assignment = if num_inside > 0 && !gt.is_empty() {
                let overlaps = bbox_overlaps(&inside_anchors, &gt_boxes)?;
                let (max_overlaps, argmax_overlaps) = overlaps.max_dim(1, false);
                let (gt_max_overlaps, _) = overlaps.max_dim(0, false);

                // the anchors that best match some ground truth box
                let gt_argmax_indexes: Vec<i64> = {
                    let gt_max_overlaps = gt_max_overlaps.view([1, -1]);
                    let is_max = overlaps
                        .eq_tensor(&gt_max_overlaps)
                        .logical_and(&gt_max_overlaps.gt(0.0));
                    Vec::from(&is_max.nonzero().select(1, 0).contiguous())
                };
                let max_overlaps = Vec::<f32>::from(&max_overlaps);

                let mark_negatives = |labels: &mut [i64]| {
                    labels
                        .iter_mut()
                        .zip(max_overlaps.iter())
                        .filter(|(_, &overlap)| (overlap as f64) < negative_overlap.raw())
                        .for_each(|(label, _)| *label = 0);
                };

                if !clobber_positives {
                    mark_negatives(&mut labels);
                }

                gt_argmax_indexes
                    .iter()
                    .for_each(|&index| labels[index as usize] = 1);
                labels
                    .iter_mut()
                    .zip(max_overlaps.iter())
                    .filter(|(_, &overlap)| overlap as f64 >= positive_overlap.raw())
                    .for_each(|(label, _)| *label = 1);

                if clobber_positives {
                    mark_negatives(&mut labels);
                }

                argmax_overlaps
            } else {
                labels.iter_mut().for_each(|label| *label = 0);
                Tensor::zeros(&[num_inside as i64], (Kind::Int64, device))
            };

            // subsample foreground and background
            {
                let num_fg = (fg_fraction.raw() * batch_size as f64) as usize;
                let fg_indexes = indexes_of(&labels, 1);
                let kept_fg = subsample(&fg_indexes, num_fg, rng);
                disable_unselected(&mut labels, &fg_indexes, &kept_fg);

                let num_bg = batch_size.saturating_sub(kept_fg.len());
                let bg_indexes = indexes_of(&labels, 0);
                let kept_bg = subsample(&bg_indexes, num_bg, rng);
                disable_unselected(&mut labels, &bg_indexes, &kept_bg);
            }

            let num_pos = labels.iter().filter(|&&label| label == 1).count();
            let num_neg = labels.iter().filter(|&&label| label == 0).count();

            // regression targets on foreground anchors only
            let positive_mask = Tensor::of_slice(&labels)
                .to_device(device)
                .eq(1)
                .to_kind(Kind::Float)
                .view([-1, 1]);
            let inside_targets = if gt.is_empty() || num_inside == 0 {
                Tensor::zeros(&[num_inside as i64, 4], (Kind::Float, device))
            } else {
                let matched_gt = gt_boxes.index_select(0, &assignment);
                encode_boxes(&inside_anchors, &matched_gt)? * &positive_mask
            };
            let inside_weights = positive_mask.repeat(&[1, 4]);

            let outside_weights = {
                let (pos_weight, neg_weight) = if positive_weight < 0.0 {
                    let weight = 1.0 / num_pos.saturating_add(num_neg).max(1) as f64;
                    (weight, weight)
                } else {
                    let p = positive_weight.raw();
                    (p / num_pos.max(1) as f64, (1.0 - p) / num_neg.max(1) as f64)
                };
                let weights: Vec<f32> = labels
                    .iter()
                    .map(|&label| match label {
                        1 => pos_weight as f32,
                        0 => neg_weight as f32,
                        _ => 0.0,
                    })
                    .collect();
                Tensor::of_slice(&weights)
                    .to_device(device)
                    .view([-1, 1])
                    .repeat(&[1, 4])
            };

            // map back to the full anchor set
            let labels = {
                let inside_labels = Tensor::of_slice(&labels).to_device(device);
                Tensor::full(&[num_anchors], -1, (Kind::Int64, device)).index_copy(
                    0,
                    &inside_indexes,
                    &inside_labels,
                )
            };
            let unmap = |values: &Tensor| {
                Tensor::zeros(&[num_anchors, 4], (Kind::Float, device)).index_copy(
                    0,
                    &inside_indexes,
                    values,
                )
            };

            Ok(AnchorTargets {
                labels,
                bbox_targets: unmap(&inside_targets),
                bbox_inside_weights: unmap(&inside_weights),
                bbox_outside_weights: unmap(&outside_weights),
            })
        })
    }
}

fn indexes_of(labels: &[i64], value: i64) -> Vec<i64> {
    labels
        .iter()
        .enumerate()
        .filter(|(_, &label)| label == value)
        .map(|(index, _)| index as i64)
        .collect()
}

fn disable_unselected(labels: &mut [i64], candidates: &[i64], selected: &[i64]) {
    if candidates.len() == selected.len() {
        return;
    }
    let selected: HashSet<_> = selected.iter().collect();
    candidates
        .iter()
        .filter(|index| !selected.contains(index))
        .for_each(|&index| labels[index as usize] = -1);
}
