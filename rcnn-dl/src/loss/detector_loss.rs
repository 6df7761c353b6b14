use super::{CrossEntropyLoss, SmoothL1Loss};
use crate::{
    common::*,
    config::TrainingMode,
    error::DetectorError,
    model::{ForwardOutput, RcnnOutput, RpnOutput},
    target::{AnchorTargets, ProposalTargets},
};

#[derive(Debug, Clone)]
pub struct DetectorLossInit {
    pub mode: TrainingMode,
    pub rpn_sigma: R64,
    pub rcnn_sigma: R64,
}

impl DetectorLossInit {
    pub fn build(self) -> Result<DetectorLoss> {
        let Self {
            mode,
            rpn_sigma,
            rcnn_sigma,
        } = self;

        Ok(DetectorLoss {
            mode,
            cross_entropy: CrossEntropyLoss::new(Reduction::Mean),
            rpn_smooth_l1: SmoothL1Loss::new(rpn_sigma.raw(), vec![1, 2])?,
            rcnn_smooth_l1: SmoothL1Loss::new(rcnn_sigma.raw(), vec![1])?,
        })
    }
}

/// The loss terms of a training step.
///
/// Terms that the training mode disables are `None`. The `total_loss` is the
/// sum of the present terms.
#[derive(Debug)]
pub struct DetectorLosses {
    pub rpn_cross_entropy: Option<Tensor>,
    pub rpn_loss_box: Option<Tensor>,
    pub cross_entropy: Option<Tensor>,
    pub loss_box: Option<Tensor>,
    pub total_loss: Tensor,
}

impl DetectorLosses {
    /// The present terms with their names.
    pub fn terms(&self) -> Vec<(&'static str, &Tensor)> {
        [
            ("rpn_cross_entropy", &self.rpn_cross_entropy),
            ("rpn_loss_box", &self.rpn_loss_box),
            ("cross_entropy", &self.cross_entropy),
            ("loss_box", &self.loss_box),
        ]
        .into_iter()
        .filter_map(|(name, term)| term.as_ref().map(|term| (name, term)))
        .collect()
    }
}

/// Assembles the losses of both stages according to the training mode.
#[derive(Debug)]
pub struct DetectorLoss {
    mode: TrainingMode,
    cross_entropy: CrossEntropyLoss,
    rpn_smooth_l1: SmoothL1Loss,
    rcnn_smooth_l1: SmoothL1Loss,
}

impl DetectorLoss {
    /// Compute the losses of a training forward pass.
    ///
    /// The `mix_coefficient` is the weight of the first label set in mixing
    /// modes, and is ignored in the standard mode. The second stage terms
    /// use the region mixup coefficient instead when the forward pass drew one.
    pub fn forward(&self, output: &ForwardOutput, mix_coefficient: f64) -> Result<DetectorLosses> {
        ensure!(
            (0.0..=1.0).contains(&mix_coefficient),
            DetectorError::config(format!(
                "mix coefficient must be in range [0, 1], but get {}",
                mix_coefficient
            ))
        );
        let targets = output.targets.as_ref().ok_or_else(|| {
            DetectorError::config("losses can only be computed on training outputs")
        })?;

        let (rpn_cross_entropy, rpn_loss_box) = match self.mode {
            TrainingMode::Standard => {
                let (ce, loss_box) = self.rpn_losses(&output.rpn, &targets.anchor)?;
                (Some(ce), Some(loss_box))
            }
            TrainingMode::RpnMix | TrainingMode::RpnMixOnly => {
                let anchor_mix = targets.anchor_mix.as_ref().ok_or_else(|| {
                    DetectorError::config("anchor targets of the second ground truth set are missing")
                })?;
                let (ce1, loss_box1) = self.rpn_losses(&output.rpn, &targets.anchor)?;
                let (ce2, loss_box2) = self.rpn_losses(&output.rpn, anchor_mix)?;
                (
                    Some(blend(ce1, ce2, mix_coefficient)),
                    Some(blend(loss_box1, loss_box2, mix_coefficient)),
                )
            }
            TrainingMode::RcnnMix => (None, None),
        };

        let (cross_entropy, loss_box) = if self.mode.has_rcnn() {
            let rcnn = output.rcnn.as_ref().ok_or_else(|| {
                DetectorError::config("second stage outputs are missing")
            })?;
            let proposal = targets.proposal.as_ref().ok_or_else(|| {
                DetectorError::config("proposal targets are missing")
            })?;
            let (ce, loss_box) = self.rcnn_losses(rcnn, proposal, None)?;

            match (self.mode, &targets.permutation) {
                (TrainingMode::RcnnMix, Some(permutation)) => {
                    let coefficient = targets.region_mix_coefficient.unwrap_or(mix_coefficient);
                    let (ce2, loss_box2) = self.rcnn_losses(rcnn, proposal, Some(permutation))?;
                    (
                        Some(blend(ce, ce2, coefficient)),
                        Some(blend(loss_box, loss_box2, coefficient)),
                    )
                }
                _ => (Some(ce), Some(loss_box)),
            }
        } else {
            (None, None)
        };

        let total_loss = [
            &rpn_cross_entropy,
            &rpn_loss_box,
            &cross_entropy,
            &loss_box,
        ]
        .into_iter()
        .flatten()
        .fold(
            Tensor::zeros(&[], (Kind::Float, output.rpn.cls_logits.device())),
            |total, term| total + term,
        );

        Ok(DetectorLosses {
            rpn_cross_entropy,
            rpn_loss_box,
            cross_entropy,
            loss_box,
            total_loss,
        })
    }

    fn rpn_losses(&self, rpn: &RpnOutput, targets: &AnchorTargets) -> Result<(Tensor, Tensor)> {
        let select = targets.labels.ne(-1).nonzero().view([-1]);
        let cross_entropy = self.cross_entropy.forward(
            &rpn.cls_logits.index_select(0, &select),
            &targets.labels.index_select(0, &select),
        )?;

        let loss_box = self.rpn_smooth_l1.forward(
            &rpn.bbox_pred.unsqueeze(0),
            &targets.bbox_targets.unsqueeze(0),
            &targets.bbox_inside_weights.unsqueeze(0),
            &targets.bbox_outside_weights.unsqueeze(0),
        );

        Ok((cross_entropy, loss_box))
    }

    fn rcnn_losses(
        &self,
        rcnn: &RcnnOutput,
        targets: &ProposalTargets,
        permutation: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let select = |tensor: &Tensor| match permutation {
            Some(permutation) => tensor.index_select(0, permutation),
            None => tensor.shallow_clone(),
        };

        let cross_entropy = self
            .cross_entropy
            .forward(&rcnn.cls_score, &select(&targets.labels))?;
        let loss_box = self.rcnn_smooth_l1.forward(
            &rcnn.bbox_pred,
            &select(&targets.bbox_targets),
            &select(&targets.bbox_inside_weights),
            &select(&targets.bbox_outside_weights),
        );

        Ok((cross_entropy, loss_box))
    }
}

fn blend(first: Tensor, second: Tensor, coefficient: f64) -> Tensor {
    first * coefficient + second * (1.0 - coefficient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{anchor::generate_anchors, input::Mode, model::TrainTargets, proposal::Proposals};
    use approx::assert_abs_diff_eq;

    const NUM_ANCHORS: i64 = 6;
    const NUM_REGIONS: i64 = 4;
    const NUM_CLASSES: i64 = 3;

    fn loss_fn(mode: TrainingMode) -> Result<DetectorLoss> {
        DetectorLossInit {
            mode,
            rpn_sigma: r64(3.0),
            rcnn_sigma: r64(1.0),
        }
        .build()
    }

    fn anchor_targets(labels: &[i64]) -> AnchorTargets {
        let labels = Tensor::of_slice(labels);
        let fg = labels.eq(1).to_kind(Kind::Float).view([-1, 1]);
        let bbox_inside_weights = fg.expand(&[NUM_ANCHORS, 4], false).contiguous();
        AnchorTargets {
            labels,
            bbox_targets: Tensor::randn(&[NUM_ANCHORS, 4], (Kind::Float, Device::Cpu)),
            bbox_outside_weights: &bbox_inside_weights / NUM_ANCHORS as f64,
            bbox_inside_weights,
        }
    }

    fn proposal_targets() -> ProposalTargets {
        let labels = Tensor::of_slice(&[1i64, 2, 0, 0]);
        let class_mask = labels.one_hot(NUM_CLASSES).to_kind(Kind::Float)
            * labels.gt(0).to_kind(Kind::Float).view([-1, 1]);
        let bbox_inside_weights = class_mask
            .view([NUM_REGIONS, NUM_CLASSES, 1])
            .expand(&[NUM_REGIONS, NUM_CLASSES, 4], false)
            .contiguous()
            .view([NUM_REGIONS, NUM_CLASSES * 4]);
        ProposalTargets {
            rois: Tensor::zeros(&[NUM_REGIONS, 5], (Kind::Float, Device::Cpu)),
            roi_scores: Tensor::zeros(&[NUM_REGIONS], (Kind::Float, Device::Cpu)),
            labels,
            bbox_targets: Tensor::randn(&[NUM_REGIONS, NUM_CLASSES * 4], (Kind::Float, Device::Cpu))
                * &bbox_inside_weights,
            bbox_outside_weights: bbox_inside_weights.shallow_clone(),
            bbox_inside_weights,
            num_foreground: 2,
        }
    }

    fn forward_output(mode: TrainingMode, permutation: Option<&[i64]>) -> Result<ForwardOutput> {
        tch::manual_seed(11);
        let device = Device::Cpu;
        let anchors = generate_anchors(1, 1, 16, &[8.0, 16.0], &[0.5, 1.0, 2.0], device)?;

        let cls_logits = Tensor::randn(&[NUM_ANCHORS, 2], (Kind::Float, device));
        let rpn = RpnOutput {
            fg_prob: cls_logits.softmax(1, Kind::Float).select(1, 1),
            cls_logits,
            bbox_pred: Tensor::randn(&[NUM_ANCHORS, 4], (Kind::Float, device)),
        };
        let cls_score = Tensor::randn(&[NUM_REGIONS, NUM_CLASSES], (Kind::Float, device));
        let rcnn = mode.has_rcnn().then(|| RcnnOutput {
            cls_prob: cls_score.softmax(1, Kind::Float),
            cls_score,
            bbox_pred: Tensor::randn(&[NUM_REGIONS, NUM_CLASSES * 4], (Kind::Float, device)),
        });

        let targets = TrainTargets {
            anchor: anchor_targets(&[1, 0, -1, 0, 1, -1]),
            anchor_mix: mode
                .is_rpn_mix()
                .then(|| anchor_targets(&[0, 1, 1, -1, 0, 0])),
            proposal: mode.has_rcnn().then(proposal_targets),
            permutation: permutation.map(Tensor::of_slice),
            region_mix_coefficient: None,
        };

        Ok(ForwardOutput {
            mode: Mode::Train,
            anchors,
            rpn,
            proposals: Proposals {
                rois: Tensor::zeros(&[NUM_REGIONS, 5], (Kind::Float, device)),
                scores: Tensor::zeros(&[NUM_REGIONS], (Kind::Float, device)),
            },
            rcnn,
            targets: Some(targets),
        })
    }

    fn value(term: &Option<Tensor>) -> f64 {
        f64::from(term.as_ref().unwrap())
    }

    fn assert_total_is_sum(losses: &DetectorLosses) {
        let sum: f64 = losses.terms().into_iter().map(|(_, term)| f64::from(term)).sum();
        assert_abs_diff_eq!(f64::from(&losses.total_loss), sum, epsilon = 1e-5);
    }

    #[test]
    fn total_is_sum_of_active_terms() -> Result<()> {
        let cases = [
            (
                TrainingMode::Standard,
                None,
                vec!["rpn_cross_entropy", "rpn_loss_box", "cross_entropy", "loss_box"],
            ),
            (
                TrainingMode::RpnMix,
                None,
                vec!["rpn_cross_entropy", "rpn_loss_box", "cross_entropy", "loss_box"],
            ),
            (
                TrainingMode::RpnMixOnly,
                None,
                vec!["rpn_cross_entropy", "rpn_loss_box"],
            ),
            (
                TrainingMode::RcnnMix,
                Some(&[3i64, 2, 1, 0][..]),
                vec!["cross_entropy", "loss_box"],
            ),
        ];

        for (mode, permutation, expect) in cases {
            let output = forward_output(mode, permutation)?;
            let losses = loss_fn(mode)?.forward(&output, 0.4)?;
            let names: Vec<_> = losses.terms().into_iter().map(|(name, _)| name).collect();
            assert_eq!(names, expect);
            assert_total_is_sum(&losses);
        }
        Ok(())
    }

    #[test]
    fn rcnn_mix_extremes_reduce_to_single_targets() -> Result<()> {
        let permutation = [3i64, 2, 1, 0];
        let output = forward_output(TrainingMode::RcnnMix, Some(&permutation))?;
        let loss_fn = loss_fn(TrainingMode::RcnnMix)?;
        let rcnn = output.rcnn.as_ref().unwrap();
        let proposal = output.targets.as_ref().unwrap().proposal.as_ref().unwrap();

        let (ce, loss_box) = loss_fn.rcnn_losses(rcnn, proposal, None)?;
        let (ce_perm, loss_box_perm) =
            loss_fn.rcnn_losses(rcnn, proposal, Some(&Tensor::of_slice(&permutation)))?;

        let first = loss_fn.forward(&output, 1.0)?;
        assert_abs_diff_eq!(value(&first.cross_entropy), f64::from(&ce), epsilon = 1e-6);
        assert_abs_diff_eq!(value(&first.loss_box), f64::from(&loss_box), epsilon = 1e-6);

        let second = loss_fn.forward(&output, 0.0)?;
        assert_abs_diff_eq!(value(&second.cross_entropy), f64::from(&ce_perm), epsilon = 1e-6);
        assert_abs_diff_eq!(value(&second.loss_box), f64::from(&loss_box_perm), epsilon = 1e-6);

        let mixed = loss_fn.forward(&output, 0.3)?;
        assert_abs_diff_eq!(
            value(&mixed.cross_entropy),
            0.3 * f64::from(&ce) + 0.7 * f64::from(&ce_perm),
            epsilon = 1e-5
        );
        Ok(())
    }

    #[test]
    fn region_mix_coefficient_overrides_batch_coefficient() -> Result<()> {
        let permutation = [1i64, 0, 3, 2];
        let mut output = forward_output(TrainingMode::RcnnMix, Some(&permutation))?;
        let loss_fn = loss_fn(TrainingMode::RcnnMix)?;

        let expect = loss_fn.forward(&output, 0.8)?;
        output.targets.as_mut().unwrap().region_mix_coefficient = Some(0.8);
        let losses = loss_fn.forward(&output, 0.1)?;

        assert_abs_diff_eq!(
            value(&losses.cross_entropy),
            value(&expect.cross_entropy),
            epsilon = 1e-6
        );
        assert_abs_diff_eq!(value(&losses.loss_box), value(&expect.loss_box), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn rpn_mix_extremes_reduce_to_single_targets() -> Result<()> {
        let output = forward_output(TrainingMode::RpnMix, None)?;
        let targets = output.targets.as_ref().unwrap();
        let loss_fn = loss_fn(TrainingMode::RpnMix)?;

        let (ce1, loss_box1) = loss_fn.rpn_losses(&output.rpn, &targets.anchor)?;
        let (ce2, loss_box2) =
            loss_fn.rpn_losses(&output.rpn, targets.anchor_mix.as_ref().unwrap())?;

        let first = loss_fn.forward(&output, 1.0)?;
        assert_abs_diff_eq!(value(&first.rpn_cross_entropy), f64::from(&ce1), epsilon = 1e-6);
        assert_abs_diff_eq!(value(&first.rpn_loss_box), f64::from(&loss_box1), epsilon = 1e-6);

        let second = loss_fn.forward(&output, 0.0)?;
        assert_abs_diff_eq!(value(&second.rpn_cross_entropy), f64::from(&ce2), epsilon = 1e-6);
        assert_abs_diff_eq!(value(&second.rpn_loss_box), f64::from(&loss_box2), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn invalid_coefficient_and_test_outputs_are_rejected() -> Result<()> {
        let loss_fn = loss_fn(TrainingMode::Standard)?;
        let mut output = forward_output(TrainingMode::Standard, None)?;
        assert!(loss_fn.forward(&output, -0.1).is_err());

        output.targets = None;
        let err = loss_fn.forward(&output, 1.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DetectorError>(),
            Some(DetectorError::Configuration(_))
        ));
        Ok(())
    }
}
