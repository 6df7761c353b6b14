use crate::{
    anchor::Anchors,
    common::*,
    input::Mode,
    proposal::Proposals,
    target::{AnchorTargets, ProposalTargets},
};

/// Per-anchor outputs of the region proposal network.
#[derive(Debug, TensorLike)]
pub struct RpnOutput {
    /// `[N, 2]` background and foreground logits.
    pub cls_logits: Tensor,
    /// `[N]` foreground probability.
    pub fg_prob: Tensor,
    /// `[N, 4]` regression deltas.
    pub bbox_pred: Tensor,
}

/// Per-region outputs of the second stage.
#[derive(Debug, TensorLike)]
pub struct RcnnOutput {
    /// `[R, num_classes]` logits.
    pub cls_score: Tensor,
    pub cls_prob: Tensor,
    /// `[R, 4 * num_classes]` class specific regression deltas.
    pub bbox_pred: Tensor,
}

/// Targets computed in a training forward pass.
#[derive(Debug)]
pub struct TrainTargets {
    pub anchor: AnchorTargets,
    /// Anchor targets of the second ground truth set in RPN mixing modes.
    pub anchor_mix: Option<AnchorTargets>,
    /// Absent when the second stage is disabled.
    pub proposal: Option<ProposalTargets>,
    /// The region permutation applied by region mixing.
    pub permutation: Option<Tensor>,
    /// The drawn mixup coefficient of the regions. It weights the second
    /// stage terms in place of the batch mix coefficient.
    pub region_mix_coefficient: Option<f64>,
}

#[derive(Debug)]
pub struct ForwardOutput {
    pub mode: Mode,
    pub anchors: Anchors,
    pub rpn: RpnOutput,
    /// The regions fed to the second stage. In training these are the sampled regions.
    pub proposals: Proposals,
    pub rcnn: Option<RcnnOutput>,
    pub targets: Option<TrainTargets>,
}

/// Inference outputs of one image.
#[derive(Debug, TensorLike)]
pub struct TestOutput {
    pub cls_score: Tensor,
    pub cls_prob: Tensor,
    /// `[R, 4 * num_classes]` de-normalized regression deltas.
    pub bbox_pred: Tensor,
    /// `[R, 5]` regions with the batch index column.
    pub rois: Tensor,
}
