use super::{
    Backbone, ForwardOutput, GradientEngine, RcnnHead, RcnnHeadInit, RcnnOutput, RpnHead,
    RpnHeadInit, TestOutput, TrainTargets,
};
use crate::{
    anchor::{generate_anchors, Anchors},
    block_mix::{BlockMix, BlockMixInit, Mixup, MixupInit},
    common::*,
    config::{AnchorConfig, Config, ProposalMode, TrainingMode},
    error::DetectorError,
    input::{GroundTruth, ImageInfo, Mode},
    loss::{DetectorLoss, DetectorLossInit, DetectorLosses},
    pooling::{RoiPooler, RoiPoolerInit},
    proposal::{Proposals, ScoreNmsProposal, ScoreNmsProposalInit, TopKProposal, TopKProposalInit},
    target::{AnchorTargetLayer, AnchorTargetLayerInit, ProposalTargetLayer, ProposalTargetLayerInit},
};

/// A training example with an optional second label set for mixing modes.
#[derive(Debug)]
pub struct TrainBatch {
    /// `[1, 3, H, W]` image.
    pub image: Tensor,
    pub image_info: ImageInfo,
    pub gt_boxes: GroundTruth,
    pub gt_boxes_mix: Option<GroundTruth>,
    /// Weight of the first label set in mixing modes.
    pub mix_coefficient: f64,
}

/// Scalar losses of a training step. Terms disabled by the training mode are `None`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainStepOutput {
    pub rpn_cross_entropy: Option<f64>,
    pub rpn_loss_box: Option<f64>,
    pub cross_entropy: Option<f64>,
    pub loss_box: Option<f64>,
    pub total_loss: f64,
}

/// Statistics of the last forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepSummary {
    pub num_proposals: i64,
    pub rpn_num_foreground: Option<i64>,
    pub rpn_num_background: Option<i64>,
    pub rcnn_num_foreground: Option<i64>,
    pub rcnn_num_background: Option<i64>,
}

#[derive(Debug)]
enum TestProposal {
    Nms(ScoreNmsProposal),
    Top(TopKProposal),
}

/// The two-stage detector.
///
/// The detector owns its random generator, so that a detector built from the
/// same configuration seed draws the same samples.
#[derive(Derivative, CopyGetters)]
#[derivative(Debug(bound = ""))]
pub struct Detector<B>
where
    B: Backbone,
{
    #[derivative(Debug = "ignore")]
    backbone: B,
    #[get_copy = "pub"]
    mode: TrainingMode,
    #[get_copy = "pub"]
    num_classes: i64,
    #[get_copy = "pub"]
    device: Device,
    anchor_config: AnchorConfig,
    rpn_head: RpnHead,
    rcnn_head: RcnnHead,
    train_proposal: ScoreNmsProposal,
    test_proposal: TestProposal,
    anchor_target: AnchorTargetLayer,
    proposal_target: ProposalTargetLayer,
    pooler: RoiPooler,
    block_mix: BlockMix,
    mixup: Option<Mixup>,
    loss: DetectorLoss,
    /// Means and stds of the regression targets, set when the targets are normalized.
    bbox_normalize: Option<([f64; 4], [f64; 4])>,
    rng: StdRng,
    summary: Option<StepSummary>,
}

impl<B> Detector<B>
where
    B: Backbone,
{
    pub fn new<'p, P>(path: P, backbone: B, config: &Config, num_classes: i64) -> Result<Self>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        config.validate()?;
        let mode = config.training_mode()?;
        ensure!(
            num_classes >= 2,
            DetectorError::config(format!(
                "num_classes must include the background class, but get {}",
                num_classes
            ))
        );

        let Config {
            ref anchors,
            ref rpn,
            ref rcnn,
            ref pooling,
            proposal_mode,
            ref block_mix,
            seed,
            ..
        } = *config;

        let rpn_head = RpnHeadInit {
            in_c: backbone.feature_channels(),
            channels: rpn.channels,
            num_anchors: anchors.num_anchors() as i64,
            truncated_init: rcnn.truncated_init,
        }
        .build(path);
        let rcnn_head = RcnnHeadInit {
            in_c: backbone.vector_channels(),
            num_classes,
            truncated_init: rcnn.truncated_init,
        }
        .build(path);

        let train_proposal = ScoreNmsProposalInit {
            pre_nms_top_n: rpn.train.pre_nms_top_n,
            post_nms_top_n: rpn.train.post_nms_top_n,
            nms_threshold: rpn.train.nms_threshold,
            min_size: rpn.train.min_size,
        }
        .build()?;
        let test_proposal = match proposal_mode {
            ProposalMode::Nms => TestProposal::Nms(
                ScoreNmsProposalInit {
                    pre_nms_top_n: rpn.test.pre_nms_top_n,
                    post_nms_top_n: rpn.test.post_nms_top_n,
                    nms_threshold: rpn.test.nms_threshold,
                    min_size: rpn.test.min_size,
                }
                .build()?,
            ),
            ProposalMode::Top => TestProposal::Top(
                TopKProposalInit {
                    top_n: rpn.test.top_n,
                }
                .build()?,
            ),
        };

        let anchor_target = AnchorTargetLayerInit {
            positive_overlap: rpn.positive_overlap,
            negative_overlap: rpn.negative_overlap,
            clobber_positives: rpn.clobber_positives,
            batch_size: rpn.batch_size,
            fg_fraction: rpn.fg_fraction,
            positive_weight: rpn.positive_weight,
            allowed_border: rpn.allowed_border,
        }
        .build()?;
        let bbox_normalize = rcnn
            .bbox_normalize_targets_precomputed
            .then(|| (rcnn.bbox_normalize_means, rcnn.bbox_normalize_stds));
        let proposal_target = ProposalTargetLayerInit {
            batch_size: rcnn.batch_size,
            fg_fraction: rcnn.fg_fraction,
            fg_threshold: rcnn.fg_threshold,
            bg_threshold_lo: rcnn.bg_threshold_lo,
            bg_threshold_hi: rcnn.bg_threshold_hi,
            use_gt: rcnn.use_gt,
            normalize: bbox_normalize,
        }
        .build()?;

        let pooler = RoiPoolerInit {
            mode: pooling.mode,
            size: pooling.size,
            spatial_scale: 1.0 / anchors.feat_stride as f64,
            max_pool: pooling.crop_max_pool,
        }
        .build()?;
        let block_mix_layer = BlockMixInit {
            drop_prob: block_mix.drop_prob,
            block_size: block_mix.block_size,
        }
        .build()?;
        let mixup = block_mix
            .mixup
            .then(|| {
                MixupInit {
                    alpha: block_mix.mixup_alpha,
                }
                .build()
            })
            .transpose()?;
        let loss = DetectorLossInit {
            mode,
            rpn_sigma: rpn.sigma,
            rcnn_sigma: rcnn.sigma,
        }
        .build()?;

        info!("training mode: {}", mode);
        info!(
            "pooling mode: {}, test proposal mode: {}",
            String::from(pooling.mode),
            String::from(proposal_mode)
        );
        if mode == TrainingMode::RcnnMix && mixup.is_some() {
            info!("region mixup alpha: {}", block_mix.mixup_alpha);
        }

        Ok(Self {
            backbone,
            mode,
            num_classes,
            device: path.device(),
            anchor_config: anchors.clone(),
            rpn_head,
            rcnn_head,
            train_proposal,
            test_proposal,
            anchor_target,
            proposal_target,
            pooler,
            block_mix: block_mix_layer,
            mixup,
            loss,
            bbox_normalize,
            rng: StdRng::seed_from_u64(seed),
            summary: None,
        })
    }

    /// Statistics of the last training forward pass, cleared after each training step.
    pub fn summary(&self) -> Option<&StepSummary> {
        self.summary.as_ref()
    }

    /// Run both stages on one image.
    ///
    /// In training, `gt` is required, and `gt_mix` is required in addition in
    /// the RPN mixing modes. The returned targets carry everything the loss
    /// needs, including the region permutation of block mixing.
    pub fn forward(
        &mut self,
        image: &Tensor,
        image_info: &ImageInfo,
        gt: Option<&GroundTruth>,
        gt_mix: Option<&GroundTruth>,
        mode: Mode,
    ) -> Result<ForwardOutput> {
        let train = mode == Mode::Train;
        let (batch_size, _, _, _) = image.size4().map_err(|_| {
            DetectorError::shape(format!(
                "expect a [1, 3, height, width] image, but get {:?}",
                image.size()
            ))
        })?;
        ensure!(
            batch_size == 1,
            DetectorError::shape(format!(
                "only a single image per batch is supported, but get {}",
                batch_size
            ))
        );

        let features = self.backbone.image_to_features(image, train);
        let anchors = self.anchors_for(&features)?;
        let rpn = self.rpn_head.forward(&features)?;

        let (proposals, mut targets) = if train {
            let gt = gt.ok_or_else(|| {
                DetectorError::config("ground truth boxes are required in training")
            })?;
            let rpn_proposals =
                self.train_proposal
                    .forward(&rpn.fg_prob, &rpn.bbox_pred, anchors.boxes(), image_info)?;

            let anchor =
                self.anchor_target
                    .forward(anchors.boxes(), gt, image_info, &mut self.rng)?;
            let anchor_mix = if self.mode.is_rpn_mix() {
                let gt_mix = gt_mix.ok_or_else(|| {
                    DetectorError::config(format!(
                        "the second ground truth set is required in {} training",
                        self.mode
                    ))
                })?;
                Some(
                    self.anchor_target
                        .forward(anchors.boxes(), gt_mix, image_info, &mut self.rng)?,
                )
            } else {
                None
            };

            let proposal = if self.mode.has_rcnn() {
                Some(self.proposal_target.forward(
                    &rpn_proposals,
                    gt,
                    self.num_classes,
                    &mut self.rng,
                )?)
            } else {
                None
            };

            let proposals = match &proposal {
                Some(proposal) => Proposals {
                    rois: proposal.rois.shallow_clone(),
                    scores: proposal.roi_scores.shallow_clone(),
                },
                None => rpn_proposals,
            };

            let targets = TrainTargets {
                anchor,
                anchor_mix,
                proposal,
                permutation: None,
                region_mix_coefficient: None,
            };
            (proposals, Some(targets))
        } else {
            let proposals = match &self.test_proposal {
                TestProposal::Nms(layer) => {
                    layer.forward(&rpn.fg_prob, &rpn.bbox_pred, anchors.boxes(), image_info)?
                }
                TestProposal::Top(layer) => layer.forward(
                    &rpn.fg_prob,
                    &rpn.bbox_pred,
                    anchors.boxes(),
                    image_info,
                    &mut self.rng,
                )?,
            };
            (proposals, None)
        };

        let rcnn = if self.mode.has_rcnn() {
            let pooled = self.pooler.forward(&features, &proposals.rois)?;

            let pooled = match (self.mode, &mut targets) {
                (TrainingMode::RcnnMix, Some(targets)) => {
                    let (mixed, permutation, coefficient) =
                        self.mix_regions(&pooled.detach())?;
                    targets.permutation = permutation;
                    targets.region_mix_coefficient = coefficient;
                    mixed
                }
                _ => pooled,
            };

            let vectors = self.backbone.features_to_vector(&pooled, train);
            Some(self.rcnn_head.forward(&vectors))
        } else {
            None
        };

        if let Some(targets) = &targets {
            self.summary = Some(StepSummary {
                num_proposals: proposals.num_proposals(),
                rpn_num_foreground: Some(targets.anchor.num_foreground()),
                rpn_num_background: Some(targets.anchor.num_background()),
                rcnn_num_foreground: targets.proposal.as_ref().map(|p| p.num_foreground),
                rcnn_num_background: targets
                    .proposal
                    .as_ref()
                    .map(|p| p.rois.size()[0] - p.num_foreground),
            });
        }

        Ok(ForwardOutput {
            mode,
            anchors,
            rpn,
            proposals,
            rcnn,
            targets,
        })
    }

    /// Compute the losses of a training forward pass.
    pub fn losses(&self, output: &ForwardOutput, mix_coefficient: f64) -> Result<DetectorLosses> {
        self.loss.forward(output, mix_coefficient)
    }

    /// Run a forward pass, compute the losses and update the parameters.
    pub fn train_step<E>(&mut self, batch: &TrainBatch, engine: &mut E) -> Result<TrainStepOutput>
    where
        E: GradientEngine,
    {
        let losses = self.backward_step(batch, engine)?;
        let scalar = |term: &Option<Tensor>| term.as_ref().map(f64::from);

        let output = TrainStepOutput {
            rpn_cross_entropy: scalar(&losses.rpn_cross_entropy),
            rpn_loss_box: scalar(&losses.rpn_loss_box),
            cross_entropy: scalar(&losses.cross_entropy),
            loss_box: scalar(&losses.loss_box),
            total_loss: f64::from(&losses.total_loss),
        };
        debug!("training losses: {:?}", output);

        self.delete_intermediate_states();
        Ok(output)
    }

    /// Same as [Detector::train_step] without reading the losses back.
    pub fn train_step_no_return<E>(&mut self, batch: &TrainBatch, engine: &mut E) -> Result<()>
    where
        E: GradientEngine,
    {
        self.backward_step(batch, engine)?;
        self.delete_intermediate_states();
        Ok(())
    }

    /// Run inference on one image.
    ///
    /// When the regression targets are normalized in training, the box
    /// predictions are de-normalized by the configured means and standard
    /// deviations.
    pub fn test_image(&mut self, image: &Tensor, image_info: &ImageInfo) -> Result<TestOutput> {
        ensure!(
            self.mode.has_rcnn(),
            DetectorError::config(format!(
                "second stage outputs are not available in {} mode",
                self.mode
            ))
        );

        tch::no_grad(|| -> Result<_> {
            let ForwardOutput {
                proposals, rcnn, ..
            } = self.forward(image, image_info, None, None, Mode::Test)?;
            let RcnnOutput {
                cls_score,
                cls_prob,
                bbox_pred,
            } = rcnn.ok_or_else(|| DetectorError::config("second stage outputs are missing"))?;

            let bbox_pred = match &self.bbox_normalize {
                Some((means, stds)) => {
                    let expand = |values: &[f64; 4]| {
                        Tensor::of_slice(values)
                            .to_device(bbox_pred.device())
                            .to_kind(bbox_pred.kind())
                            .repeat(&[self.num_classes])
                            .unsqueeze(0)
                    };
                    &bbox_pred * expand(stds) + expand(means)
                }
                None => bbox_pred,
            };

            Ok(TestOutput {
                cls_score,
                cls_prob,
                bbox_pred,
                rois: proposals.rois,
            })
        })
    }

    /// Compute the backbone feature map of an image.
    pub fn extract_head(&self, image: &Tensor) -> Tensor {
        tch::no_grad(|| self.backbone.image_to_features(image, false))
    }

    /// Drop the per-step scratch state.
    pub fn delete_intermediate_states(&mut self) {
        self.summary = None;
    }

    fn backward_step<E>(&mut self, batch: &TrainBatch, engine: &mut E) -> Result<DetectorLosses>
    where
        E: GradientEngine,
    {
        let TrainBatch {
            ref image,
            ref image_info,
            ref gt_boxes,
            ref gt_boxes_mix,
            mix_coefficient,
        } = *batch;

        let output = self.forward(
            image,
            image_info,
            Some(gt_boxes),
            gt_boxes_mix.as_ref(),
            Mode::Train,
        )?;
        let losses = self.loss.forward(&output, mix_coefficient)?;

        engine.zero_gradients();
        engine.compute_gradients(&losses.total_loss);
        engine.apply_update();

        Ok(losses)
    }

    fn anchors_for(&self, features: &Tensor) -> Result<Anchors> {
        let (_, _, height, width) = features.size4()?;
        let AnchorConfig {
            feat_stride,
            ref scales,
            ref ratios,
        } = self.anchor_config;
        generate_anchors(height, width, feat_stride, scales, ratios, features.device())
    }

    /// Shuffle the regions, optionally interpolate them with the shuffled
    /// counterparts, and then paste blocks of the counterparts.
    ///
    /// It returns the permutation if any mixing took place, and the drawn
    /// mixup coefficient.
    fn mix_regions(&mut self, pooled: &Tensor) -> Result<(Tensor, Option<Tensor>, Option<f64>)> {
        let num_regions = pooled.size()[0];
        let permutation = {
            let mut indexes: Vec<i64> = (0..num_regions).collect();
            indexes.shuffle(&mut self.rng);
            Tensor::of_slice(&indexes).to_device(pooled.device())
        };

        let (pooled, coefficient) = match &self.mixup {
            Some(mixup) => {
                let (mixed, coefficient) = mixup.forward(pooled, &permutation, &mut self.rng)?;
                (mixed, Some(coefficient))
            }
            None => (pooled.shallow_clone(), None),
        };
        let (mixed, block_permutation) =
            self.block_mix
                .forward(&pooled, &permutation, true, &mut self.rng)?;

        let permutation = block_permutation.or_else(|| coefficient.map(|_| permutation));
        Ok((mixed, permutation, coefficient))
    }
}
