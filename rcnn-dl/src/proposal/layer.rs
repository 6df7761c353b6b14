use super::{clip_boxes, decode_boxes, nms};
use crate::{common::*, error::DetectorError, input::ImageInfo};

/// Regions of interest produced by the proposal layers.
#[derive(Debug, TensorLike)]
pub struct Proposals {
    /// `[R, 5]` rows of `(batch_index, x1, y1, x2, y2)`.
    pub rois: Tensor,
    /// `[R]` foreground scores.
    pub scores: Tensor,
}

impl Proposals {
    pub fn num_proposals(&self) -> i64 {
        self.rois.size()[0]
    }

    /// The `[R, 4]` corner boxes without the batch column.
    pub fn boxes(&self) -> Tensor {
        self.rois.narrow(1, 1, 4)
    }
}

#[derive(Debug, Clone)]
pub struct ScoreNmsProposalInit {
    pub pre_nms_top_n: usize,
    pub post_nms_top_n: usize,
    pub nms_threshold: R64,
    pub min_size: R64,
}

impl ScoreNmsProposalInit {
    pub fn build(self) -> Result<ScoreNmsProposal> {
        let Self {
            pre_nms_top_n,
            post_nms_top_n,
            nms_threshold,
            min_size,
        } = self;

        ensure!(
            pre_nms_top_n > 0 && post_nms_top_n > 0,
            DetectorError::config("proposal counts must be positive")
        );
        ensure!(
            (0.0..=1.0).contains(&nms_threshold.raw()),
            DetectorError::config("nms_threshold must be in range [0, 1]")
        );
        ensure!(
            min_size >= 0.0,
            DetectorError::config("min_size must be non-negative")
        );

        Ok(ScoreNmsProposal {
            pre_nms_top_n: pre_nms_top_n as i64,
            post_nms_top_n: post_nms_top_n as i64,
            nms_threshold,
            min_size,
        })
    }
}

/// Proposal selection by score sorting and non-maximum suppression.
///
/// The output always has `post_nms_top_n` rows.
#[derive(Debug)]
pub struct ScoreNmsProposal {
    pre_nms_top_n: i64,
    post_nms_top_n: i64,
    nms_threshold: R64,
    min_size: R64,
}

impl ScoreNmsProposal {
    /// Turn anchor scores and deltas into proposals.
    ///
    /// The `scores` is the `[N]` foreground probability and the `deltas` is
    /// the `[N, 4]` regression output, both in the order of `anchors`.
    pub fn forward(
        &self,
        scores: &Tensor,
        deltas: &Tensor,
        anchors: &Tensor,
        image_info: &ImageInfo,
    ) -> Result<Proposals> {
        tch::no_grad(|| -> Result<_> {
            let Self {
                pre_nms_top_n,
                post_nms_top_n,
                nms_threshold,
                min_size,
            } = *self;
            let device = anchors.device();
            let (num_anchors, _) = anchors.size2()?;
            let scores = scores.detach().to_kind(Kind::Float).reshape(&[-1]);
            ensure!(
                scores.size1()? == num_anchors,
                DetectorError::shape(format!(
                    "expect {} scores, but get {}",
                    num_anchors,
                    scores.size1()?
                ))
            );

            if num_anchors == 0 {
                debug!("no anchors available, use the full image as the proposal");
                return Ok(full_image_proposals(image_info, post_nms_top_n, device));
            }

            let boxes = decode_boxes(anchors, &deltas.detach())?;
            let boxes = clip_boxes(&boxes, image_info.height, image_info.width)?;

            // remove boxes with either side smaller than min_size
            let (boxes, scores) = {
                let min_size = min_size.raw() * image_info.scale;
                let ws = boxes.select(1, 2) - boxes.select(1, 0) + 1.0;
                let hs = boxes.select(1, 3) - boxes.select(1, 1) + 1.0;
                let keep = ws.ge(min_size).logical_and(&hs.ge(min_size)).nonzero().view([-1]);

                let keep = if keep.numel() == 0 {
                    debug!("all proposals are smaller than {}, keep the top scoring one", min_size);
                    let (_, top) = scores.max_dim(0, false);
                    top.view([1])
                } else {
                    keep
                };
                (boxes.index_select(0, &keep), scores.index_select(0, &keep))
            };

            // sort by score and keep the top pre_nms_top_n
            let (scores, order) = {
                let (scores, order) = scores.sort(0, /* descending = */ true);
                let num = pre_nms_top_n.min(order.size1()?);
                (scores.narrow(0, 0, num), order.narrow(0, 0, num))
            };
            let boxes = boxes.index_select(0, &order);

            // suppress, truncate and pad to post_nms_top_n
            let keep = {
                let keep = nms(&boxes, &scores, nms_threshold.raw())?;
                let num_kept = post_nms_top_n.min(keep.size1()?);
                let keep = keep.narrow(0, 0, num_kept);

                if num_kept < post_nms_top_n {
                    let num_pad = post_nms_top_n - num_kept;
                    debug!("pad {} proposals with the top scoring box", num_pad);
                    let pad = keep.narrow(0, 0, 1).repeat(&[num_pad]);
                    Tensor::cat(&[keep, pad], 0)
                } else {
                    keep
                }
            };

            let boxes = boxes.index_select(0, &keep);
            let scores = scores.index_select(0, &keep);
            let batch_indexes = Tensor::zeros(&[post_nms_top_n, 1], (Kind::Float, device));
            let rois = Tensor::cat(&[batch_indexes, boxes], 1);

            Ok(Proposals { rois, scores })
        })
    }
}

#[derive(Debug, Clone)]
pub struct TopKProposalInit {
    pub top_n: usize,
}

impl TopKProposalInit {
    pub fn build(self) -> Result<TopKProposal> {
        let Self { top_n } = self;
        ensure!(top_n > 0, DetectorError::config("top_n must be positive"));
        Ok(TopKProposal {
            top_n: top_n as i64,
        })
    }
}

/// Proposal selection by score ranking without suppression.
#[derive(Debug)]
pub struct TopKProposal {
    top_n: i64,
}

impl TopKProposal {
    /// Select the `top_n` highest scoring anchors and decode them.
    ///
    /// If fewer than `top_n` anchors exist, the anchors are sampled uniformly
    /// with replacement.
    pub fn forward<R>(
        &self,
        scores: &Tensor,
        deltas: &Tensor,
        anchors: &Tensor,
        image_info: &ImageInfo,
        rng: &mut R,
    ) -> Result<Proposals>
    where
        R: Rng,
    {
        tch::no_grad(|| -> Result<_> {
            let top_n = self.top_n;
            let device = anchors.device();
            let (num_anchors, _) = anchors.size2()?;
            let scores = scores.detach().to_kind(Kind::Float).reshape(&[-1]);
            ensure!(
                num_anchors > 0,
                DetectorError::shape("cannot select proposals from zero anchors")
            );
            ensure!(
                scores.size1()? == num_anchors,
                DetectorError::shape(format!(
                    "expect {} scores, but get {}",
                    num_anchors,
                    scores.size1()?
                ))
            );

            let indexes = if num_anchors < top_n {
                let picks: Vec<i64> = (0..top_n)
                    .map(|_| rng.gen_range(0..num_anchors))
                    .collect();
                Tensor::of_slice(&picks).to_device(device)
            } else {
                let (_, order) = scores.sort(0, /* descending = */ true);
                order.narrow(0, 0, top_n)
            };

            let anchors = anchors.index_select(0, &indexes);
            let deltas = deltas.detach().index_select(0, &indexes);
            let scores = scores.index_select(0, &indexes);

            let boxes = decode_boxes(&anchors, &deltas)?;
            let boxes = clip_boxes(&boxes, image_info.height, image_info.width)?;
            let batch_indexes = Tensor::zeros(&[top_n, 1], (Kind::Float, device));
            let rois = Tensor::cat(&[batch_indexes, boxes], 1);

            Ok(Proposals { rois, scores })
        })
    }
}

fn full_image_proposals(image_info: &ImageInfo, count: i64, device: Device) -> Proposals {
    let roi = [
        0.0,
        0.0,
        0.0,
        (image_info.width - 1.0) as f32,
        (image_info.height - 1.0) as f32,
    ];
    let rois = Tensor::of_slice(&roi)
        .view([1, 5])
        .repeat(&[count, 1])
        .to_device(device);
    let scores = Tensor::zeros(&[count], (Kind::Float, device));
    Proposals { rois, scores }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_info() -> ImageInfo {
        ImageInfo {
            height: 100.0,
            width: 100.0,
            scale: 1.0,
        }
    }

    fn layer(post_nms_top_n: usize) -> Result<ScoreNmsProposal> {
        ScoreNmsProposalInit {
            pre_nms_top_n: 10,
            post_nms_top_n,
            nms_threshold: r64(0.7),
            min_size: r64(16.0),
        }
        .build()
    }

    #[test]
    fn score_nms_proposals_are_padded() -> Result<()> {
        let anchors = Tensor::of_slice(&[
            0f32, 0.0, 31.0, 31.0, // kept
            1.0, 1.0, 32.0, 32.0, // duplicate
            50.0, 50.0, 81.0, 81.0, // kept
            0.0, 0.0, 7.0, 7.0, // too small
        ])
        .view([4, 4]);
        let deltas = Tensor::zeros(&[4, 4], (Kind::Float, Device::Cpu));
        let scores = Tensor::of_slice(&[0.9f32, 0.8, 0.3, 0.99]);

        let proposals = layer(5)?.forward(&scores, &deltas, &anchors, &image_info())?;
        assert_eq!(proposals.rois.size(), vec![5, 5]);
        assert_eq!(proposals.scores.size(), vec![5]);
        assert_eq!(
            Vec::<f32>::from(&proposals.scores),
            vec![0.9, 0.3, 0.9, 0.9, 0.9]
        );
        assert_eq!(
            Vec::<f32>::from(&proposals.rois.i(1)),
            vec![0.0, 50.0, 50.0, 81.0, 81.0]
        );

        let proposals = layer(1)?.forward(&scores, &deltas, &anchors, &image_info())?;
        assert_eq!(Vec::<f32>::from(&proposals.scores), vec![0.9]);
        Ok(())
    }

    #[test]
    fn score_nms_falls_back_on_small_boxes() -> Result<()> {
        let anchors = Tensor::of_slice(&[0f32, 0.0, 3.0, 3.0, 10.0, 10.0, 13.0, 13.0]).view([2, 4]);
        let deltas = Tensor::zeros(&[2, 4], (Kind::Float, Device::Cpu));
        let scores = Tensor::of_slice(&[0.2f32, 0.6]);

        let proposals = layer(3)?.forward(&scores, &deltas, &anchors, &image_info())?;
        assert_eq!(proposals.num_proposals(), 3);
        assert_eq!(
            Vec::<f32>::from(&proposals.rois.i(2)),
            vec![0.0, 10.0, 10.0, 13.0, 13.0]
        );
        Ok(())
    }

    #[test]
    fn score_nms_without_anchors_uses_full_image() -> Result<()> {
        let anchors = Tensor::zeros(&[0, 4], (Kind::Float, Device::Cpu));
        let scores = Tensor::zeros(&[0], (Kind::Float, Device::Cpu));
        let proposals = layer(2)?.forward(&scores, &anchors, &anchors, &image_info())?;
        assert_eq!(
            Vec::<f32>::from(&proposals.rois.i(0)),
            vec![0.0, 0.0, 0.0, 99.0, 99.0]
        );
        assert_eq!(Vec::<f32>::from(&proposals.scores), vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn top_k_proposals() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let anchors = Tensor::of_slice(&[0f32, 0.0, 9.0, 9.0, 0.0, 0.0, 9.0, 9.0, 20.0, 20.0, 29.0, 29.0])
            .view([3, 4]);
        let deltas = Tensor::zeros(&[3, 4], (Kind::Float, Device::Cpu));
        let scores = Tensor::of_slice(&[0.5f32, 0.9, 0.7]);

        // no suppression of the duplicate box
        let layer = TopKProposalInit { top_n: 2 }.build()?;
        let proposals = layer.forward(&scores, &deltas, &anchors, &image_info(), &mut rng)?;
        assert_eq!(Vec::<f32>::from(&proposals.scores), vec![0.9, 0.7]);

        // sample with replacement when short of candidates
        let layer = TopKProposalInit { top_n: 8 }.build()?;
        let proposals = layer.forward(&scores, &deltas, &anchors, &image_info(), &mut rng)?;
        assert_eq!(proposals.rois.size(), vec![8, 5]);
        assert!(Vec::<f32>::from(&proposals.scores)
            .iter()
            .all(|score| [0.5, 0.9, 0.7].contains(score)));
        Ok(())
    }
}
