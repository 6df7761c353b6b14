use super::{normal_var, RpnOutput};
use crate::common::*;

#[derive(Debug, Clone)]
pub struct RpnHeadInit {
    pub in_c: i64,
    /// Channels of the 3x3 hidden convolution.
    pub channels: i64,
    pub num_anchors: i64,
    pub truncated_init: bool,
}

impl RpnHeadInit {
    pub fn build<'p, P>(self, path: P) -> RpnHead
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_c,
            channels,
            num_anchors,
            truncated_init,
        } = self;

        let conv_ws = normal_var(
            &(path / "rpn_net"),
            &[channels, in_c, 3, 3],
            0.01,
            truncated_init,
        );
        let conv_bs = (path / "rpn_net").zeros("bias", &[channels]);
        let cls_ws = normal_var(
            &(path / "rpn_cls_score_net"),
            &[num_anchors * 2, channels, 1, 1],
            0.01,
            truncated_init,
        );
        let cls_bs = (path / "rpn_cls_score_net").zeros("bias", &[num_anchors * 2]);
        let bbox_ws = normal_var(
            &(path / "rpn_bbox_pred_net"),
            &[num_anchors * 4, channels, 1, 1],
            0.01,
            truncated_init,
        );
        let bbox_bs = (path / "rpn_bbox_pred_net").zeros("bias", &[num_anchors * 4]);

        RpnHead {
            num_anchors,
            conv_ws,
            conv_bs,
            cls_ws,
            cls_bs,
            bbox_ws,
            bbox_bs,
        }
    }
}

/// The region proposal head over a feature map.
#[derive(Debug)]
pub struct RpnHead {
    num_anchors: i64,
    conv_ws: Tensor,
    conv_bs: Tensor,
    cls_ws: Tensor,
    cls_bs: Tensor,
    bbox_ws: Tensor,
    bbox_bs: Tensor,
}

impl RpnHead {
    /// Score every anchor of a `[1, C, H, W]` feature map.
    ///
    /// The outputs are flattened in the anchor order, that is cell row, cell
    /// column and then the anchor of the cell.
    pub fn forward(&self, features: &Tensor) -> Result<RpnOutput> {
        let (batch_size, _, height, width) = features.size4()?;
        let num_anchors = self.num_anchors;

        let hidden = features
            .conv2d(&self.conv_ws, Some(&self.conv_bs), &[1, 1], &[1, 1], &[1, 1], 1)
            .relu();

        // [b, 2 * A, h, w], the first A channels are background
        let cls_logits = hidden
            .conv2d(&self.cls_ws, Some(&self.cls_bs), &[1, 1], &[0, 0], &[1, 1], 1)
            .view([batch_size, 2, num_anchors, height, width])
            .permute(&[0, 3, 4, 2, 1])
            .reshape(&[-1, 2]);
        let fg_prob = cls_logits.softmax(-1, Kind::Float).select(1, 1);

        // [b, 4 * A, h, w] with 4 consecutive channels per anchor
        let bbox_pred = hidden
            .conv2d(&self.bbox_ws, Some(&self.bbox_bs), &[1, 1], &[0, 0], &[1, 1], 1)
            .permute(&[0, 2, 3, 1])
            .reshape(&[-1, 4]);

        Ok(RpnOutput {
            cls_logits,
            fg_prob,
            bbox_pred,
        })
    }
}
