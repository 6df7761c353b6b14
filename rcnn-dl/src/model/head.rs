use super::{normal_var, RcnnOutput};
use crate::common::*;

#[derive(Debug, Clone)]
pub struct RcnnHeadInit {
    /// Length of region vectors.
    pub in_c: i64,
    pub num_classes: i64,
    pub truncated_init: bool,
}

impl RcnnHeadInit {
    pub fn build<'p, P>(self, path: P) -> RcnnHead
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_c,
            num_classes,
            truncated_init,
        } = self;

        let cls_path = path / "cls_score_net";
        let bbox_path = path / "bbox_pred_net";

        RcnnHead {
            cls_ws: normal_var(&cls_path, &[num_classes, in_c], 0.01, truncated_init),
            cls_bs: cls_path.zeros("bias", &[num_classes]),
            bbox_ws: normal_var(&bbox_path, &[num_classes * 4, in_c], 0.001, truncated_init),
            bbox_bs: bbox_path.zeros("bias", &[num_classes * 4]),
        }
    }
}

/// The region classifier and class specific box regressor.
#[derive(Debug)]
pub struct RcnnHead {
    cls_ws: Tensor,
    cls_bs: Tensor,
    bbox_ws: Tensor,
    bbox_bs: Tensor,
}

impl RcnnHead {
    pub fn forward(&self, vectors: &Tensor) -> RcnnOutput {
        let cls_score = vectors.linear(&self.cls_ws, Some(&self.cls_bs));
        let cls_prob = cls_score.softmax(1, Kind::Float);
        let bbox_pred = vectors.linear(&self.bbox_ws, Some(&self.bbox_bs));

        RcnnOutput {
            cls_score,
            cls_prob,
            bbox_pred,
        }
    }
}
