use crate::common::*;

/// The feature extractor around the detection heads.
///
/// The image side maps an `[1, 3, H, W]` image to a `[1, C, H / stride, W / stride]`
/// feature map. The tail side maps `[R, C, size, size]` pooled features to
/// `[R, D]` region vectors.
pub trait Backbone {
    /// The number of channels `C` of the feature map.
    fn feature_channels(&self) -> i64;

    /// The length `D` of region vectors.
    fn vector_channels(&self) -> i64;

    fn image_to_features(&self, image: &Tensor, train: bool) -> Tensor;

    fn features_to_vector(&self, pooled: &Tensor, train: bool) -> Tensor;
}
