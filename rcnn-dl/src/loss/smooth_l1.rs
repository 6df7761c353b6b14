use crate::{common::*, error::DetectorError};

/// Smooth L1 loss of box regression with inside and outside weights.
///
/// With `d = inside * (pred - target)`, the elementwise loss is
/// `sigma^2 / 2 * d^2` if `|d| < 1 / sigma^2`, and `|d| - 0.5 / sigma^2`
/// otherwise. It is multiplied by `outside`, summed over `dims` and then
/// averaged over the remaining dimensions.
#[derive(Debug, Clone)]
pub struct SmoothL1Loss {
    sigma: f64,
    dims: Vec<i64>,
}

impl SmoothL1Loss {
    pub fn new(sigma: f64, dims: Vec<i64>) -> Result<Self> {
        ensure!(
            sigma > 0.0,
            DetectorError::config("smooth L1 sigma must be positive")
        );
        ensure!(
            !dims.is_empty(),
            DetectorError::config("at least one dimension must be reduced")
        );
        Ok(Self { sigma, dims })
    }

    pub fn forward(
        &self,
        pred: &Tensor,
        target: &Tensor,
        inside_weights: &Tensor,
        outside_weights: &Tensor,
    ) -> Tensor {
        let sigma_2 = self.sigma.powi(2);
        let diff = inside_weights * (pred - target);
        let abs_diff = diff.abs();
        let sign = abs_diff.lt(1.0 / sigma_2).to_kind(Kind::Float).detach();

        let in_loss =
            diff.pow(2) * (sigma_2 / 2.0) * &sign + (abs_diff - 0.5 / sigma_2) * (1.0 - &sign);
        let out_loss = outside_weights * in_loss;

        out_loss
            .sum_dim_intlist(&self.dims, false, Kind::Float)
            .mean(Kind::Float)
    }
}
