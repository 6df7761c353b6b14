//! Fixed size feature extraction of regions.

use crate::{common::*, config::PoolingMode, error::DetectorError};

#[derive(Debug, Clone)]
pub struct RoiPoolerInit {
    pub mode: PoolingMode,
    /// Output side length.
    pub size: i64,
    /// Ratio of feature map size to image size, usually `1 / feat_stride`.
    pub spatial_scale: f64,
    /// Crop at twice the size and then 2x2 max pool. Only affects the crop mode.
    pub max_pool: bool,
}

impl RoiPoolerInit {
    pub fn build(self) -> Result<RoiPooler> {
        let Self {
            mode,
            size,
            spatial_scale,
            max_pool,
        } = self;

        ensure!(
            size > 0,
            DetectorError::config("pooling size must be positive")
        );
        ensure!(
            spatial_scale > 0.0,
            DetectorError::config("spatial_scale must be positive")
        );

        Ok(RoiPooler {
            mode,
            size,
            spatial_scale,
            max_pool,
        })
    }
}

/// Extracts `[R, C, size, size]` features for regions of interest.
#[derive(Debug, Clone, CopyGetters)]
pub struct RoiPooler {
    #[get_copy = "pub"]
    mode: PoolingMode,
    #[get_copy = "pub"]
    size: i64,
    spatial_scale: f64,
    max_pool: bool,
}

impl RoiPooler {
    /// Pool `features` of shape `[B, C, H, W]` over `[R, 5]` image space regions.
    pub fn forward(&self, features: &Tensor, rois: &Tensor) -> Result<Tensor> {
        let (batch_size, channels, _, _) = features.size4()?;
        let (num_rois, cols) = rois.size2()?;
        ensure!(
            cols == 5,
            DetectorError::shape(format!(
                "expect [R, 5] regions, but get {:?}",
                rois.size()
            ))
        );

        if num_rois == 0 {
            return Ok(features.new_zeros(
                &[0, channels, self.size, self.size],
                (features.kind(), features.device()),
            ));
        }

        let rois = rois.detach().to_kind(Kind::Float);
        let batch_indexes = rois.select(1, 0).to_kind(Kind::Int64);
        {
            let min = i64::from(batch_indexes.min());
            let max = i64::from(batch_indexes.max());
            ensure!(
                min >= 0 && max < batch_size,
                DetectorError::shape(format!(
                    "region batch index must be in range [0, {}), but get [{}, {}]",
                    batch_size, min, max
                ))
            );
        }

        match self.mode {
            PoolingMode::Crop => self.crop_and_resize(features, &rois, &batch_indexes),
            PoolingMode::Pool => self.roi_max_pool(features, &rois),
        }
    }

    /// Bilinear sampling of the region followed by an optional 2x2 max pooling.
    fn crop_and_resize(
        &self,
        features: &Tensor,
        rois: &Tensor,
        batch_indexes: &Tensor,
    ) -> Result<Tensor> {
        let (_, channels, height, width) = features.size4()?;
        let (num_rois, _) = rois.size2()?;
        let scale = self.spatial_scale;

        let x1 = rois.select(1, 1) * scale;
        let y1 = rois.select(1, 2) * scale;
        let x2 = rois.select(1, 3) * scale;
        let y2 = rois.select(1, 4) * scale;

        // affine transform from the output grid in [-1, 1] to the region
        let theta = {
            let wd = (width - 1).max(1) as f64;
            let hd = (height - 1).max(1) as f64;
            let zeros = x1.zeros_like();

            Tensor::stack(
                &[
                    (&x2 - &x1) / wd,
                    zeros.shallow_clone(),
                    (&x1 + &x2) / wd - 1.0,
                    zeros,
                    (&y2 - &y1) / hd,
                    (&y1 + &y2) / hd - 1.0,
                ],
                1,
            )
            .view([num_rois, 2, 3])
            .to_kind(features.kind())
        };

        let pre_pool_size = if self.max_pool {
            self.size * 2
        } else {
            self.size
        };
        let grid = Tensor::affine_grid_generator(
            &theta,
            &[num_rois, channels, pre_pool_size, pre_pool_size],
            true,
        );
        let crops = features
            .index_select(0, batch_indexes)
            .grid_sampler(&grid, 0, 0, true);

        let output = if self.max_pool {
            crops.max_pool2d(&[2, 2], &[2, 2], &[0, 0], &[1, 1], false)
        } else {
            crops
        };
        Ok(output)
    }

    /// Quantized max pooling over bins of the region. Empty bins yield zeros.
    fn roi_max_pool(&self, features: &Tensor, rois: &Tensor) -> Result<Tensor> {
        let (_, channels, height, width) = features.size4()?;
        let size = self.size;
        let scale = self.spatial_scale;
        let rows = Vec::<f32>::from(&rois.reshape(&[-1]));

        let pooled: Vec<Tensor> = rows
            .chunks(5)
            .map(|row| {
                let batch_index = row[0] as i64;
                let start_w = (row[1] as f64 * scale).round() as i64;
                let start_h = (row[2] as f64 * scale).round() as i64;
                let end_w = (row[3] as f64 * scale).round() as i64;
                let end_h = (row[4] as f64 * scale).round() as i64;

                let roi_w = (end_w - start_w + 1).max(1);
                let roi_h = (end_h - start_h + 1).max(1);
                let bin_w = roi_w as f64 / size as f64;
                let bin_h = roi_h as f64 / size as f64;

                let feature = features.select(0, batch_index);

                let bins: Vec<Tensor> = iproduct!(0..size, 0..size)
                    .map(|(ph, pw)| {
                        let range = |index: i64, bin: f64, start: i64, limit: i64| {
                            let lo = ((index as f64 * bin).floor() as i64 + start).clamp(0, limit);
                            let hi =
                                (((index + 1) as f64 * bin).ceil() as i64 + start).clamp(0, limit);
                            (lo, hi)
                        };
                        let (hstart, hend) = range(ph, bin_h, start_h, height);
                        let (wstart, wend) = range(pw, bin_w, start_w, width);

                        if hend <= hstart || wend <= wstart {
                            feature.new_zeros(&[channels], (feature.kind(), feature.device()))
                        } else {
                            feature
                                .narrow(1, hstart, hend - hstart)
                                .narrow(2, wstart, wend - wstart)
                                .amax(&[1, 2], false)
                        }
                    })
                    .collect();

                Tensor::stack(&bins, 1).view([channels, size, size])
            })
            .collect();

        Ok(Tensor::stack(&pooled, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn pooler(mode: PoolingMode, size: i64, max_pool: bool) -> Result<RoiPooler> {
        RoiPoolerInit {
            mode,
            size,
            spatial_scale: 1.0,
            max_pool,
        }
        .build()
    }

    fn ramp() -> Tensor {
        // value = 10 * row + col
        let rows = Tensor::arange(8, (Kind::Float, Device::Cpu)).view([8, 1]) * 10.0;
        let cols = Tensor::arange(8, (Kind::Float, Device::Cpu)).view([1, 8]);
        (rows + cols).view([1, 1, 8, 8])
    }

    #[test]
    fn output_shape_is_independent_of_roi_size() -> Result<()> {
        let features = Tensor::randn(&[2, 3, 16, 16], (Kind::Float, Device::Cpu));
        let rois = Tensor::of_slice(&[0f32, 0.0, 0.0, 3.0, 3.0, 1.0, 2.0, 1.0, 15.0, 9.0]).view([2, 5]);

        for mode in [PoolingMode::Crop, PoolingMode::Pool] {
            let pooled = pooler(mode, 7, true)?.forward(&features, &rois)?;
            assert_eq!(pooled.size(), vec![2, 3, 7, 7]);
        }
        Ok(())
    }

    #[test]
    fn crop_samples_region_corners() -> Result<()> {
        let rois = Tensor::of_slice(&[0f32, 2.0, 1.0, 6.0, 5.0]).view([1, 5]);
        let pooled = pooler(PoolingMode::Crop, 5, false)?.forward(&ramp(), &rois)?;
        let values = Vec::<f32>::from(&pooled.view([-1]));

        // corners at (y=1, x=2), (y=1, x=6), (y=5, x=2) and (y=5, x=6)
        assert_abs_diff_eq!(values[0], 12.0, epsilon = 1e-4);
        assert_abs_diff_eq!(values[4], 16.0, epsilon = 1e-4);
        assert_abs_diff_eq!(values[20], 52.0, epsilon = 1e-4);
        assert_abs_diff_eq!(values[24], 56.0, epsilon = 1e-4);
        // center at (y=3, x=4)
        assert_abs_diff_eq!(values[12], 34.0, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn max_pool_takes_bin_maximum() -> Result<()> {
        let rois = Tensor::of_slice(&[0f32, 0.0, 0.0, 7.0, 7.0]).view([1, 5]);
        let pooled = pooler(PoolingMode::Pool, 2, true)?.forward(&ramp(), &rois)?;
        assert_eq!(
            Vec::<f32>::from(&pooled.view([-1])),
            vec![33.0, 37.0, 73.0, 77.0]
        );
        Ok(())
    }

    #[test]
    fn regions_select_batch_element() -> Result<()> {
        let features = Tensor::cat(&[ramp(), ramp() + 100.0], 0);
        let rois = Tensor::of_slice(&[1f32, 0.0, 0.0, 7.0, 7.0]).view([1, 5]);
        let pooled = pooler(PoolingMode::Pool, 1, true)?.forward(&features, &rois)?;
        assert_eq!(Vec::<f32>::from(&pooled.view([-1])), vec![177.0]);

        let rois = Tensor::of_slice(&[2f32, 0.0, 0.0, 7.0, 7.0]).view([1, 5]);
        assert!(pooler(PoolingMode::Crop, 1, true)?.forward(&features, &rois).is_err());
        Ok(())
    }
}
