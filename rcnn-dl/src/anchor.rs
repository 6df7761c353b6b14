//! Anchor box generation.

use crate::{common::*, error::DetectorError};

/// Anchor boxes laid over a feature map.
#[derive(Debug, TensorLike, Getters, CopyGetters)]
pub struct Anchors {
    /// `[height * width * num_anchors_per_cell, 4]` corner boxes in pixels.
    #[get = "pub"]
    boxes: Tensor,
    #[get_copy = "pub"]
    num_anchors_per_cell: i64,
    #[get_copy = "pub"]
    height: i64,
    #[get_copy = "pub"]
    width: i64,
}

impl Anchors {
    pub fn num_anchors(&self) -> i64 {
        self.height * self.width * self.num_anchors_per_cell
    }
}

/// Enumerate the anchors of one cell in `(x1, y1, x2, y2)` form.
///
/// The reference box is `[0, 0, stride - 1, stride - 1]`. The area is kept
/// for each ratio and the sides are scaled for each scale. The order is
/// ratio-major and scale-minor.
pub fn base_anchors(stride: i64, scales: &[f64], ratios: &[f64]) -> Vec<[f64; 4]> {
    let size = stride as f64;
    let center = (size - 1.0) / 2.0;
    let area = size * size;

    ratios
        .iter()
        .flat_map(|&ratio| {
            let ws = (area / ratio).sqrt().round();
            let hs = (ws * ratio).round();

            scales.iter().map(move |&scale| {
                let w = ws * scale;
                let h = hs * scale;
                [
                    center - (w - 1.0) / 2.0,
                    center - (h - 1.0) / 2.0,
                    center + (w - 1.0) / 2.0,
                    center + (h - 1.0) / 2.0,
                ]
            })
        })
        .collect()
}

/// Lay anchors over every cell of a `height` by `width` feature map.
///
/// The boxes are ordered by cell row, then cell column, then the per-cell
/// order of [base_anchors].
pub fn generate_anchors(
    height: i64,
    width: i64,
    stride: i64,
    scales: &[f64],
    ratios: &[f64],
    device: Device,
) -> Result<Anchors> {
    ensure!(
        height > 0 && width > 0,
        DetectorError::shape(format!(
            "feature map size must be positive, but get {}x{}",
            height, width
        ))
    );
    ensure!(
        stride > 0,
        DetectorError::config("anchor stride must be positive")
    );

    let base = base_anchors(stride, scales, ratios);
    let num_anchors_per_cell = base.len() as i64;
    ensure!(
        num_anchors_per_cell > 0,
        DetectorError::config("at least one scale and one ratio are required")
    );

    let base = {
        let values: Vec<f32> = base.iter().flatten().map(|&v| v as f32).collect();
        Tensor::of_slice(&values)
            .view([1, num_anchors_per_cell, 4])
            .to_device(device)
    };

    let shifts = {
        let shift_y = Tensor::arange(height, (Kind::Float, device)) * stride as f64;
        let shift_x = Tensor::arange(width, (Kind::Float, device)) * stride as f64;
        let grids = Tensor::meshgrid(&[shift_y, shift_x]);
        let sy = grids[0].reshape(&[-1]);
        let sx = grids[1].reshape(&[-1]);
        Tensor::stack(&[&sx, &sy, &sx, &sy], 1).view([-1, 1, 4])
    };

    let boxes = (base + shifts).reshape(&[-1, 4]);

    Ok(Anchors {
        boxes,
        num_anchors_per_cell,
        height,
        width,
    })
}
