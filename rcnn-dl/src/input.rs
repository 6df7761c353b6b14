//! Per-image inputs of the detector.

use crate::{common::*, error::DetectorError};

/// Network input size and the resize factor applied to the original image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub height: f64,
    pub width: f64,
    pub scale: f64,
}

impl ImageInfo {
    pub fn new(height: f64, width: f64, scale: f64) -> Result<Self> {
        ensure!(
            height > 0.0 && width > 0.0 && scale > 0.0,
            DetectorError::shape(format!(
                "image info must be positive, but get height={}, width={}, scale={}",
                height, width, scale
            ))
        );
        Ok(Self {
            height,
            width,
            scale,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Train,
    Test,
}

/// Ground truth boxes as a `[G, 5]` tensor of `(x1, y1, x2, y2, class)` rows.
#[derive(Debug, TensorLike, Getters)]
pub struct GroundTruth {
    #[get = "pub"]
    tensor: Tensor,
}

impl GroundTruth {
    pub fn new(tensor: Tensor) -> Result<Self> {
        match tensor.size().as_slice() {
            &[_, 5] => (),
            shape => bail!(DetectorError::shape(format!(
                "ground truth must be a [num_boxes, 5] tensor, but get {:?}",
                shape
            ))),
        }
        Ok(Self {
            tensor: tensor.to_kind(Kind::Float),
        })
    }

    /// A ground truth set without boxes.
    pub fn empty(device: Device) -> Self {
        Self {
            tensor: Tensor::zeros(&[0, 5], (Kind::Float, device)),
        }
    }

    pub fn from_boxes(boxes: &[[f32; 5]], device: Device) -> Self {
        let values: Vec<f32> = boxes.iter().flatten().copied().collect();
        let tensor = Tensor::of_slice(&values)
            .view([boxes.len() as i64, 5])
            .to_device(device);
        Self { tensor }
    }

    pub fn num_boxes(&self) -> i64 {
        self.tensor.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.num_boxes() == 0
    }

    /// The `[G, 4]` corner coordinates.
    pub fn boxes(&self) -> Tensor {
        self.tensor.narrow(1, 0, 4)
    }

    /// The `[G]` class indexes.
    pub fn labels(&self) -> Tensor {
        self.tensor.select(1, 4).to_kind(Kind::Int64)
    }
}
