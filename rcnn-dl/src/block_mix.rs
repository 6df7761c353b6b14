//! Block-wise mixing of pooled features across regions.

use crate::{common::*, error::DetectorError};
use rand_distr::Beta;

#[derive(Debug, Clone)]
pub struct BlockMixInit {
    pub drop_prob: R64,
    pub block_size: i64,
}

impl BlockMixInit {
    pub fn build(self) -> Result<BlockMix> {
        let Self {
            drop_prob,
            block_size,
        } = self;

        ensure!(
            (0.0..=1.0).contains(&drop_prob.raw()),
            DetectorError::config("drop_prob must be in range [0, 1]")
        );
        ensure!(
            block_size > 0,
            DetectorError::config("block_size must be positive")
        );

        Ok(BlockMix {
            drop_prob,
            block_size,
        })
    }
}

/// Pastes a square block of a permuted counterpart onto each feature map.
///
/// For every batch element, one block location is drawn. Inside the block the
/// output takes the value of the element at `permutation[b]`, elsewhere the
/// element keeps its own value.
#[derive(Debug, Clone, CopyGetters)]
pub struct BlockMix {
    #[get_copy = "pub"]
    drop_prob: R64,
    #[get_copy = "pub"]
    block_size: i64,
}

impl BlockMix {
    /// Mix `x` of shape `[B, C, H, W]` with `x[permutation]`.
    ///
    /// It returns the input unchanged and no permutation when `train` is false
    /// or the drop probability is zero.
    pub fn forward<R>(
        &self,
        x: &Tensor,
        permutation: &Tensor,
        train: bool,
        rng: &mut R,
    ) -> Result<(Tensor, Option<Tensor>)>
    where
        R: Rng,
    {
        let (batch_size, _, height, width) = x.size4().map_err(|_| {
            DetectorError::shape(format!(
                "expect a [batch, channels, height, width] input, but get {:?}",
                x.size()
            ))
        })?;

        if !train || self.drop_prob == 0.0 {
            return Ok((x.shallow_clone(), None));
        }

        ensure!(
            permutation.size() == [batch_size],
            DetectorError::shape(format!(
                "expect a permutation of size {}, but get {:?}",
                batch_size,
                permutation.size()
            ))
        );

        let (mask_height, mask_width) = seed_region(height, width, self.block_size)?;
        let seeds = sample_seeds(batch_size, mask_height, mask_width, rng);
        let block = block_mask(&seeds, height, width, self.block_size, x.device())?
            .to_kind(x.kind())
            .unsqueeze(1);

        let mixed = x * (1.0 - &block) + x.index_select(0, permutation) * &block;
        Ok((mixed, Some(permutation.shallow_clone())))
    }
}

#[derive(Debug, Clone)]
pub struct MixupInit {
    /// Both shape parameters of the Beta distribution of the coefficient.
    pub alpha: R64,
}

impl MixupInit {
    pub fn build(self) -> Result<Mixup> {
        let Self { alpha } = self;
        ensure!(
            alpha > 0.0,
            DetectorError::config("mixup alpha must be positive")
        );
        let distribution = Beta::new(alpha.raw(), alpha.raw())
            .map_err(|err| DetectorError::config(format!("invalid mixup alpha: {}", err)))?;
        Ok(Mixup {
            alpha,
            distribution,
        })
    }
}

/// Interpolates each feature map with its permuted counterpart by a Beta
/// distributed coefficient.
#[derive(Debug, Clone, CopyGetters)]
pub struct Mixup {
    #[get_copy = "pub"]
    alpha: R64,
    distribution: Beta<f64>,
}

impl Mixup {
    /// Draw a coefficient and mix `x` of shape `[B, ...]` with `x[permutation]`.
    ///
    /// It returns the mixed tensor along with the drawn coefficient.
    pub fn forward<R>(&self, x: &Tensor, permutation: &Tensor, rng: &mut R) -> Result<(Tensor, f64)>
    where
        R: Rng + ?Sized,
    {
        let coefficient = self.distribution.sample(rng);
        let mixed = mix_with_permuted(x, permutation, coefficient)?;
        Ok((mixed, coefficient))
    }
}

/// Compute `coefficient * x + (1 - coefficient) * x[permutation]` along the first dimension.
pub fn mix_with_permuted(x: &Tensor, permutation: &Tensor, coefficient: f64) -> Result<Tensor> {
    ensure!(
        (0.0..=1.0).contains(&coefficient),
        DetectorError::config(format!(
            "mix coefficient must be in range [0, 1], but get {}",
            coefficient
        ))
    );
    let batch_size = x.size().first().copied().ok_or_else(|| {
        DetectorError::shape("expect an input with a batch dimension, but get a scalar")
    })?;
    ensure!(
        permutation.size() == [batch_size],
        DetectorError::shape(format!(
            "expect a permutation of size {}, but get {:?}",
            batch_size,
            permutation.size()
        ))
    );
    Ok(x * coefficient + x.index_select(0, permutation) * (1.0 - coefficient))
}

/// Draw one `(row, col)` block seed per batch element in the valid seed region.
pub fn sample_seeds<R>(
    batch_size: i64,
    mask_height: i64,
    mask_width: i64,
    rng: &mut R,
) -> Vec<(i64, i64)>
where
    R: Rng + ?Sized,
{
    (0..batch_size)
        .map(|_| (rng.gen_range(0..mask_height), rng.gen_range(0..mask_width)))
        .collect()
}

/// Build the `[B, H, W]` block mask of the given seeds, 1 inside the blocks.
///
/// The block of a seed at `(r, c)` spans `block_size` cells from
/// `r + block_size / 2 + 2 - block_size`, clipped to the feature map.
pub fn block_mask(
    seeds: &[(i64, i64)],
    height: i64,
    width: i64,
    block_size: i64,
    device: Device,
) -> Result<Tensor> {
    let (mask_height, mask_width) = seed_region(height, width, block_size)?;
    let batch_size = seeds.len() as i64;
    ensure!(
        seeds
            .iter()
            .all(|&(r, c)| (0..mask_height).contains(&r) && (0..mask_width).contains(&c)),
        DetectorError::shape(format!(
            "block seeds must be in range {}x{}",
            mask_height, mask_width
        ))
    );

    if batch_size == 0 {
        return Ok(Tensor::zeros(&[0, height, width], (Kind::Float, device)));
    }

    let seed_mask = {
        let positions: Vec<i64> = seeds.iter().map(|&(r, c)| r * mask_width + c).collect();
        Tensor::of_slice(&positions)
            .to_device(device)
            .one_hot(mask_height * mask_width)
            .to_kind(Kind::Float)
            .view([batch_size, 1, mask_height, mask_width])
    };

    // dilate each seed into a square
    let padding = block_size / 2 + 1;
    let kernel = Tensor::ones(&[1, 1, block_size, block_size], (Kind::Float, device));
    let dilated = seed_mask.conv2d(
        &kernel,
        None::<Tensor>,
        &[1, 1],
        &[padding, padding],
        &[1, 1],
        1,
    );

    // crop or pad the far ends to the feature map size
    let (_, _, out_height, out_width) = dilated.size4()?;
    let dilated = dilated
        .constant_pad_nd(&[
            0,
            (width - out_width).max(0),
            0,
            (height - out_height).max(0),
        ])
        .narrow(2, 0, height)
        .narrow(3, 0, width);

    Ok(dilated.ge(1.0).to_kind(Kind::Float).view([batch_size, height, width]))
}

fn seed_region(height: i64, width: i64, block_size: i64) -> Result<(i64, i64)> {
    let reduction = block_size / 2;
    let mask_height = height - reduction;
    let mask_width = width - reduction;
    ensure!(
        mask_height > 0 && mask_width > 0,
        DetectorError::shape(format!(
            "input of size {}x{} is too small for block_size {}",
            height, width, block_size
        ))
    );
    Ok((mask_height, mask_width))
}
