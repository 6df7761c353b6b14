use crate::{common::*, error::DetectorError};

/// Cross entropy over logits with sparse class targets.
#[derive(Debug)]
pub struct CrossEntropyLoss {
    reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    /// Compute the loss of `[batch_size, num_classes]` logits against `[batch_size]` labels.
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        let (batch_size, num_classes) = input.size2()?;
        ensure!(
            target.kind() == Kind::Int64 && target.size1()? == batch_size,
            DetectorError::shape(format!("expect target a [{}] int64 tensor", batch_size))
        );

        // return zero tensor if (1) input is empty and (2) using mean reduction
        if batch_size == 0 && self.reduction == Reduction::Mean {
            return Ok(
                Tensor::zeros(&[], (Kind::Float, input.device())).set_requires_grad(false),
            );
        }

        debug_assert!(
            bool::from(target.ge(0).all()) && bool::from(target.lt(num_classes).all()),
            "target values must be in range of [0, {}]",
            num_classes
        );

        // per-example loss, reduced below
        let loss = input.log_softmax(-1, Kind::Float).nll_loss::<Tensor>(
            target,
            None,
            Reduction::None,
            -100,
        );

        let loss = match self.reduction {
            Reduction::None => loss,
            Reduction::Sum => loss.sum(Kind::Float),
            Reduction::Mean => loss.mean(Kind::Float),
            Reduction::Other(_) => bail!(DetectorError::UnsupportedMode("reduction".into())),
        };
        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn cross_entropy_of_uniform_logits() -> Result<()> {
        let loss_fn = CrossEntropyLoss::new(Reduction::Mean);
        let input = Tensor::zeros(&[3, 4], (Kind::Float, Device::Cpu));
        let target = Tensor::of_slice(&[0i64, 1, 3]);

        let loss = f64::from(loss_fn.forward(&input, &target)?);
        assert_abs_diff_eq!(loss, 4f64.ln(), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn empty_input_yields_zero() -> Result<()> {
        let loss_fn = CrossEntropyLoss::new(Reduction::Mean);
        let input = Tensor::zeros(&[0, 2], (Kind::Float, Device::Cpu));
        let target = Tensor::zeros(&[0], (Kind::Int64, Device::Cpu));
        assert_eq!(f64::from(loss_fn.forward(&input, &target)?), 0.0);
        Ok(())
    }

    #[test]
    fn cross_entropy_loss_converges() -> Result<()> {
        use nn::OptimizerConfig as _;

        let mut rng = StdRng::seed_from_u64(0);
        let device = Device::Cpu;
        let n_batch = 16;
        let n_class = rng.gen_range(2..6);

        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let loss_fn = CrossEntropyLoss::new(Reduction::Mean);

        let input = root.randn("input", &[n_batch, n_class], 0.0, 1.0);
        let labels: Vec<i64> = (0..n_batch).map(|_| rng.gen_range(0..n_class)).collect();
        let target = Tensor::of_slice(&labels);

        let mut optimizer = nn::Adam::default().build(&vs, 0.1)?;
        for _ in 0..500 {
            let loss = loss_fn.forward(&input, &target)?;
            optimizer.backward_step(&loss);
        }

        let accuracy = i64::from(input.max_dim(1, false).1.eq_tensor(&target).sum(Kind::Int64))
            as f64
            / n_batch as f64;
        ensure!(accuracy >= 0.99, "the loss does not converge");
        Ok(())
    }
}
