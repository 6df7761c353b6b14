use crate::common::*;

/// The gradient computation and parameter update service used by training steps.
pub trait GradientEngine {
    fn zero_gradients(&mut self);

    /// Back-propagate from the scalar `loss`.
    fn compute_gradients(&mut self, loss: &Tensor);

    fn apply_update(&mut self);
}

impl<T> GradientEngine for nn::Optimizer<T>
where
    T: nn::OptimizerConfig,
{
    fn zero_gradients(&mut self) {
        self.zero_grad();
    }

    fn compute_gradients(&mut self, loss: &Tensor) {
        loss.backward();
    }

    fn apply_update(&mut self) {
        self.step();
    }
}
