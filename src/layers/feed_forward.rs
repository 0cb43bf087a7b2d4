//! Feed-Forward Sub-Block
//!
//! Position-wise two-layer network applied after attention in every block.
//!
//! ```text
//! x → Linear(embedding_size, d_ff) → ReLU → Dropout → Linear(d_ff, embedding_size) → y
//! ```

use rand::rngs::StdRng;

use super::activation::{relu_backward, relu_forward};
use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache};
use super::param::{Param, Parameterized};
use super::Mode;
use crate::tensor::Tensor;

/// Feed-forward network with a `d_ff` hidden width
#[derive(Clone, Debug)]
pub struct FeedForward {
    pub linear_1: Linear,
    pub dropout: Dropout,
    pub linear_2: Linear,
}

impl FeedForward {
    pub fn new(embedding_size: usize, d_ff: usize, dropout: f32, rng: &mut StdRng) -> Self {
        Self {
            linear_1: Linear::new(embedding_size, d_ff, rng),
            dropout: Dropout::new(dropout),
            linear_2: Linear::new(d_ff, embedding_size, rng),
        }
    }

    pub fn forward(&self, x: &Tensor, mode: Mode, rng: &mut StdRng) -> (Tensor, FeedForwardCache) {
        let (hidden, linear_1_cache) = self.linear_1.forward(x);
        let activated = relu_forward(&hidden);
        let (dropped, dropout_cache) = self.dropout.forward(&activated, mode, rng);
        let (y, linear_2_cache) = self.linear_2.forward(&dropped);

        let cache = FeedForwardCache {
            linear_1_cache,
            hidden,
            dropout_cache,
            linear_2_cache,
        };
        (y, cache)
    }

    pub fn backward(&mut self, grad_out: &Tensor, cache: &FeedForwardCache) -> Tensor {
        let grad_dropped = self.linear_2.backward(grad_out, &cache.linear_2_cache);
        let grad_activated = self.dropout.backward(&grad_dropped, &cache.dropout_cache);
        let grad_hidden = relu_backward(&grad_activated, &cache.hidden);
        self.linear_1.backward(&grad_hidden, &cache.linear_1_cache)
    }
}

impl Parameterized for FeedForward {
    fn parameters(&self) -> Vec<&Param> {
        let mut params = self.linear_1.parameters();
        params.extend(self.linear_2.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.linear_1.parameters_mut();
        params.extend(self.linear_2.parameters_mut());
        params
    }
}

/// Cache for feed-forward backward pass
#[derive(Clone, Debug)]
pub struct FeedForwardCache {
    pub linear_1_cache: LinearCache,
    /// Pre-activation output of the first projection
    pub hidden: Tensor,
    pub dropout_cache: DropoutCache,
    pub linear_2_cache: LinearCache,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_shape_and_parameter_count() {
        let mut rng = StdRng::seed_from_u64(0);
        let ff = FeedForward::new(8, 32, 0.1, &mut rng);
        let x = Tensor::new(vec![0.5; 2 * 3 * 8], vec![2, 3, 8]);
        let (y, _) = ff.forward(&x, Mode::Eval, &mut rng);
        assert_eq!(y.shape, vec![2, 3, 8]);
        assert_eq!(ff.num_parameters(), 8 * 32 + 32 + 32 * 8 + 8);
    }

    #[test]
    fn test_backward_returns_input_shaped_gradient() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut ff = FeedForward::new(4, 6, 0.0, &mut rng);
        let x = Tensor::new((0..8).map(|i| i as f32 * 0.1 - 0.4).collect(), vec![2, 4]);
        let (_, cache) = ff.forward(&x, Mode::Train, &mut rng);
        let grad = ff.backward(&Tensor::new(vec![1.0; 8], vec![2, 4]), &cache);
        assert_eq!(grad.shape, vec![2, 4]);
        assert!(ff.linear_2.bias.grad.data.iter().all(|&g| g == 2.0));
    }
}
