//! Linear Layer (Fully Connected)
//!
//! Affine transformation `y = x @ W + b` over the last dimension. Inputs of any
//! rank are accepted: `[..., in_features]` is flattened to rows, multiplied,
//! and reshaped back to `[..., out_features]`.
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, rows)
//! grad_x = grad_y @ W^T
//! ```

use rand::rngs::StdRng;

use super::param::{Param, Parameterized};
use crate::tensor::Tensor;

/// Fully connected layer with weight `[in_features, out_features]` and bias `[out_features]`
#[derive(Clone, Debug)]
pub struct Linear {
    pub weight: Param,
    pub bias: Param,
}

impl Linear {
    /// Create a linear layer
    ///
    /// Weights and bias are drawn from `U(-1/√in, 1/√in)`.
    pub fn new(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        Self {
            weight: Param::uniform(vec![in_features, out_features], bound, true, rng),
            bias: Param::uniform(vec![out_features], bound, false, rng),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.value.shape[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.value.shape[1]
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor `[..., in_features]`
    ///
    /// # Returns
    ///
    /// Tuple of (output `[..., out_features]`, cache holding the flattened input)
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        assert_eq!(
            x.last_dim(),
            self.in_features(),
            "Linear expects last dimension {}, got shape {:?}",
            self.in_features(),
            x.shape
        );
        let x2d = x.as_matrix();
        let y2d = x2d.matmul(&self.weight.value).add(&self.bias.value);

        let mut out_shape = x.shape.clone();
        if let Some(last) = out_shape.last_mut() {
            *last = self.out_features();
        }
        let cache = LinearCache {
            x: x2d,
            input_shape: x.shape.clone(),
        };
        (y2d.reshape(&out_shape), cache)
    }

    /// Backward pass
    ///
    /// Accumulates weight and bias gradients and returns the input gradient
    /// with the original input shape.
    pub fn backward(&mut self, grad_out: &Tensor, cache: &LinearCache) -> Tensor {
        let g = grad_out.as_matrix();

        self.weight.grad.add_assign(&cache.x.transpose().matmul(&g));
        self.bias.grad.add_assign(&g.sum_rows());

        g.matmul(&self.weight.value.transpose())
            .reshape(&cache.input_shape)
    }
}

impl Parameterized for Linear {
    fn parameters(&self) -> Vec<&Param> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// Cache for linear layer backward pass
#[derive(Clone, Debug)]
pub struct LinearCache {
    /// Input flattened to `[rows, in_features]`
    pub x: Tensor,
    pub input_shape: Vec<usize>,
}
