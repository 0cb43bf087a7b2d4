//! Activation Functions
//!
//! ReLU and its derivative, used between the two projections of the
//! feed-forward sub-block.
//!
//! ```text
//! ReLU(x)  = max(0, x)
//! ReLU'(x) = 1 if x > 0 else 0
//! ```

use rayon::prelude::*;

use crate::tensor::Tensor;

/// ReLU activation (forward pass)
pub fn relu_forward(x: &Tensor) -> Tensor {
    let result = x.data.par_iter().map(|&v| v.max(0.0)).collect();
    Tensor::new(result, x.shape.clone())
}

/// ReLU derivative (backward pass)
///
/// # Arguments
///
/// * `grad_out` - Gradient from next layer
/// * `x` - Original input to ReLU (from forward pass)
pub fn relu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let result = x
        .data
        .par_iter()
        .zip(&grad_out.data)
        .map(|(&x_val, &g)| if x_val > 0.0 { g } else { 0.0 })
        .collect();
    Tensor::new(result, x.shape.clone())
}
