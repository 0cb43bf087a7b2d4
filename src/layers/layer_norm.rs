//! Layer Normalization
//!
//! Normalizes each row of the last dimension to zero mean and unit variance,
//! then applies a learnable scale (gamma) and shift (beta).
//!
//! ## Forward Pass
//!
//! ```text
//! mean   = E[x]
//! var    = E[(x - mean)²]
//! x_norm = (x - mean) / √(var + ε)
//! y      = γ * x_norm + β
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_γ = sum(grad_y * x_norm)
//! grad_β = sum(grad_y)
//! grad_x = (1/std) * (g - E[g] - x_norm * E[g * x_norm]),  g = grad_y * γ
//! ```
//!
//! Every element of a row feeds that row's mean and variance, which is where
//! the two expectation terms come from.

use super::param::{Param, Parameterized};
use crate::tensor::Tensor;

/// Layer normalization over the last dimension
#[derive(Clone, Debug)]
pub struct LayerNorm {
    pub gamma: Param,
    pub beta: Param,
    pub eps: f32,
}

impl LayerNorm {
    /// Create a layer norm with gamma = 1, beta = 0, eps = 1e-5
    pub fn new(normalized_shape: usize) -> Self {
        Self {
            gamma: Param::constant(vec![normalized_shape], 1.0),
            beta: Param::constant(vec![normalized_shape], 0.0),
            eps: 1e-5,
        }
    }

    /// Forward pass over a tensor of shape `[..., n]`
    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let n = self.gamma.numel();
        assert_eq!(x.last_dim(), n, "LayerNorm width mismatch for {:?}", x.shape);

        let rows = x.num_rows();
        let mut x_norm = vec![0.0; x.numel()];
        let mut y = vec![0.0; x.numel()];
        let mut std = Vec::with_capacity(rows);

        for r in 0..rows {
            let row = x.row(r);
            let mean = row.iter().sum::<f32>() / n as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
            let s = (var + self.eps).sqrt();
            std.push(s);

            for j in 0..n {
                let idx = r * n + j;
                let xn = (row[j] - mean) / s;
                x_norm[idx] = xn;
                y[idx] = xn * self.gamma.value.data[j] + self.beta.value.data[j];
            }
        }

        let cache = LayerNormCache {
            x_norm: Tensor::new(x_norm, x.shape.clone()),
            std,
        };
        (Tensor::new(y, x.shape.clone()), cache)
    }

    /// Backward pass: accumulates gamma/beta gradients, returns the input gradient
    pub fn backward(&mut self, grad_out: &Tensor, cache: &LayerNormCache) -> Tensor {
        let n = self.gamma.numel();
        let rows = grad_out.num_rows();
        let mut grad_x = vec![0.0; grad_out.numel()];

        for r in 0..rows {
            let g_row = grad_out.row(r);
            let xn_row = cache.x_norm.row(r);

            for j in 0..n {
                self.gamma.grad.data[j] += g_row[j] * xn_row[j];
                self.beta.grad.data[j] += g_row[j];
            }

            let g_norm: Vec<f32> = g_row
                .iter()
                .zip(&self.gamma.value.data)
                .map(|(g, gamma)| g * gamma)
                .collect();
            let mean_g = g_norm.iter().sum::<f32>() / n as f32;
            let mean_gx = g_norm
                .iter()
                .zip(xn_row)
                .map(|(g, x)| g * x)
                .sum::<f32>()
                / n as f32;

            for j in 0..n {
                grad_x[r * n + j] = (g_norm[j] - mean_g - xn_row[j] * mean_gx) / cache.std[r];
            }
        }

        Tensor::new(grad_x, grad_out.shape.clone())
    }
}

impl Parameterized for LayerNorm {
    fn parameters(&self) -> Vec<&Param> {
        vec![&self.gamma, &self.beta]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

/// Cache for layer norm backward pass
#[derive(Clone, Debug)]
pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// Per-row standard deviation `√(var + ε)`
    pub std: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_normalizes_rows() {
        let ln = LayerNorm::new(4);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, -2.0, 0.0, 2.0, 4.0], vec![2, 4]);
        let (y, _) = ln.forward(&x);
        for r in 0..2 {
            let row = y.row(r);
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut ln = LayerNorm::new(3);
        ln.gamma.value.data = vec![0.5, 1.5, -1.0];
        let x = Tensor::new(vec![0.3, -1.2, 2.0], vec![1, 3]);
        let weights = [1.0f32, -2.0, 0.5];
        let objective = |ln: &LayerNorm, x: &Tensor| -> f32 {
            let (y, _) = ln.forward(x);
            y.data.iter().zip(&weights).map(|(a, w)| a * w).sum()
        };

        let (_, cache) = ln.forward(&x);
        let grad_out = Tensor::new(weights.to_vec(), vec![1, 3]);
        let grad_x = ln.backward(&grad_out, &cache);

        let h = 1e-3;
        for i in 0..3 {
            let mut plus = x.clone();
            plus.data[i] += h;
            let mut minus = x.clone();
            minus.data[i] -= h;
            let numeric = (objective(&ln, &plus) - objective(&ln, &minus)) / (2.0 * h);
            assert!(
                (numeric - grad_x.data[i]).abs() < 1e-2,
                "index {}: numeric {} vs analytic {}",
                i,
                numeric,
                grad_x.data[i]
            );
        }
    }
}
