//! Optimizers
//!
//! The training loop drives any type implementing [`Optimizer`]: it hands the
//! optimizer the model's parameters (with clipped gradients) for `step`, then
//! calls `zero_grad`. The learning rate is owned by the optimizer and
//! overwritten by the scheduler every batch.
//!
//! ## AdamW
//!
//! ```text
//! θ = θ * (1 - α * λ)              # decoupled weight decay (matrix weights only)
//! m = β₁ * m + (1 - β₁) * g        # first moment
//! v = β₂ * v + (1 - β₂) * g²       # second moment
//! m_hat = m / (1 - β₁^t)
//! v_hat = v / (1 - β₂^t)
//! θ = θ - α * m_hat / (√v_hat + ε)
//! ```
//!
//! Defaults: β₁ = 0.9, β₂ = 0.95, ε = 1e-8.
//!
//! Moment buffers are keyed by parameter position, so the parameter order
//! passed to `step` must be the same on every call (which `Parameterized`
//! guarantees).

use rayon::prelude::*;

use crate::layers::Param;
use crate::tensor::Tensor;

/// Parameter-update rule
pub trait Optimizer {
    /// Apply one update using the gradients currently stored in `params`
    fn step(&mut self, params: &mut [&mut Param]);

    /// Reset every gradient buffer to zero
    fn zero_grad(&mut self, params: &mut [&mut Param]) {
        for p in params.iter_mut() {
            p.zero_grad();
        }
    }

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);
}

/// AdamW optimizer state
#[derive(Clone, Debug)]
pub struct AdamW {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    /// Number of updates applied so far (for bias correction)
    pub step: usize,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
}

impl AdamW {
    pub fn new(lr: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.95,
            epsilon: 1e-8,
            weight_decay,
            step: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    fn ensure_state(&mut self, params: &[&mut Param]) {
        if self.m.len() != params.len() {
            self.m = params.iter().map(|p| Tensor::zeros(p.value.shape.clone())).collect();
            self.v = self.m.clone();
        }
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [&mut Param]) {
        self.ensure_state(params);
        self.step += 1;

        let (lr, weight_decay) = (self.lr, self.weight_decay);
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let bias_correction1 = 1.0 - beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step as i32);

        for ((param, m), v) in params.iter_mut().zip(&mut self.m).zip(&mut self.v) {
            assert_eq!(
                param.value.shape, m.shape,
                "Parameter layout changed between optimizer steps"
            );
            let decay = if param.decay { 1.0 - lr * weight_decay } else { 1.0 };
            let Param { value, grad, .. } = &mut **param;

            let update = |(theta, &g): (&mut f32, &f32), (m_val, v_val): (&mut f32, &mut f32)| {
                *theta *= decay;
                *m_val = beta1 * *m_val + (1.0 - beta1) * g;
                *v_val = beta2 * *v_val + (1.0 - beta2) * g * g;
                let m_hat = *m_val / bias_correction1;
                let v_hat = *v_val / bias_correction2;
                *theta -= lr * m_hat / (v_hat.sqrt() + epsilon);
            };

            // Parallel only where it pays for the scheduling overhead
            if value.numel() > 1000 {
                value
                    .data
                    .par_iter_mut()
                    .zip(grad.data.par_iter())
                    .zip(m.data.par_iter_mut().zip(v.data.par_iter_mut()))
                    .for_each(|(pg, mv)| update(pg, mv));
            } else {
                value
                    .data
                    .iter_mut()
                    .zip(grad.data.iter())
                    .zip(m.data.iter_mut().zip(v.data.iter_mut()))
                    .for_each(|(pg, mv)| update(pg, mv));
            }
        }
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(values: Vec<f32>, grads: Vec<f32>, decay: bool) -> Param {
        let n = values.len();
        let mut p = Param::new(Tensor::new(values, vec![n]), decay);
        p.grad = Tensor::new(grads, vec![n]);
        p
    }

    #[test]
    fn test_first_step_moves_against_gradient() {
        let mut opt = AdamW::new(0.1, 0.0);
        let mut p = param(vec![1.0, 1.0], vec![0.5, -2.0], false);
        opt.step(&mut [&mut p]);
        // bias-corrected first step has magnitude ≈ lr
        assert!((p.value.data[0] - 0.9).abs() < 1e-4);
        assert!((p.value.data[1] - 1.1).abs() < 1e-4);
        assert_eq!(opt.step, 1);
    }

    #[test]
    fn test_weight_decay_only_on_flagged_params() {
        let mut opt = AdamW::new(0.1, 0.5);
        let mut decayed = param(vec![2.0], vec![0.0], true);
        let mut plain = param(vec![2.0], vec![0.0], false);
        opt.step(&mut [&mut decayed, &mut plain]);
        assert!((decayed.value.data[0] - 1.9).abs() < 1e-6);
        assert_eq!(plain.value.data[0], 2.0);
    }

    #[test]
    fn test_large_params_match_sequential_path() {
        let n = 2048;
        let grads: Vec<f32> = (0..n).map(|i| ((i % 13) as f32 - 6.0) * 0.01).collect();
        let mut big = param(vec![0.5; n], grads.clone(), true);
        let mut small = param(vec![0.5; 8], grads[..8].to_vec(), true);

        let mut opt_big = AdamW::new(1e-3, 0.1);
        let mut opt_small = AdamW::new(1e-3, 0.1);
        for _ in 0..3 {
            opt_big.step(&mut [&mut big]);
            opt_small.step(&mut [&mut small]);
        }
        for i in 0..8 {
            assert!((big.value.data[i] - small.value.data[i]).abs() < 1e-7);
        }
    }

    #[test]
    fn test_zero_grad_and_lr() {
        let mut opt = AdamW::new(0.1, 0.0);
        let mut p = param(vec![1.0], vec![3.0], false);
        opt.zero_grad(&mut [&mut p]);
        assert_eq!(p.grad.data, vec![0.0]);

        opt.set_learning_rate(0.01);
        assert_eq!(opt.learning_rate(), 0.01);
    }
}
