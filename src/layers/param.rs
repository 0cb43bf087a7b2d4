//! Trainable Parameters
//!
//! A [`Param`] pairs a value tensor with a gradient buffer of the same shape.
//! Backward passes *accumulate* into `grad`; the optimizer reads it and the
//! training loop resets it with `zero_grad` once the update has been applied.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::tensor::Tensor;

/// A learnable tensor and its accumulated gradient
#[derive(Clone, Debug)]
pub struct Param {
    pub value: Tensor,
    pub grad: Tensor,
    /// Whether decoupled weight decay applies (matrix weights only)
    pub decay: bool,
}

impl Param {
    /// Wrap a value tensor with a zeroed gradient buffer
    pub fn new(value: Tensor, decay: bool) -> Self {
        let grad = Tensor::zeros(value.shape.clone());
        Self { value, grad, decay }
    }

    /// Parameter filled with a constant (norm gains and biases)
    pub fn constant(shape: Vec<usize>, fill: f32) -> Self {
        let size = shape.iter().product();
        Self::new(Tensor::new(vec![fill; size], shape), false)
    }

    /// Gaussian initialization `N(0, std²)`
    pub fn normal(shape: Vec<usize>, std: f32, decay: bool, rng: &mut StdRng) -> Self {
        let size: usize = shape.iter().product();
        let data = match Normal::new(0.0f32, std) {
            Ok(normal) => (0..size).map(|_| normal.sample(rng)).collect(),
            Err(_) => vec![0.0; size],
        };
        Self::new(Tensor::new(data, shape), decay)
    }

    /// Uniform initialization in `[-bound, bound)`
    pub fn uniform(shape: Vec<usize>, bound: f32, decay: bool, rng: &mut StdRng) -> Self {
        let size: usize = shape.iter().product();
        let data = if bound > 0.0 {
            (0..size).map(|_| rng.random_range(-bound..bound)).collect()
        } else {
            vec![0.0; size]
        };
        Self::new(Tensor::new(data, shape), decay)
    }

    pub fn zero_grad(&mut self) {
        self.grad.data.iter_mut().for_each(|g| *g = 0.0);
    }

    pub fn numel(&self) -> usize {
        self.value.numel()
    }
}

/// Anything that owns trainable parameters
///
/// The order of the returned parameters must be stable: optimizers key their
/// per-parameter state by position.
pub trait Parameterized {
    fn parameters(&self) -> Vec<&Param>;

    fn parameters_mut(&mut self) -> Vec<&mut Param>;

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }
}
