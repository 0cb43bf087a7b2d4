//! Dropout Layer
//!
//! Randomly zeroes activations during training and rescales the survivors by
//! `1 / (1 - rate)`. The train/eval decision is an explicit [`Mode`] argument
//! rather than a flag stored on the layer; in [`Mode::Eval`] the input passes
//! through unchanged and no randomness is consumed.

use rand::rngs::StdRng;
use rand::Rng;

use super::Mode;
use crate::tensor::Tensor;

/// Dropout with a fixed drop probability
#[derive(Clone, Copy, Debug)]
pub struct Dropout {
    pub rate: f32,
}

impl Dropout {
    /// Create a dropout layer
    ///
    /// # Panics
    ///
    /// Panics if `rate` is outside `[0, 1]`
    pub fn new(rate: f32) -> Self {
        assert!(
            (0.0..=1.0).contains(&rate),
            "Dropout rate must be between 0.0 and 1.0"
        );
        Self { rate }
    }

    /// Forward pass, returning the output and the mask used
    pub fn forward(&self, x: &Tensor, mode: Mode, rng: &mut StdRng) -> (Tensor, DropoutCache) {
        if mode == Mode::Eval || self.rate == 0.0 {
            let cache = DropoutCache {
                mask: None,
                scale: 1.0,
            };
            return (x.clone(), cache);
        }

        if self.rate >= 1.0 {
            let cache = DropoutCache {
                mask: Some(vec![false; x.numel()]),
                scale: 1.0,
            };
            return (Tensor::zeros(x.shape.clone()), cache);
        }

        let scale = 1.0 / (1.0 - self.rate);
        let mask: Vec<bool> = (0..x.numel())
            .map(|_| rng.random::<f32>() >= self.rate)
            .collect();
        let data = x
            .data
            .iter()
            .zip(&mask)
            .map(|(&v, &keep)| if keep { v * scale } else { 0.0 })
            .collect();

        let cache = DropoutCache {
            mask: Some(mask),
            scale,
        };
        (Tensor::new(data, x.shape.clone()), cache)
    }

    /// Backward pass: the same mask and scale apply to the gradient
    pub fn backward(&self, grad_out: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            Some(mask) => {
                let data = grad_out
                    .data
                    .iter()
                    .zip(mask)
                    .map(|(&g, &keep)| if keep { g * cache.scale } else { 0.0 })
                    .collect();
                Tensor::new(data, grad_out.shape.clone())
            }
            None => grad_out.clone(),
        }
    }
}

/// Cache for dropout backward pass
#[derive(Clone, Debug)]
pub struct DropoutCache {
    /// `true` = kept. `None` when dropout was inactive.
    pub mask: Option<Vec<bool>>,
    pub scale: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_eval_mode_is_identity() {
        let dropout = Dropout::new(0.5);
        let x = Tensor::new(vec![1.0, 2.0, 3.0], vec![3]);
        let (y, cache) = dropout.forward(&x, Mode::Eval, &mut StdRng::seed_from_u64(0));
        assert_eq!(y, x);
        assert!(cache.mask.is_none());
    }

    #[test]
    fn test_train_mode_masks_and_scales() {
        let dropout = Dropout::new(0.5);
        let x = Tensor::new(vec![1.0; 1000], vec![1000]);
        let (y, cache) = dropout.forward(&x, Mode::Train, &mut StdRng::seed_from_u64(3));

        let kept = y.data.iter().filter(|&&v| v != 0.0).count();
        assert!(kept > 400 && kept < 600);
        assert!(y.data.iter().all(|&v| v == 0.0 || v == 2.0));

        let grad = dropout.backward(&Tensor::new(vec![1.0; 1000], vec![1000]), &cache);
        assert_eq!(grad, y);
    }

    #[test]
    #[should_panic(expected = "Dropout rate")]
    fn test_rejects_invalid_rate() {
        Dropout::new(1.5);
    }
}
