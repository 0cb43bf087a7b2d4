//! Cross-Entropy Loss
//!
//! Next-token loss over flattened logits. Logits of shape
//! `[..., vocab_size]` are viewed as `[N, vocab_size]` and paired with `N`
//! target ids, and the loss is the mean negative log-likelihood:
//!
//! ```text
//! loss       = -(1/N) Σ log softmax(logits_n)[target_n]
//! grad_n     = (softmax(logits_n) - onehot(target_n)) / N
//! perplexity = exp(loss)
//! ```
//!
//! Log-softmax subtracts the row maximum first so large logits cannot
//! overflow `exp`.

use crate::error::{LumiereError, Result};
use crate::tensor::{Tensor, TokenIds};

/// Mean cross-entropy and its gradient with respect to the logits
///
/// # Errors
///
/// `ShapeMismatch` if the number of logit rows differs from the number of
/// targets, `TokenOutOfRange` for a target outside `[0, vocab_size)`.
pub fn cross_entropy(logits: &Tensor, targets: &TokenIds) -> Result<(f32, Tensor)> {
    let vocab_size = logits.last_dim();
    let rows = logits.num_rows();
    if rows != targets.numel() {
        return Err(LumiereError::ShapeMismatch {
            expected: vec![rows],
            actual: vec![targets.numel()],
        });
    }
    targets.check_range(vocab_size)?;

    let scale = 1.0 / rows.max(1) as f32;
    let mut total = 0.0f64;
    let mut grad = Vec::with_capacity(logits.numel());

    for (i, &target) in targets.data.iter().enumerate() {
        let row = logits.row(i);
        let max_logit = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let exp_vals: Vec<f32> = row.iter().map(|&x| (x - max_logit).exp()).collect();
        let sum: f32 = exp_vals.iter().sum();

        let target = target as usize;
        total -= ((row[target] - max_logit) - sum.ln()) as f64;

        grad.extend(exp_vals.iter().enumerate().map(|(j, &e)| {
            let p = e / sum;
            let g = if j == target { p - 1.0 } else { p };
            g * scale
        }));
    }

    let loss = (total * scale as f64) as f32;
    Ok((loss, Tensor::new(grad, logits.shape.clone())))
}

/// Perplexity of a mean cross-entropy loss
pub fn perplexity(loss: f32) -> f32 {
    loss.exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_logits() {
        let logits = Tensor::zeros(vec![2, 3, 4]);
        let targets = TokenIds::new(vec![0, 1, 2, 3, 0, 1], vec![2, 3]).unwrap();
        let (loss, grad) = cross_entropy(&logits, &targets).unwrap();

        assert!((loss - 4f32.ln()).abs() < 1e-6);
        assert!((perplexity(loss) - 4.0).abs() < 1e-4);
        assert_eq!(grad.shape, vec![2, 3, 4]);
        // each row of the gradient sums to zero
        for r in 0..6 {
            assert!(grad.row(r).iter().sum::<f32>().abs() < 1e-6);
        }
    }

    #[test]
    fn test_large_logits_are_stable() {
        let logits = Tensor::new(vec![1000.0, 0.0, -1000.0], vec![1, 3]);
        let targets = TokenIds::new(vec![0], vec![1]).unwrap();
        let (loss, grad) = cross_entropy(&logits, &targets).unwrap();
        assert!(loss.is_finite());
        assert!(loss.abs() < 1e-6);
        assert!(grad.data.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let logits = Tensor::new(vec![0.2, -0.5, 1.0, 0.3, 0.1, -0.2], vec![2, 3]);
        let targets = TokenIds::new(vec![2, 0], vec![2]).unwrap();
        let (_, grad) = cross_entropy(&logits, &targets).unwrap();

        let h = 1e-3;
        for i in 0..6 {
            let mut plus = logits.clone();
            plus.data[i] += h;
            let mut minus = logits.clone();
            minus.data[i] -= h;
            let numeric = (cross_entropy(&plus, &targets).unwrap().0
                - cross_entropy(&minus, &targets).unwrap().0)
                / (2.0 * h);
            assert!((numeric - grad.data[i]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_invalid_targets() {
        let logits = Tensor::zeros(vec![2, 3]);
        let out_of_range = TokenIds::new(vec![0, 3], vec![2]).unwrap();
        assert!(matches!(
            cross_entropy(&logits, &out_of_range),
            Err(LumiereError::TokenOutOfRange { token: 3, .. })
        ));
        let too_few = TokenIds::new(vec![0], vec![1]).unwrap();
        assert!(cross_entropy(&logits, &too_few).is_err());
    }
}
