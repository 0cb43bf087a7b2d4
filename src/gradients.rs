//! Gradient Utilities
//!
//! Global gradient norm and global-norm clipping over every parameter of a
//! model.
//!
//! ## Algorithm
//!
//! ```text
//! norm = √(Σ over all parameters Σ g²)
//! if norm > max_norm:
//!     every g *= max_norm / norm
//! ```
//!
//! One shared factor rescales every gradient, so relative magnitudes across
//! parameters are preserved. Clipping is a silent corrective action, not an
//! error; the pre-clip norm is returned for monitoring.

use rayon::prelude::*;

use crate::error::{LumiereError, Result};
use crate::layers::Param;

/// L2 norm of all gradients taken together
pub fn global_grad_norm(params: &[&mut Param]) -> f32 {
    let sum_sq: f64 = params
        .iter()
        .map(|p| p.grad.data.par_iter().map(|&g| (g as f64) * (g as f64)).sum::<f64>())
        .sum();
    sum_sq.sqrt() as f32
}

/// Clip gradients to a maximum global norm
///
/// # Arguments
///
/// * `params` - Parameters whose `grad` buffers are rescaled in place
/// * `max_norm` - Threshold for the aggregate norm
///
/// # Returns
///
/// The global norm measured *before* clipping. A non-finite norm is returned
/// as is and the gradients are left untouched.
///
/// # Errors
///
/// `InvalidArgument` unless `max_norm` is positive and finite. Checked before
/// any gradient is read.
pub fn clip_grad_norm(params: &mut [&mut Param], max_norm: f32) -> Result<f32> {
    check_max_norm(max_norm)?;
    let norm = global_grad_norm(params);

    if norm.is_finite() && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for p in params.iter_mut() {
            p.grad.data.par_iter_mut().for_each(|g| *g *= scale);
        }
    }

    Ok(norm)
}

/// Reject clip thresholds that would flip, zero or disable clipping
pub fn check_max_norm(max_norm: f32) -> Result<()> {
    if max_norm.is_finite() && max_norm > 0.0 {
        Ok(())
    } else {
        Err(LumiereError::InvalidArgument(format!(
            "gradient clip norm must be positive and finite, got {}",
            max_norm
        )))
    }
}
