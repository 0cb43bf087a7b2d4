//! Neural Network Layers
//!
//! Trainable building blocks of the decoder. There is no autograd: each
//! layer has an explicit forward pass that returns a cache and a backward pass
//! that consumes it.
//!
//! ## Layers
//!
//! - **param**: `Param` (value + accumulated gradient) and `Parameterized`
//! - **activation**: ReLU forward and backward
//! - **linear**: Fully connected layer over the last dimension
//! - **layer_norm**: Layer normalization
//! - **dropout**: Dropout regularization, driven by an explicit [`Mode`]
//! - **feed_forward**: Linear → ReLU → Dropout → Linear
//! - **attention**: Multi-head causal self-attention
//! - **block**: Pre-norm transformer block
//!
//! ## Design Pattern
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn forward(&self, x: &Tensor, ...) -> (Tensor, Cache) { }
//!     // accumulates into each Param::grad, returns grad w.r.t. x
//!     pub fn backward(&mut self, grad: &Tensor, cache: &Cache) -> Tensor { }
//! }
//! ```

pub mod activation;
pub mod attention;
pub mod block;
pub mod dropout;
pub mod feed_forward;
pub mod layer_norm;
pub mod linear;
pub mod param;

use rand::rngs::StdRng;

use crate::tensor::Tensor;

pub use activation::{relu_backward, relu_forward};
pub use attention::{AttentionCache, MultiHeadAttention};
pub use block::{BlockCache, BlockConfig, TransformerBlock};
pub use dropout::{Dropout, DropoutCache};
pub use feed_forward::{FeedForward, FeedForwardCache};
pub use layer_norm::{LayerNorm, LayerNormCache};
pub use linear::{Linear, LinearCache};
pub use param::{Param, Parameterized};

/// Whether stochastic layers (dropout) are active
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// A shape-preserving transform over `[batch, seq, embedding]` activations
///
/// Any type implementing this can be stacked inside a [`crate::Model`]. The
/// stack applies its blocks in order on the way forward and in reverse on the
/// way back.
pub trait SequenceBlock: Parameterized {
    /// Values saved by `forward` for `backward`
    type Cache;

    fn forward(&self, x: &Tensor, mode: Mode, rng: &mut StdRng) -> (Tensor, Self::Cache);

    /// Accumulate parameter gradients and return the gradient w.r.t. the input
    fn backward(&mut self, grad_out: &Tensor, cache: &Self::Cache) -> Tensor;
}
