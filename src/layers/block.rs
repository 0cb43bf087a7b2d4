//! Transformer Block
//!
//! Pre-norm block: attention and feed-forward sub-blocks, each wrapped in a
//! residual connection.
//!
//! ```text
//! x → LayerNorm → Attention → (+) → LayerNorm → FeedForward → (+) → output
//! │                            ↑                               ↑
//! └────────────────────────────┘                               │
//!                              └───────────────────────────────┘
//! ```
//!
//! At each residual connection the incoming gradient flows both straight
//! through and into the sub-block, and the two paths are summed.

use rand::rngs::StdRng;

use super::attention::{AttentionCache, MultiHeadAttention};
use super::feed_forward::{FeedForward, FeedForwardCache};
use super::layer_norm::{LayerNorm, LayerNormCache};
use super::param::{Param, Parameterized};
use super::{Mode, SequenceBlock};
use crate::tensor::Tensor;

/// Hyperparameters shared by every block of a stack
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlockConfig {
    pub embedding_size: usize,
    pub num_heads: usize,
    pub d_key: usize,
    pub d_value: usize,
    pub d_ff: usize,
    pub dropout: f32,
}

/// Transformer block combining attention and feed-forward with residuals
#[derive(Clone, Debug)]
pub struct TransformerBlock {
    pub ln1: LayerNorm,
    pub attn: MultiHeadAttention,
    pub ln2: LayerNorm,
    pub feed_forward: FeedForward,
}

impl TransformerBlock {
    pub fn new(config: &BlockConfig, rng: &mut StdRng) -> Self {
        Self {
            ln1: LayerNorm::new(config.embedding_size),
            attn: MultiHeadAttention::new(
                config.embedding_size,
                config.num_heads,
                config.d_key,
                config.d_value,
                config.dropout,
                rng,
            ),
            ln2: LayerNorm::new(config.embedding_size),
            feed_forward: FeedForward::new(config.embedding_size, config.d_ff, config.dropout, rng),
        }
    }
}

impl SequenceBlock for TransformerBlock {
    type Cache = BlockCache;

    fn forward(&self, x: &Tensor, mode: Mode, rng: &mut StdRng) -> (Tensor, BlockCache) {
        let (ln1_out, ln1_cache) = self.ln1.forward(x);
        let (attn_out, attn_cache) = self.attn.forward(&ln1_out, mode, rng);
        let x_after_attn = x.add(&attn_out);

        let (ln2_out, ln2_cache) = self.ln2.forward(&x_after_attn);
        let (ff_out, ff_cache) = self.feed_forward.forward(&ln2_out, mode, rng);
        let y = x_after_attn.add(&ff_out);

        let cache = BlockCache {
            ln1_cache,
            attn_cache,
            ln2_cache,
            ff_cache,
        };
        (y, cache)
    }

    fn backward(&mut self, grad_out: &Tensor, cache: &BlockCache) -> Tensor {
        // Second residual: straight path + feed-forward path
        let grad_ff = self.feed_forward.backward(grad_out, &cache.ff_cache);
        let mut grad_x_after_attn = grad_out.clone();
        grad_x_after_attn.add_assign(&self.ln2.backward(&grad_ff, &cache.ln2_cache));

        // First residual: straight path + attention path
        let grad_attn = self.attn.backward(&grad_x_after_attn, &cache.attn_cache);
        let mut grad_x = grad_x_after_attn;
        grad_x.add_assign(&self.ln1.backward(&grad_attn, &cache.ln1_cache));
        grad_x
    }
}

impl Parameterized for TransformerBlock {
    fn parameters(&self) -> Vec<&Param> {
        let mut params = self.ln1.parameters();
        params.extend(self.attn.parameters());
        params.extend(self.ln2.parameters());
        params.extend(self.feed_forward.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.ln1.parameters_mut();
        params.extend(self.attn.parameters_mut());
        params.extend(self.ln2.parameters_mut());
        params.extend(self.feed_forward.parameters_mut());
        params
    }
}

/// Cache for transformer block backward pass
#[derive(Clone, Debug)]
pub struct BlockCache {
    pub ln1_cache: LayerNormCache,
    pub attn_cache: AttentionCache,
    pub ln2_cache: LayerNormCache,
    pub ff_cache: FeedForwardCache,
}
