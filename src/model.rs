//! Decoder Model Assembly
//!
//! Wires the pieces of the language model together:
//!
//! ```text
//! Input tokens [batch, context_size]
//!     ↓
//! Embedding (token table + sinusoidal positions) [batch, context_size, embedding_size]
//!     ↓
//! Block 1 → Block 2 → ... → Block N   (shape-preserving)
//!     ↓
//! LayerNorm
//!     ↓
//! Linear (with bias) → logits [batch, context_size, vocab_size]
//! ```
//!
//! Every block runs, in order; there is no branching or skipping. The block
//! type is a generic parameter so any [`SequenceBlock`] can be stacked, with
//! [`TransformerBlock`] as the default.
//!
//! The model owns no training logic. `forward` returns a cache that
//! `backward` consumes to fill every parameter's gradient.

use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::embedding::Embedding;
use crate::error::{LumiereError, Result};
use crate::layers::{
    BlockConfig, LayerNorm, LayerNormCache, Linear, LinearCache, Mode, Param, Parameterized,
    SequenceBlock, TransformerBlock,
};
use crate::tensor::{Tensor, TokenIds};

/// Model configuration
///
/// # Fields
///
/// - `vocab_size`: Number of tokens in the vocabulary (sizes the table and output projection)
/// - `embedding_size`: Width of the residual stream
/// - `context_size`: Tokens per input sequence
/// - `num_heads`, `d_key`, `d_value`: Attention heads and their key/value widths
/// - `d_ff`: Hidden width of the feed-forward sub-block
/// - `num_layers`: Number of transformer blocks
/// - `dropout`: Dropout probability used during training
/// - `seed`: Seed for parameter initialization
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub embedding_size: usize,
    pub context_size: usize,
    #[serde(default = "defaults::num_heads")]
    pub num_heads: usize,
    #[serde(default = "defaults::d_key")]
    pub d_key: usize,
    #[serde(default = "defaults::d_value")]
    pub d_value: usize,
    #[serde(default = "defaults::d_ff")]
    pub d_ff: usize,
    #[serde(default = "defaults::num_layers")]
    pub num_layers: usize,
    #[serde(default = "defaults::dropout")]
    pub dropout: f32,
    #[serde(default)]
    pub seed: u64,
}

mod defaults {
    pub fn num_heads() -> usize {
        12
    }
    pub fn d_key() -> usize {
        64
    }
    pub fn d_value() -> usize {
        64
    }
    pub fn d_ff() -> usize {
        1024
    }
    pub fn num_layers() -> usize {
        6
    }
    pub fn dropout() -> f32 {
        0.1
    }
}

impl ModelConfig {
    /// Configuration with the default architecture (12 heads of 64, d_ff 1024, 6 layers)
    pub fn new(vocab_size: usize, embedding_size: usize, context_size: usize) -> Self {
        Self {
            vocab_size,
            embedding_size,
            context_size,
            num_heads: defaults::num_heads(),
            d_key: defaults::d_key(),
            d_value: defaults::d_value(),
            d_ff: defaults::d_ff(),
            num_layers: defaults::num_layers(),
            dropout: defaults::dropout(),
            seed: 0,
        }
    }

    /// Tiny config for smoke tests and quick experiments
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            num_heads: 4,
            d_key: 16,
            d_value: 16,
            d_ff: 256,
            num_layers: 2,
            ..Self::new(vocab_size, 64, 64)
        }
    }

    /// Small config for short real runs
    pub fn small(vocab_size: usize) -> Self {
        Self {
            num_heads: 8,
            d_key: 32,
            d_value: 32,
            d_ff: 1024,
            num_layers: 4,
            ..Self::new(vocab_size, 256, 128)
        }
    }

    /// Look up a named preset
    pub fn preset(name: &str, vocab_size: usize) -> Result<Self> {
        match name {
            "tiny" => Ok(Self::tiny(vocab_size)),
            "small" => Ok(Self::small(vocab_size)),
            "default" => Ok(Self::new(vocab_size, 768, 256)),
            other => Err(LumiereError::InvalidArgument(format!(
                "unknown model preset '{}' (expected tiny, small or default)",
                other
            ))),
        }
    }

    /// Reject configurations that cannot build a model
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("vocab_size", self.vocab_size),
            ("embedding_size", self.embedding_size),
            ("context_size", self.context_size),
            ("num_heads", self.num_heads),
            ("d_key", self.d_key),
            ("d_value", self.d_value),
            ("d_ff", self.d_ff),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(LumiereError::InvalidArgument(format!(
                    "{} must be positive",
                    name
                )));
            }
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(LumiereError::InvalidArgument(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }

    pub fn block_config(&self) -> BlockConfig {
        BlockConfig {
            embedding_size: self.embedding_size,
            num_heads: self.num_heads,
            d_key: self.d_key,
            d_value: self.d_value,
            d_ff: self.d_ff,
            dropout: self.dropout,
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Decoder-only language model
#[derive(Clone, Debug)]
pub struct Model<B: SequenceBlock = TransformerBlock> {
    pub embedding: Embedding,
    pub blocks: Vec<B>,
    pub final_norm: LayerNorm,
    pub linear_out: Linear,
}

impl Model<TransformerBlock> {
    /// Build a model with `num_layers` identically configured transformer blocks
    pub fn new(config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let embedding = Embedding::new(
            config.vocab_size,
            config.context_size,
            config.embedding_size,
            &mut rng,
        )?;
        let block_config = config.block_config();
        let blocks = (0..config.num_layers)
            .map(|_| TransformerBlock::new(&block_config, &mut rng))
            .collect();
        Ok(Self::with_blocks(embedding, blocks, &mut rng))
    }
}

impl<B: SequenceBlock> Model<B> {
    /// Assemble a model around an embedding and an arbitrary block stack
    ///
    /// The final norm and output projection are sized from the embedding.
    pub fn with_blocks(embedding: Embedding, blocks: Vec<B>, rng: &mut StdRng) -> Self {
        let embedding_size = embedding.embedding_size();
        let vocab_size = embedding.vocab_size();
        Self {
            embedding,
            blocks,
            final_norm: LayerNorm::new(embedding_size),
            linear_out: Linear::new(embedding_size, vocab_size, rng),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.embedding.vocab_size()
    }

    pub fn context_size(&self) -> usize {
        self.embedding.context_size()
    }

    /// Forward pass: `[..., context_size]` token ids -> `[..., context_size, vocab_size]` logits
    ///
    /// # Errors
    ///
    /// Propagates the embedding's shape and token-range errors.
    pub fn forward(
        &self,
        tokens: &TokenIds,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<(Tensor, ModelCache<B::Cache>)> {
        let mut x = self.embedding.forward(tokens)?;

        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (y, cache) = block.forward(&x, mode, rng);
            x = y;
            block_caches.push(cache);
        }

        let (normed, norm_cache) = self.final_norm.forward(&x);
        let (logits, out_cache) = self.linear_out.forward(&normed);

        let cache = ModelCache {
            tokens: tokens.clone(),
            block_caches,
            norm_cache,
            out_cache,
        };
        Ok((logits, cache))
    }

    /// Backward pass from the logits gradient down to the embedding table
    pub fn backward(&mut self, grad_logits: &Tensor, cache: &ModelCache<B::Cache>) {
        let grad_normed = self.linear_out.backward(grad_logits, &cache.out_cache);
        let mut grad = self.final_norm.backward(&grad_normed, &cache.norm_cache);

        for (block, block_cache) in self.blocks.iter_mut().zip(&cache.block_caches).rev() {
            grad = block.backward(&grad, block_cache);
        }

        self.embedding.backward(&grad, &cache.tokens);
    }
}

impl<B: SequenceBlock> Parameterized for Model<B> {
    fn parameters(&self) -> Vec<&Param> {
        let mut params = self.embedding.parameters();
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params.extend(self.final_norm.parameters());
        params.extend(self.linear_out.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.embedding.parameters_mut();
        for block in &mut self.blocks {
            params.extend(block.parameters_mut());
        }
        params.extend(self.final_norm.parameters_mut());
        params.extend(self.linear_out.parameters_mut());
        params
    }
}

/// Everything the backward pass needs from one forward pass
#[derive(Clone, Debug)]
pub struct ModelCache<C> {
    pub tokens: TokenIds,
    pub block_caches: Vec<C>,
    pub norm_cache: LayerNormCache,
    pub out_cache: LinearCache,
}
