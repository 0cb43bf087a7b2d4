//! Token + Positional Embedding
//!
//! Turns token identifiers into the model's input representation:
//!
//! ```text
//! out[..., p, :] = table[token[..., p], :] + P[p, :]
//! ```
//!
//! where `table` is a learned `[vocab_size, embedding_size]` lookup table and
//! `P` is the fixed sinusoidal signal for `(context_size, embedding_size)`,
//! computed once at construction and broadcast over every leading dimension.
//!
//! Token ids outside `[0, vocab_size)` are rejected before any lookup happens;
//! they are never clamped or wrapped. Forward reads the table only, so repeated
//! lookups without an intervening update are bit-identical.
//!
//! ## Backward Pass
//!
//! The positional signal has no parameters. The table gradient is a
//! scatter-add: every output row's gradient is added to the row of the token
//! that produced it, so repeated tokens accumulate.

use rand::rngs::StdRng;

use crate::error::{LumiereError, Result};
use crate::layers::{Param, Parameterized};
use crate::positional::{sinusoidal_positional_encoding, EncodingShape};
use crate::tensor::{Tensor, TokenIds};

/// Standard deviation of the initial table entries
const INIT_STD: f32 = 0.02;

/// Learned token table plus fixed sinusoidal positions
#[derive(Clone, Debug)]
pub struct Embedding {
    pub weight: Param,
    context_size: usize,
    positional: Tensor,
}

impl Embedding {
    /// Create an embedding with a randomly initialized table
    ///
    /// # Errors
    ///
    /// `InvalidShape` if `context_size` or `embedding_size` is zero,
    /// `InvalidArgument` if `vocab_size` is zero.
    pub fn new(
        vocab_size: usize,
        context_size: usize,
        embedding_size: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let shape = EncodingShape::new(context_size, embedding_size)?;
        if vocab_size == 0 {
            return Err(LumiereError::InvalidArgument(
                "vocab_size must be positive".to_string(),
            ));
        }
        let weight = Param::normal(vec![vocab_size, embedding_size], INIT_STD, false, rng);
        Ok(Self {
            weight,
            context_size,
            positional: sinusoidal_positional_encoding(shape)?,
        })
    }

    /// Create an embedding around an existing `[vocab_size, embedding_size]` table
    pub fn from_weights(weights: Tensor, context_size: usize) -> Result<Self> {
        if weights.shape.len() != 2 || weights.shape[0] == 0 {
            return Err(LumiereError::InvalidShape(format!(
                "embedding table must be [vocab_size, embedding_size], got {:?}",
                weights.shape
            )));
        }
        let positional = sinusoidal_positional_encoding((context_size, weights.shape[1]))?;
        Ok(Self {
            weight: Param::new(weights, false),
            context_size,
            positional,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.value.shape[0]
    }

    pub fn embedding_size(&self) -> usize {
        self.weight.value.shape[1]
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    /// The fixed positional signal added to every sequence
    pub fn positional(&self) -> &Tensor {
        &self.positional
    }

    /// Look up `[..., context_size]` token ids, returning `[..., context_size, embedding_size]`
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` if the last axis is not `context_size`,
    /// `TokenOutOfRange` for any id outside `[0, vocab_size)`.
    pub fn forward(&self, tokens: &TokenIds) -> Result<Tensor> {
        if tokens.seq_len() != self.context_size {
            let mut expected = tokens.shape.clone();
            if let Some(last) = expected.last_mut() {
                *last = self.context_size;
            }
            return Err(LumiereError::ShapeMismatch {
                expected,
                actual: tokens.shape.clone(),
            });
        }
        tokens.check_range(self.vocab_size())?;

        let embd = self.embedding_size();
        let table = &self.weight.value.data;
        let mut data = Vec::with_capacity(tokens.numel() * embd);
        for (n, &token) in tokens.data.iter().enumerate() {
            let row = token as usize * embd;
            let pos = self.positional.row(n % self.context_size);
            data.extend(table[row..row + embd].iter().zip(pos).map(|(t, p)| t + p));
        }

        let mut shape = tokens.shape.clone();
        shape.push(embd);
        Ok(Tensor::new(data, shape))
    }

    /// Scatter-add the output gradient into the table gradient
    ///
    /// `tokens` must be the ids passed to the matching `forward` call.
    pub fn backward(&mut self, grad_out: &Tensor, tokens: &TokenIds) {
        let embd = self.embedding_size();
        assert_eq!(
            grad_out.numel(),
            tokens.numel() * embd,
            "Embedding gradient does not match token batch"
        );
        for (n, &token) in tokens.data.iter().enumerate() {
            let row = token as usize * embd;
            let grad_row = &grad_out.data[n * embd..(n + 1) * embd];
            for (g, &d) in self.weight.grad.data[row..row + embd].iter_mut().zip(grad_row) {
                *g += d;
            }
        }
    }
}

impl Parameterized for Embedding {
    fn parameters(&self) -> Vec<&Param> {
        vec![&self.weight]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight]
    }
}
