//! Training Data Batching
//!
//! Turns a token stream into fixed-shape batches of length
//! `context_size + 1`. The training loop slices every batch into an input
//! window (all but the last position) and a target window (all but the
//! first), so each window supervises `context_size` next-token predictions.
//!
//! ## How Windows Are Taken
//!
//! Consecutive windows overlap by exactly one token, so every token after the
//! first is a prediction target exactly once:
//!
//! ```text
//! Tokens: [1, 2, 3, 4, 5, 6, 7, 8, 9]
//! Window: 4 (context_size 3)
//!
//! [1, 2, 3, 4]  -> input [1, 2, 3]  target [2, 3, 4]
//! [4, 5, 6, 7]  -> input [4, 5, 6]  target [5, 6, 7]
//! [7, 8, 9]     -> too short, dropped
//! ```
//!
//! Windows are grouped `batch_size` at a time; a trailing partial batch is
//! dropped so every batch has the same shape. Iterating `&TokenBatches`
//! always starts from the beginning, so one source serves every epoch.

use crate::error::{LumiereError, Result};
use crate::tensor::TokenIds;
use crate::tokenizer::BpeTokenizer;

/// Restartable source of `[batch_size, window]` token batches
#[derive(Clone, Debug)]
pub struct TokenBatches {
    tokens: Vec<i64>,
    batch_size: usize,
    window: usize,
}

impl TokenBatches {
    /// # Errors
    ///
    /// `InvalidArgument` if `batch_size` is zero or `window < 2` (a window
    /// needs at least one input and one target position).
    pub fn new(tokens: Vec<i64>, batch_size: usize, window: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(LumiereError::InvalidArgument(
                "batch_size must be positive".to_string(),
            ));
        }
        if window < 2 {
            return Err(LumiereError::InvalidArgument(format!(
                "window must be at least 2 (context_size + 1), got {}",
                window
            )));
        }
        Ok(Self {
            tokens,
            batch_size,
            window,
        })
    }

    /// Tokenize `text` and batch the result
    pub fn from_text(
        tokenizer: &BpeTokenizer,
        text: &str,
        batch_size: usize,
        window: usize,
    ) -> Result<Self> {
        let tokens = tokenizer.encode(text);
        log::info!("Loaded {} tokens from text", tokens.len());
        Self::new(tokens, batch_size, window)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Number of complete windows in the token stream
    pub fn num_windows(&self) -> usize {
        if self.tokens.len() < self.window {
            0
        } else {
            (self.tokens.len() - 1) / (self.window - 1)
        }
    }

    /// Number of batches one pass yields
    pub fn num_batches(&self) -> usize {
        self.num_windows() / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.num_batches() == 0
    }

    pub fn iter(&self) -> Batches<'_> {
        Batches {
            source: self,
            next_batch: 0,
        }
    }
}

impl<'a> IntoIterator for &'a TokenBatches {
    type Item = TokenIds;
    type IntoIter = Batches<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One pass over a [`TokenBatches`]
#[derive(Clone, Debug)]
pub struct Batches<'a> {
    source: &'a TokenBatches,
    next_batch: usize,
}

impl Iterator for Batches<'_> {
    type Item = TokenIds;

    fn next(&mut self) -> Option<TokenIds> {
        let source = self.source;
        if self.next_batch >= source.num_batches() {
            return None;
        }

        let stride = source.window - 1;
        let first_window = self.next_batch * source.batch_size;
        let mut data = Vec::with_capacity(source.batch_size * source.window);
        for w in first_window..first_window + source.batch_size {
            let start = w * stride;
            data.extend_from_slice(&source.tokens[start..start + source.window]);
        }
        self.next_batch += 1;

        Some(TokenIds {
            data,
            shape: vec![source.batch_size, source.window],
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.source.num_batches().saturating_sub(self.next_batch);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches<'_> {}

/// Split a token stream into training and validation parts
///
/// The validation part is taken from the end so the two never interleave.
///
/// # Errors
///
/// `InvalidArgument` unless `0.0 <= val_fraction < 1.0`.
pub fn train_val_split(tokens: &[i64], val_fraction: f32) -> Result<(&[i64], &[i64])> {
    if !(0.0..1.0).contains(&val_fraction) {
        return Err(LumiereError::InvalidArgument(format!(
            "validation fraction must be in [0, 1), got {}",
            val_fraction
        )));
    }
    let split_idx = ((tokens.len() as f64) * (1.0 - val_fraction as f64)) as usize;
    Ok(tokens.split_at(split_idx))
}
