//! Multi-Head Causal Self-Attention
//!
//! Each head projects the input to queries and keys of width `d_key` and to
//! values of width `d_value`, attends over itself and earlier positions only,
//! and the concatenated head outputs are projected back to the model width.
//!
//! ```text
//! Q, K, V   = x @ W_q, x @ W_k, x @ W_v          (split into heads)
//! scores    = (Q @ K^T) / √d_key                 (future positions masked)
//! weights   = softmax(scores)
//! context   = dropout(weights) @ V               (heads merged)
//! output    = dropout(context @ W_o)
//! ```
//!
//! ## Layout
//!
//! Projections are computed on the flattened `[batch·seq, heads·width]` matrix.
//! They are then rearranged to `[batch, heads, seq, width]` so that every
//! (batch, head) pair is a contiguous slice, and those slices are processed in
//! parallel with rayon.
//!
//! ## Backward Pass
//!
//! 1. Output dropout and projection
//! 2. Attention-weighted sum: `grad_V = W^T @ g`, `grad_W = g @ V^T`
//! 3. Attention dropout
//! 4. Softmax per row: `grad_s = w * (grad_w - Σ w * grad_w)`
//! 5. Scaled dot product: `grad_Q = grad_s @ K / √d`, `grad_K = grad_s^T @ Q / √d`
//! 6. Q, K, V projections, whose input gradients are summed

use rand::rngs::StdRng;
use rayon::prelude::*;

use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache};
use super::param::{Param, Parameterized};
use super::Mode;
use crate::tensor::Tensor;

/// Multi-head self-attention with a causal mask
#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    pub num_heads: usize,
    pub d_key: usize,
    pub d_value: usize,
    pub q_proj: Linear,
    pub k_proj: Linear,
    pub v_proj: Linear,
    pub out_proj: Linear,
    pub attn_dropout: Dropout,
    pub resid_dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(
        embedding_size: usize,
        num_heads: usize,
        d_key: usize,
        d_value: usize,
        dropout: f32,
        rng: &mut StdRng,
    ) -> Self {
        Self {
            num_heads,
            d_key,
            d_value,
            q_proj: Linear::new(embedding_size, num_heads * d_key, rng),
            k_proj: Linear::new(embedding_size, num_heads * d_key, rng),
            v_proj: Linear::new(embedding_size, num_heads * d_value, rng),
            out_proj: Linear::new(num_heads * d_value, embedding_size, rng),
            attn_dropout: Dropout::new(dropout),
            resid_dropout: Dropout::new(dropout),
        }
    }

    /// Forward pass over `[..., seq, embedding_size]`
    pub fn forward(&self, x: &Tensor, mode: Mode, rng: &mut StdRng) -> (Tensor, AttentionCache) {
        assert!(
            x.shape.len() >= 2,
            "Attention expects [..., seq, embd], got {:?}",
            x.shape
        );
        let seq = x.shape[x.shape.len() - 2];
        let batch = x.num_rows() / seq.max(1);
        let heads = self.num_heads;
        let (dk, dv) = (self.d_key, self.d_value);
        let scale = 1.0 / (dk as f32).sqrt();

        let (q, q_cache) = self.q_proj.forward(x);
        let (k, k_cache) = self.k_proj.forward(x);
        let (v, v_cache) = self.v_proj.forward(x);

        let q = split_heads(&q.data, batch, seq, heads, dk);
        let k = split_heads(&k.data, batch, seq, heads, dk);
        let v = split_heads(&v.data, batch, seq, heads, dv);

        // Causal softmax per (batch, head); masked entries stay exactly zero
        let mut weights = vec![0.0; batch * heads * seq * seq];
        weights
            .par_chunks_mut(seq * seq)
            .enumerate()
            .for_each(|(bh, w)| {
                let qs = &q[bh * seq * dk..(bh + 1) * seq * dk];
                let ks = &k[bh * seq * dk..(bh + 1) * seq * dk];
                for i in 0..seq {
                    let qi = &qs[i * dk..(i + 1) * dk];
                    let row = &mut w[i * seq..i * seq + i + 1];
                    for (j, slot) in row.iter_mut().enumerate() {
                        *slot = dot(qi, &ks[j * dk..(j + 1) * dk]) * scale;
                    }
                    let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                    let mut sum = 0.0;
                    for slot in row.iter_mut() {
                        *slot = (*slot - max).exp();
                        sum += *slot;
                    }
                    for slot in row.iter_mut() {
                        *slot /= sum;
                    }
                }
            });
        let weights = Tensor::new(weights, vec![batch, heads, seq, seq]);

        let (dropped, attn_dropout_cache) = self.attn_dropout.forward(&weights, mode, rng);

        let mut context = vec![0.0; batch * heads * seq * dv];
        context
            .par_chunks_mut(seq * dv)
            .enumerate()
            .for_each(|(bh, out)| {
                let w = &dropped.data[bh * seq * seq..(bh + 1) * seq * seq];
                let vs = &v[bh * seq * dv..(bh + 1) * seq * dv];
                for i in 0..seq {
                    let out_row = &mut out[i * dv..(i + 1) * dv];
                    for j in 0..=i {
                        let wij = w[i * seq + j];
                        for (o, &vv) in out_row.iter_mut().zip(&vs[j * dv..(j + 1) * dv]) {
                            *o += wij * vv;
                        }
                    }
                }
            });

        let mut merged_shape = x.shape.clone();
        if let Some(last) = merged_shape.last_mut() {
            *last = heads * dv;
        }
        let merged = Tensor::new(merge_heads(&context, batch, seq, heads, dv), merged_shape);

        let (projected, out_cache) = self.out_proj.forward(&merged);
        let (y, resid_dropout_cache) = self.resid_dropout.forward(&projected, mode, rng);

        let cache = AttentionCache {
            batch,
            seq,
            q,
            k,
            v,
            weights,
            dropped,
            q_cache,
            k_cache,
            v_cache,
            out_cache,
            attn_dropout_cache,
            resid_dropout_cache,
        };
        (y, cache)
    }

    /// Backward pass: accumulates projection gradients, returns the input gradient
    pub fn backward(&mut self, grad_out: &Tensor, cache: &AttentionCache) -> Tensor {
        let (batch, seq) = (cache.batch, cache.seq);
        let heads = self.num_heads;
        let (dk, dv) = (self.d_key, self.d_value);
        let scale = 1.0 / (dk as f32).sqrt();

        let grad_projected = self
            .resid_dropout
            .backward(grad_out, &cache.resid_dropout_cache);
        let grad_merged = self.out_proj.backward(&grad_projected, &cache.out_cache);
        let grad_context = split_heads(&grad_merged.data, batch, seq, heads, dv);

        // grad of dropped weights: g @ V^T (causal entries only)
        let mut grad_dropped = vec![0.0; batch * heads * seq * seq];
        grad_dropped
            .par_chunks_mut(seq * seq)
            .enumerate()
            .for_each(|(bh, gw)| {
                let g = &grad_context[bh * seq * dv..(bh + 1) * seq * dv];
                let vs = &cache.v[bh * seq * dv..(bh + 1) * seq * dv];
                for i in 0..seq {
                    for j in 0..=i {
                        gw[i * seq + j] = dot(&g[i * dv..(i + 1) * dv], &vs[j * dv..(j + 1) * dv]);
                    }
                }
            });

        // grad_V = dropped^T @ g
        let mut grad_v = vec![0.0; batch * heads * seq * dv];
        grad_v
            .par_chunks_mut(seq * dv)
            .enumerate()
            .for_each(|(bh, gv)| {
                let w = &cache.dropped.data[bh * seq * seq..(bh + 1) * seq * seq];
                let g = &grad_context[bh * seq * dv..(bh + 1) * seq * dv];
                for i in 0..seq {
                    for j in 0..=i {
                        let wij = w[i * seq + j];
                        for (o, &gg) in gv[j * dv..(j + 1) * dv].iter_mut().zip(&g[i * dv..(i + 1) * dv]) {
                            *o += wij * gg;
                        }
                    }
                }
            });

        let grad_dropped = Tensor::new(grad_dropped, vec![batch, heads, seq, seq]);
        let grad_weights = self
            .attn_dropout
            .backward(&grad_dropped, &cache.attn_dropout_cache);

        // Softmax backward, folded with the 1/√d scale
        let mut grad_scores = vec![0.0; batch * heads * seq * seq];
        grad_scores
            .par_chunks_mut(seq * seq)
            .enumerate()
            .for_each(|(bh, gs)| {
                let w = &cache.weights.data[bh * seq * seq..(bh + 1) * seq * seq];
                let gw = &grad_weights.data[bh * seq * seq..(bh + 1) * seq * seq];
                for i in 0..seq {
                    let w_row = &w[i * seq..i * seq + i + 1];
                    let g_row = &gw[i * seq..i * seq + i + 1];
                    let row_dot = dot(w_row, g_row);
                    for j in 0..=i {
                        gs[i * seq + j] = w_row[j] * (g_row[j] - row_dot) * scale;
                    }
                }
            });

        let mut grad_q = vec![0.0; batch * heads * seq * dk];
        grad_q
            .par_chunks_mut(seq * dk)
            .enumerate()
            .for_each(|(bh, gq)| {
                let gs = &grad_scores[bh * seq * seq..(bh + 1) * seq * seq];
                let ks = &cache.k[bh * seq * dk..(bh + 1) * seq * dk];
                for i in 0..seq {
                    for j in 0..=i {
                        let s = gs[i * seq + j];
                        for (o, &kk) in gq[i * dk..(i + 1) * dk].iter_mut().zip(&ks[j * dk..(j + 1) * dk]) {
                            *o += s * kk;
                        }
                    }
                }
            });

        let mut grad_k = vec![0.0; batch * heads * seq * dk];
        grad_k
            .par_chunks_mut(seq * dk)
            .enumerate()
            .for_each(|(bh, gk)| {
                let gs = &grad_scores[bh * seq * seq..(bh + 1) * seq * seq];
                let qs = &cache.q[bh * seq * dk..(bh + 1) * seq * dk];
                for i in 0..seq {
                    for j in 0..=i {
                        let s = gs[i * seq + j];
                        for (o, &qq) in gk[j * dk..(j + 1) * dk].iter_mut().zip(&qs[i * dk..(i + 1) * dk]) {
                            *o += s * qq;
                        }
                    }
                }
            });

        let to_proj_shape = |data: Vec<f32>, width: usize, like: &LinearCache| {
            let mut shape = like.input_shape.clone();
            if let Some(last) = shape.last_mut() {
                *last = width;
            }
            Tensor::new(merge_heads(&data, batch, seq, heads, width / heads), shape)
        };
        let grad_q = to_proj_shape(grad_q, heads * dk, &cache.q_cache);
        let grad_k = to_proj_shape(grad_k, heads * dk, &cache.k_cache);
        let grad_v = to_proj_shape(grad_v, heads * dv, &cache.v_cache);

        let mut grad_x = self.q_proj.backward(&grad_q, &cache.q_cache);
        grad_x.add_assign(&self.k_proj.backward(&grad_k, &cache.k_cache));
        grad_x.add_assign(&self.v_proj.backward(&grad_v, &cache.v_cache));
        grad_x
    }
}

impl Parameterized for MultiHeadAttention {
    fn parameters(&self) -> Vec<&Param> {
        let mut params = self.q_proj.parameters();
        params.extend(self.k_proj.parameters());
        params.extend(self.v_proj.parameters());
        params.extend(self.out_proj.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.q_proj.parameters_mut();
        params.extend(self.k_proj.parameters_mut());
        params.extend(self.v_proj.parameters_mut());
        params.extend(self.out_proj.parameters_mut());
        params
    }
}

/// Cache for attention backward pass
///
/// `q`, `k`, `v` are stored head-major: `[batch, heads, seq, width]`.
#[derive(Clone, Debug)]
pub struct AttentionCache {
    pub batch: usize,
    pub seq: usize,
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    /// Softmax output before dropout, `[batch, heads, seq, seq]`
    pub weights: Tensor,
    /// Softmax output after dropout
    pub dropped: Tensor,
    pub q_cache: LinearCache,
    pub k_cache: LinearCache,
    pub v_cache: LinearCache,
    pub out_cache: LinearCache,
    pub attn_dropout_cache: DropoutCache,
    pub resid_dropout_cache: DropoutCache,
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `[batch·seq, heads·width]` -> `[batch, heads, seq, width]`
fn split_heads(x: &[f32], batch: usize, seq: usize, heads: usize, width: usize) -> Vec<f32> {
    let mut result = vec![0.0; batch * heads * seq * width];
    for b in 0..batch {
        for s in 0..seq {
            for h in 0..heads {
                let src = (b * seq + s) * heads * width + h * width;
                let dst = ((b * heads + h) * seq + s) * width;
                result[dst..dst + width].copy_from_slice(&x[src..src + width]);
            }
        }
    }
    result
}

/// `[batch, heads, seq, width]` -> `[batch·seq, heads·width]`
fn merge_heads(x: &[f32], batch: usize, seq: usize, heads: usize, width: usize) -> Vec<f32> {
    let mut result = vec![0.0; batch * seq * heads * width];
    for b in 0..batch {
        for s in 0..seq {
            for h in 0..heads {
                let src = ((b * heads + h) * seq + s) * width;
                let dst = (b * seq + s) * heads * width + h * width;
                result[dst..dst + width].copy_from_slice(&x[src..src + width]);
            }
        }
    }
    result
}
