//! Tensor Storage for the Training Core
//!
//! Two small dense containers carry everything through the model:
//!
//! - [`Tensor`]: real-valued activations, parameters and gradients (`f32`)
//! - [`TokenIds`]: integer token identifiers (`i64`, so that negative ids coming
//!   from a corrupted batch are representable and can be rejected)
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[batch, seq, dim]`)
//! - **Rows**: Most layers treat a tensor of shape `[..., d]` as a matrix of
//!   `numel / d` rows, so leading dimensions never need special cases
//!
//! ## Example
//!
//! ```rust
//! use lumiere::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let c = a.matmul(&b);
//! assert_eq!(c.shape, vec![2, 2]);
//! ```
//!
//! ## Parallelism
//!
//! Matrix multiplication above a small work threshold uses a cache-blocked
//! algorithm with output row blocks distributed across the rayon pool. The
//! rest of the operations are simple element-wise loops.

use rayon::prelude::*;

use crate::error::{LumiereError, Result};

/// A dense multi-dimensional `f32` array in row-major layout
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    ///
    /// # Example
    ///
    /// ```rust
    /// # use lumiere::Tensor;
    /// let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// assert_eq!(tensor.shape, vec![2, 2]);
    /// ```
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );
        Self { data, shape }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a tensor from a slice of equally long rows
    ///
    /// Returns `ShapeMismatch` when rows have different lengths.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                return Err(LumiereError::ShapeMismatch {
                    expected: vec![cols],
                    actual: vec![row.len()],
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self::new(data, vec![rows.len(), cols]))
    }

    /// Total number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Size of the last dimension (the feature width)
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Number of rows when viewed as `[numel / last_dim, last_dim]`
    pub fn num_rows(&self) -> usize {
        let cols = self.last_dim();
        if cols == 0 {
            0
        } else {
            self.numel() / cols
        }
    }

    /// Borrow row `i` of the `[num_rows, last_dim]` view
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.last_dim();
        &self.data[i * cols..(i + 1) * cols]
    }

    /// Reinterpret the data with a new shape of the same element count
    ///
    /// # Panics
    ///
    /// Panics if the element counts differ
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape {:?} into {:?}: element count mismatch",
            self.shape,
            new_shape
        );
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Flatten all leading dimensions: `[..., d]` -> `[rows, d]`
    pub fn as_matrix(&self) -> Tensor {
        self.reshape(&[self.num_rows(), self.last_dim()])
    }

    // === MATRIX MULTIPLICATION ===

    /// Computes `result[j] += a_val * b[j]` for all j
    ///
    /// Kept as a plain zip loop so LLVM auto-vectorizes it.
    #[inline(always)]
    fn matmul_inner(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// 2D matrix multiplication `[m, k] @ [k, n] -> [m, n]`
    ///
    /// Small products run sequentially; anything at or above 1K multiply-adds
    /// uses the parallel cache-blocked kernel.
    ///
    /// # Panics
    ///
    /// Panics if either operand is not 2D or the inner dimensions differ
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert!(
            self.shape.len() == 2 && other.shape.len() == 2,
            "matmul expects 2D operands, got {:?} @ {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[0],
            "Matrix dimensions incompatible: {:?} @ {:?}",
            self.shape, other.shape
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        if m * n * k >= 1_000 {
            return self.matmul_parallel_blocked(other, m, n, k);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a_val = self.data[i * k + l];
                Self::matmul_inner(
                    a_val,
                    &other.data[l * n..(l + 1) * n],
                    &mut result[i * n..(i + 1) * n],
                );
            }
        }
        Tensor::new(result, vec![m, n])
    }

    /// Parallel cache-blocked matrix multiplication
    ///
    /// Output rows are split into blocks of 8 and handed to rayon; inside each
    /// block the column and inner dimensions are tiled 8×8 so the working set
    /// stays in L1.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                Self::matmul_inner(
                                    self.data[i * k + k_idx],
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Transpose a 2D matrix
    ///
    /// # Panics
    ///
    /// Panics if the tensor is not 2D
    pub fn transpose(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "transpose expects a 2D tensor");
        let rows = self.shape[0];
        let cols = self.shape[1];
        let mut result = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }
        Tensor::new(result, vec![cols, rows])
    }

    // === ELEMENT-WISE OPERATIONS ===

    /// Element-wise addition with trailing broadcast
    ///
    /// Supports:
    /// - identical shapes
    /// - `[..., s, d] + [s, d]` or `[..., d] + [d]`: `other` matches the trailing
    ///   dimensions of `self` and is repeated over the leading ones
    ///
    /// # Panics
    ///
    /// Panics on any other shape combination
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self.data.iter().zip(&other.data).map(|(a, b)| a + b).collect();
            return Tensor::new(result, self.shape.clone());
        }

        let trailing = other.shape.len();
        assert!(
            trailing < self.shape.len() && self.shape[self.shape.len() - trailing..] == other.shape[..],
            "Unsupported broadcast for add: {:?} + {:?}",
            self.shape,
            other.shape
        );

        let period = other.numel();
        let result = self
            .data
            .iter()
            .enumerate()
            .map(|(i, a)| a + other.data[i % period])
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// In-place accumulation of a same-shaped tensor
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.shape, other.shape, "Shapes must match for accumulation");
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }

    /// Multiply every element by a scalar
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let result = self.data.iter().map(|&x| x * scalar).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Apply a function to every element
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        let result = self.data.iter().map(|&x| f(x)).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Column sums of the `[rows, d]` view, shape `[d]`
    ///
    /// This is the bias gradient of a linear layer.
    pub fn sum_rows(&self) -> Tensor {
        let cols = self.last_dim();
        let mut sums = vec![0.0; cols];
        for chunk in self.data.chunks(cols.max(1)) {
            for (s, &v) in sums.iter_mut().zip(chunk) {
                *s += v;
            }
        }
        Tensor::new(sums, vec![cols])
    }

    /// Sum of squared elements
    pub fn sum_squares(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum()
    }

    /// Largest absolute difference to another tensor of the same shape
    pub fn max_abs_diff(&self, other: &Tensor) -> f32 {
        assert_eq!(self.shape, other.shape, "Shapes must match for comparison");
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }
}

/// Integer token identifiers with an arbitrary shape
///
/// The last dimension is the sequence axis. Ids are signed so that invalid
/// input can be represented and rejected instead of wrapping around.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenIds {
    pub data: Vec<i64>,
    pub shape: Vec<usize>,
}

impl TokenIds {
    /// Create token ids from flat data and a shape
    pub fn new(data: Vec<i64>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if shape.is_empty() || expected != data.len() {
            return Err(LumiereError::ShapeMismatch {
                expected: shape,
                actual: vec![data.len()],
            });
        }
        Ok(Self { data, shape })
    }

    /// Build a `[rows, len]` batch from equally long sequences
    pub fn from_rows(rows: &[Vec<i64>]) -> Result<Self> {
        let len = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * len);
        for row in rows {
            if row.len() != len {
                return Err(LumiereError::ShapeMismatch {
                    expected: vec![len],
                    actual: vec![row.len()],
                });
            }
            data.extend_from_slice(row);
        }
        Self::new(data, vec![rows.len(), len])
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Length of the sequence (last) axis
    pub fn seq_len(&self) -> usize {
        self.shape.last().copied().unwrap_or(0)
    }

    /// Keep positions `start..end` of the last axis
    ///
    /// `slice_last(0, n - 1)` is the input window and `slice_last(1, n)` the
    /// shifted target window of a batch of length `n`.
    pub fn slice_last(&self, start: usize, end: usize) -> Result<Self> {
        let len = self.seq_len();
        if start > end || end > len {
            return Err(LumiereError::InvalidArgument(format!(
                "slice {}..{} out of bounds for sequence length {}",
                start, end, len
            )));
        }
        let data = self
            .data
            .chunks(len.max(1))
            .flat_map(|row| row[start..end].iter().copied())
            .collect();
        let mut shape = self.shape.clone();
        if let Some(last) = shape.last_mut() {
            *last = end - start;
        }
        Ok(Self { data, shape })
    }

    /// Verify every id lies in `[0, vocab_size)`
    pub fn check_range(&self, vocab_size: usize) -> Result<()> {
        match self
            .data
            .iter()
            .find(|&&t| t < 0 || t as u64 >= vocab_size as u64)
        {
            Some(&token) => Err(LumiereError::TokenOutOfRange { token, vocab_size }),
            None => Ok(()),
        }
    }
}
