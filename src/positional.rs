//! Sinusoidal Positional Encoding
//!
//! Attention is permutation invariant, so the model needs an explicit signal
//! telling it where each token sits in the sequence. This module produces the
//! fixed (non-learned) sinusoidal signal from "Attention Is All You Need":
//!
//! ```text
//! P[p, 2i]   = sin(p / 10000^(2i / embedding_size))
//! P[p, 2i+1] = cos(p / 10000^(2i / embedding_size))
//! ```
//!
//! Row 0 therefore alternates `0, 1, 0, 1, ...` for every width.
//!
//! ## Odd widths
//!
//! When `embedding_size` is odd the last column has no cosine partner. It is
//! treated as the sine half of one more pair index, i.e. column `e - 1` gets
//! `sin(p / 10000^((e - 1) / e))`.
//!
//! ## Shapes
//!
//! The generator is a pure function of its shape. Shapes arrive from several
//! places (code, config files, JSON), so anything implementing
//! [`IntoEncodingShape`] is accepted and validated before any computation.

use crate::error::{LumiereError, Result};
use crate::tensor::Tensor;

/// Frequency base of the sinusoids
pub const POSITIONAL_BASE: f64 = 10_000.0;

/// A validated `(context_size, embedding_size)` pair, both at least 1
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodingShape {
    context_size: usize,
    embedding_size: usize,
}

impl EncodingShape {
    /// Validate and build a shape
    pub fn new(context_size: usize, embedding_size: usize) -> Result<Self> {
        if context_size == 0 || embedding_size == 0 {
            return Err(LumiereError::InvalidShape(format!(
                "dimensions must be positive integers, got ({}, {})",
                context_size, embedding_size
            )));
        }
        Ok(Self {
            context_size,
            embedding_size,
        })
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub fn embedding_size(&self) -> usize {
        self.embedding_size
    }
}

/// Conversion of loosely typed shape descriptions into an [`EncodingShape`]
pub trait IntoEncodingShape {
    fn into_encoding_shape(self) -> Result<EncodingShape>;
}

impl IntoEncodingShape for EncodingShape {
    fn into_encoding_shape(self) -> Result<EncodingShape> {
        Ok(self)
    }
}

impl IntoEncodingShape for (usize, usize) {
    fn into_encoding_shape(self) -> Result<EncodingShape> {
        EncodingShape::new(self.0, self.1)
    }
}

impl IntoEncodingShape for (i64, i64) {
    fn into_encoding_shape(self) -> Result<EncodingShape> {
        EncodingShape::new(positive_dim(self.0)?, positive_dim(self.1)?)
    }
}

impl IntoEncodingShape for &[i64] {
    fn into_encoding_shape(self) -> Result<EncodingShape> {
        match self {
            [c, e] => (*c, *e).into_encoding_shape(),
            _ => Err(LumiereError::InvalidShape(format!(
                "expected exactly 2 dimensions, got {}",
                self.len()
            ))),
        }
    }
}

impl IntoEncodingShape for Option<(i64, i64)> {
    fn into_encoding_shape(self) -> Result<EncodingShape> {
        self.ok_or_else(|| LumiereError::InvalidShape("shape is missing".to_string()))?
            .into_encoding_shape()
    }
}

impl IntoEncodingShape for (Option<i64>, Option<i64>) {
    fn into_encoding_shape(self) -> Result<EncodingShape> {
        match self {
            (Some(c), Some(e)) => (c, e).into_encoding_shape(),
            _ => Err(LumiereError::InvalidShape(
                "dimensions must not be missing".to_string(),
            )),
        }
    }
}

/// Shapes read from JSON must be a two-element array of integers.
///
/// Booleans, floats (even integral ones such as `1.0`), strings and `null`
/// are rejected rather than coerced.
impl IntoEncodingShape for &serde_json::Value {
    fn into_encoding_shape(self) -> Result<EncodingShape> {
        let dims = self.as_array().ok_or_else(|| {
            LumiereError::InvalidShape(format!("expected a 2-element array, got {}", self))
        })?;
        if dims.len() != 2 {
            return Err(LumiereError::InvalidShape(format!(
                "expected exactly 2 dimensions, got {}",
                dims.len()
            )));
        }
        let mut parsed = [0i64; 2];
        for (slot, dim) in parsed.iter_mut().zip(dims) {
            *slot = match dim {
                serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => {
                    n.as_i64().ok_or_else(|| {
                        LumiereError::InvalidShape(format!("dimension {} is too large", n))
                    })?
                }
                other => {
                    return Err(LumiereError::InvalidShape(format!(
                        "dimension must be an integer, got {}",
                        other
                    )))
                }
            };
        }
        (parsed[0], parsed[1]).into_encoding_shape()
    }
}

fn positive_dim(value: i64) -> Result<usize> {
    if value <= 0 {
        return Err(LumiereError::InvalidShape(format!(
            "dimensions must be positive integers, got {}",
            value
        )));
    }
    usize::try_from(value)
        .map_err(|_| LumiereError::InvalidShape(format!("dimension {} does not fit", value)))
}

/// Generate the sinusoidal positional signal for a `(context_size, embedding_size)` shape
///
/// The shape is validated first; an invalid shape returns `InvalidShape` and
/// nothing is computed. Angles are evaluated in `f64` and stored as `f32`, so
/// equal shapes always produce bit-identical matrices.
///
/// # Example
///
/// ```rust
/// # use lumiere::sinusoidal_positional_encoding;
/// let p = sinusoidal_positional_encoding((2usize, 4usize)).unwrap();
/// assert_eq!(p.shape, vec![2, 4]);
/// assert_eq!(&p.data[..4], &[0.0, 1.0, 0.0, 1.0]);
/// ```
pub fn sinusoidal_positional_encoding(shape: impl IntoEncodingShape) -> Result<Tensor> {
    let shape = shape.into_encoding_shape()?;
    let (context_size, embedding_size) = (shape.context_size, shape.embedding_size);

    let inv_freq: Vec<f64> = (0..embedding_size)
        .map(|j| {
            let two_i = (j / 2 * 2) as f64;
            POSITIONAL_BASE.powf(-two_i / embedding_size as f64)
        })
        .collect();

    let mut data = Vec::with_capacity(context_size * embedding_size);
    for p in 0..context_size {
        for (j, freq) in inv_freq.iter().enumerate() {
            let angle = p as f64 * freq;
            let value = if j % 2 == 0 { angle.sin() } else { angle.cos() };
            data.push(value as f32);
        }
    }

    Ok(Tensor::new(data, vec![context_size, embedding_size]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-4, "{} vs {}", a, e);
        }
    }

    #[test]
    fn test_known_values() {
        let cases: [((usize, usize), Vec<f32>); 4] = [
            ((1, 2), vec![0.0, 1.0]),
            ((2, 2), vec![0.0, 1.0, 0.8414, 0.5403]),
            ((1, 4), vec![0.0, 1.0, 0.0, 1.0]),
            (
                (2, 4),
                vec![0.0, 1.0, 0.0, 1.0, 0.8414, 0.5403, 0.0099, 0.9999],
            ),
        ];
        for (shape, expected) in cases {
            let p = sinusoidal_positional_encoding(shape).unwrap();
            assert_eq!(p.shape, vec![shape.0, shape.1]);
            assert_close(&p.data, &expected);
        }
    }

    #[test]
    fn test_odd_width_last_column_is_sine() {
        let p = sinusoidal_positional_encoding((3usize, 5usize)).unwrap();
        assert_eq!(&p.data[..5], &[0.0, 1.0, 0.0, 1.0, 0.0]);

        for pos in 0..3 {
            let expected = (pos as f64 / POSITIONAL_BASE.powf(4.0 / 5.0)).sin() as f32;
            assert_eq!(p.data[pos * 5 + 4], expected);
        }

        let single = sinusoidal_positional_encoding((2usize, 1usize)).unwrap();
        assert_close(&single.data, &[0.0, 0.8415]);
    }

    #[test]
    fn test_invalid_integer_shapes() {
        for (c, e) in [(-1i64, -1i64), (-1, 1), (1, -1), (0, 0), (0, 1), (1, 0)] {
            assert!(matches!(
                sinusoidal_positional_encoding((c, e)),
                Err(LumiereError::InvalidShape(_))
            ));
        }
        assert!(sinusoidal_positional_encoding((0usize, 4usize)).is_err());
    }

    #[test]
    fn test_missing_and_wrong_arity_shapes() {
        assert!(sinusoidal_positional_encoding(None::<(i64, i64)>).is_err());
        assert!(sinusoidal_positional_encoding((None, Some(1i64))).is_err());
        assert!(sinusoidal_positional_encoding((Some(1i64), None)).is_err());

        let empty: &[i64] = &[];
        assert!(sinusoidal_positional_encoding(empty).is_err());
        assert!(sinusoidal_positional_encoding(&[1i64][..]).is_err());
        assert!(sinusoidal_positional_encoding(&[1i64, 1, 1][..]).is_err());
        assert!(sinusoidal_positional_encoding(&[2i64, 4][..]).is_ok());
    }

    #[test]
    fn test_invalid_json_shapes() {
        let invalid = [
            json!(["1", "1"]),
            json!(["1", 1]),
            json!([1, "1"]),
            json!([1.0, 0.999]),
            json!([1.0, 2]),
            json!([true, 2]),
            json!([-1, -1]),
            json!([0, 1]),
            json!(null),
            json!([null, 1]),
            json!([1, null]),
            json!([]),
            json!(1),
            json!([1]),
            json!([1, 1, 1]),
        ];
        for shape in &invalid {
            assert!(
                matches!(
                    sinusoidal_positional_encoding(shape),
                    Err(LumiereError::InvalidShape(_))
                ),
                "shape {} should be rejected",
                shape
            );
        }
        assert!(sinusoidal_positional_encoding(&json!([16, 64])).is_ok());
    }

    proptest! {
        #[test]
        fn test_valid_shapes_are_well_formed(c in 1usize..48, e in 1usize..96) {
            let p = sinusoidal_positional_encoding((c, e)).unwrap();
            prop_assert_eq!(&p.shape, &vec![c, e]);

            for (j, &v) in p.row(0).iter().enumerate() {
                let expected = if j % 2 == 0 { 0.0 } else { 1.0 };
                prop_assert_eq!(v, expected);
            }

            let again = sinusoidal_positional_encoding((c, e)).unwrap();
            let bits: Vec<u32> = p.data.iter().map(|x| x.to_bits()).collect();
            let again_bits: Vec<u32> = again.data.iter().map(|x| x.to_bits()).collect();
            prop_assert_eq!(bits, again_bits);
        }
    }
}
