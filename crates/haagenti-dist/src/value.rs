//! Values exchanged by collective operations

use crate::{DistError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reduction operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Sum
    Sum,
    /// Product
    Product,
    /// Minimum
    Min,
    /// Maximum
    Max,
    /// Logical and (non-zero is true)
    And,
    /// Logical or (non-zero is true)
    Or,
}

impl ReduceOp {
    /// Operator name as accepted by [`FromStr`]
    pub fn name(&self) -> &'static str {
        match self {
            ReduceOp::Sum => "SUM",
            ReduceOp::Product => "PRODUCT",
            ReduceOp::Min => "MIN",
            ReduceOp::Max => "MAX",
            ReduceOp::And => "AND",
            ReduceOp::Or => "OR",
        }
    }

    /// Combine two elements
    pub fn combine(&self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Product => a * b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
            ReduceOp::And => bool_to_f64(a != 0.0 && b != 0.0),
            ReduceOp::Or => bool_to_f64(a != 0.0 || b != 0.0),
        }
    }

    /// Fold `other` into `acc` element-wise
    pub fn apply(&self, acc: &mut [f64], other: &[f64]) -> Result<()> {
        if acc.len() != other.len() {
            return Err(DistError::ShapeMismatch {
                expected: vec![acc.len()],
                got: vec![other.len()],
            });
        }
        for (a, &b) in acc.iter_mut().zip(other) {
            *a = self.combine(*a, b);
        }
        Ok(())
    }
}

fn bool_to_f64(v: bool) -> f64 {
    if v {
        1.0
    } else {
        0.0
    }
}

impl FromStr for ReduceOp {
    type Err = DistError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SUM" => Ok(ReduceOp::Sum),
            "PRODUCT" => Ok(ReduceOp::Product),
            "MIN" => Ok(ReduceOp::Min),
            "MAX" => Ok(ReduceOp::Max),
            "AND" => Ok(ReduceOp::And),
            "OR" => Ok(ReduceOp::Or),
            _ => Err(DistError::UnsupportedOp { op: s.to_string() }),
        }
    }
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dense row-major buffer of `f64` elements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buffer {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Buffer {
    /// Create a buffer, checking that `data` fills `shape`
    pub fn new(data: Vec<f64>, shape: Vec<usize>) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(DistError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional buffer
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Single-element buffer holding a scalar
    pub fn scalar(value: f64) -> Self {
        Self::from_vec(vec![value])
    }

    /// Shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Flat element view
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Mutable flat element view
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Consume into flat elements
    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    /// Element count
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Leading dimension and the trailing shape; 0-d buffers count as `[1]`
    fn split_leading(&self) -> (usize, &[usize]) {
        match self.shape.split_first() {
            Some((&lead, rest)) => (lead, rest),
            None => (1, &[]),
        }
    }

    /// Concatenate along the leading dimension
    pub fn concat(parts: &[Buffer]) -> Result<Buffer> {
        let Some(first) = parts.first() else {
            return Ok(Buffer::from_vec(Vec::new()));
        };
        let (_, trailing) = first.split_leading();

        let mut leading = 0;
        let mut data = Vec::with_capacity(parts.iter().map(Buffer::len).sum());
        for part in parts {
            let (lead, rest) = part.split_leading();
            if rest != trailing {
                return Err(DistError::ShapeMismatch {
                    expected: trailing.to_vec(),
                    got: rest.to_vec(),
                });
            }
            leading += lead;
            data.extend_from_slice(&part.data);
        }

        let mut shape = Vec::with_capacity(trailing.len() + 1);
        shape.push(leading);
        shape.extend_from_slice(trailing);
        Buffer::new(data, shape)
    }
}

/// Input and output of [`all_reduce`](crate::ComputationModel::all_reduce)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Plain number
    Scalar(f64),
    /// Structured buffer
    Buffer(Buffer),
}

impl Value {
    /// Scalar payload, if any
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            Value::Buffer(_) => None,
        }
    }

    /// Buffer payload, if any
    pub fn as_buffer(&self) -> Option<&Buffer> {
        match self {
            Value::Scalar(_) => None,
            Value::Buffer(b) => Some(b),
        }
    }

    /// Buffer view of the value; scalars become a one-element buffer
    pub fn into_buffer(self) -> Buffer {
        match self {
            Value::Scalar(v) => Buffer::scalar(v),
            Value::Buffer(b) => b,
        }
    }

    /// Run `reduce` on the buffer form and restore the original variant
    pub(crate) fn reduce_with<F>(self, reduce: F) -> Result<Value>
    where
        F: FnOnce(&mut [f64]) -> Result<()>,
    {
        match self {
            Value::Scalar(v) => {
                let mut wrapped = [v];
                reduce(&mut wrapped)?;
                Ok(Value::Scalar(wrapped[0]))
            }
            Value::Buffer(mut b) => {
                reduce(b.data_mut())?;
                Ok(Value::Buffer(b))
            }
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Scalar(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Scalar(f64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Scalar(f64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Scalar(f64::from(v))
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Scalar(v as f64)
    }
}

impl From<Buffer> for Value {
    fn from(b: Buffer) -> Self {
        Value::Buffer(b)
    }
}

impl From<Vec<f64>> for Value {
    fn from(data: Vec<f64>) -> Self {
        Value::Buffer(Buffer::from_vec(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ops() {
        assert_eq!("SUM".parse::<ReduceOp>().unwrap(), ReduceOp::Sum);
        assert_eq!("product".parse::<ReduceOp>().unwrap(), ReduceOp::Product);
        assert_eq!("Max".parse::<ReduceOp>().unwrap(), ReduceOp::Max);

        let err = "XOR".parse::<ReduceOp>().unwrap_err();
        assert!(matches!(err, DistError::UnsupportedOp { ref op } if op == "XOR"));
    }

    #[test]
    fn test_logical_ops() {
        assert_eq!(ReduceOp::And.combine(2.0, 0.0), 0.0);
        assert_eq!(ReduceOp::And.combine(2.0, -1.0), 1.0);
        assert_eq!(ReduceOp::Or.combine(0.0, 0.0), 0.0);
        assert_eq!(ReduceOp::Or.combine(0.0, 3.0), 1.0);
    }

    #[test]
    fn test_apply_length_mismatch() {
        let mut acc = vec![1.0, 2.0];
        assert!(ReduceOp::Sum.apply(&mut acc, &[1.0]).is_err());

        ReduceOp::Min.apply(&mut acc, &[0.5, 4.0]).unwrap();
        assert_eq!(acc, vec![0.5, 2.0]);
    }

    #[test]
    fn test_buffer_shape_check() {
        assert!(Buffer::new(vec![1.0, 2.0, 3.0], vec![2, 2]).is_err());
        let b = Buffer::new(vec![1.0; 6], vec![2, 3]).unwrap();
        assert_eq!(b.shape(), &[2, 3]);
        assert_eq!(b.len(), 6);
    }

    #[test]
    fn test_concat_leading_dim() {
        let a = Buffer::new(vec![1.0, 2.0], vec![1, 2]).unwrap();
        let b = Buffer::new(vec![3.0, 4.0, 5.0, 6.0], vec![2, 2]).unwrap();
        let c = Buffer::concat(&[a, b]).unwrap();
        assert_eq!(c.shape(), &[3, 2]);
        assert_eq!(c.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let bad = Buffer::new(vec![1.0; 3], vec![1, 3]).unwrap();
        assert!(Buffer::concat(&[c, bad]).is_err());
    }

    #[test]
    fn test_concat_zero_dim() {
        let a = Buffer::new(vec![7.0], vec![]).unwrap();
        let b = Buffer::new(vec![8.0], vec![]).unwrap();
        let c = Buffer::concat(&[a, b]).unwrap();
        assert_eq!(c.shape(), &[2]);
    }

    #[test]
    fn test_reduce_with_keeps_variant() {
        let out = Value::Scalar(2.0)
            .reduce_with(|d| {
                d[0] *= 3.0;
                Ok(())
            })
            .unwrap();
        assert_eq!(out, Value::Scalar(6.0));

        let out = Value::from(vec![1.0, 2.0])
            .reduce_with(|d| {
                d.iter_mut().for_each(|x| *x += 1.0);
                Ok(())
            })
            .unwrap();
        assert_eq!(out.as_buffer().unwrap().data(), &[2.0, 3.0]);
    }
}
