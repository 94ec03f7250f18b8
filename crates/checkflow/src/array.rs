//! Dense array values.
//!
//! Every runtime value in a program is an [`Array`]: row-major `f64` storage
//! behind an `Arc<[f64]>`, so values are cheap to clone while they flow
//! through the interpreter and through replicated execution.
//!
//! Arrays are dtype-less. Booleans are stored as `0.0` / `1.0` and integers
//! (indices, error codes) are stored exactly as `f64`.
//!
//! # Broadcasting
//!
//! Elementwise operations follow numpy broadcasting: shapes are aligned on
//! their trailing axes and axes of size 1 stretch to match.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shape errors raised by array construction and manipulation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("shapes {lhs:?} and {rhs:?} cannot be broadcast together")]
    Broadcast { lhs: Vec<usize>, rhs: Vec<usize> },

    #[error("data length {len} does not match shape {shape:?}")]
    Length { len: usize, shape: Vec<usize> },

    #[error("expected a scalar, got shape {0:?}")]
    NotScalar(Vec<usize>),

    #[error("cannot take axis 0 of a rank-0 array")]
    Rank0,

    #[error("slice {index} out of range for axis 0 of size {size}")]
    Slice { index: usize, size: usize },

    #[error("cannot stack arrays of shapes {0:?} and {1:?}")]
    Stack(Vec<usize>, Vec<usize>),

    #[error("cannot stack an empty list of arrays without an element shape")]
    EmptyStack,
}

/// A dense, immutable, row-major array of `f64`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Array {
    shape: Vec<usize>,
    data: Arc<[f64]>,
}

impl Array {
    /// Build an array from a shape and row-major data.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, ShapeError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ShapeError::Length {
                len: data.len(),
                shape,
            });
        }
        Ok(Self {
            shape,
            data: data.into(),
        })
    }

    /// Build from parts whose sizes are known to agree.
    pub(crate) fn from_parts(shape: Vec<usize>, data: Vec<f64>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self {
            shape,
            data: data.into(),
        }
    }

    /// Rank-0 array holding `value`.
    pub fn scalar(value: f64) -> Self {
        Self {
            shape: Vec::new(),
            data: Arc::from([value]),
        }
    }

    /// Rank-1 array from a vector of values.
    pub fn from_vec(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: values.into(),
        }
    }

    /// Boolean scalar (`1.0` for true).
    pub fn from_bool(value: bool) -> Self {
        Self::scalar(if value { 1.0 } else { 0.0 })
    }

    /// Array of the given shape filled with `value`.
    pub fn full(shape: &[usize], value: f64) -> Self {
        let size = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![value; size].into(),
        }
    }

    /// Array of zeros with the given shape.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// `[0, 1, ..., n-1]`.
    pub fn arange(n: usize) -> Self {
        Self::from_vec((0..n).map(|i| i as f64).collect())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// The single element of a rank-0 (or size-1) array.
    pub fn to_scalar(&self) -> Result<f64, ShapeError> {
        if self.data.len() == 1 {
            Ok(self.data[0])
        } else {
            Err(ShapeError::NotScalar(self.shape.clone()))
        }
    }

    /// Reinterpret the data with a new shape of the same size.
    pub fn reshape(&self, shape: Vec<usize>) -> Result<Self, ShapeError> {
        let expected: usize = shape.iter().product();
        if expected != self.data.len() {
            return Err(ShapeError::Length {
                len: self.data.len(),
                shape,
            });
        }
        Ok(Self {
            shape,
            data: Arc::clone(&self.data),
        })
    }

    /// Apply `f` to every element.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    /// Broadcasting elementwise combination of two arrays.
    pub fn zip_with(&self, other: &Array, f: impl Fn(f64, f64) -> f64) -> Result<Self, ShapeError> {
        let shape = broadcast_shapes(&self.shape, &other.shape)?;
        let lhs = self.broadcast_to(&shape)?;
        let rhs = other.broadcast_to(&shape)?;
        let data = lhs
            .data
            .iter()
            .zip(rhs.data.iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Ok(Self { shape, data })
    }

    /// Broadcasting three-way select: `pred ? on_true : on_false`.
    pub fn select(pred: &Array, on_true: &Array, on_false: &Array) -> Result<Self, ShapeError> {
        let shape = broadcast_shapes(&pred.shape, &on_true.shape)?;
        let shape = broadcast_shapes(&shape, &on_false.shape)?;
        let p = pred.broadcast_to(&shape)?;
        let t = on_true.broadcast_to(&shape)?;
        let f = on_false.broadcast_to(&shape)?;
        let data = (0..p.len())
            .map(|i| if truthy(p.data[i]) { t.data[i] } else { f.data[i] })
            .collect();
        Ok(Self { shape, data })
    }

    /// Materialise this array broadcast to `shape`.
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Self, ShapeError> {
        if self.shape == shape {
            return Ok(self.clone());
        }
        let target = broadcast_shapes(&self.shape, shape)?;
        if target != shape {
            return Err(ShapeError::Broadcast {
                lhs: self.shape.clone(),
                rhs: shape.to_vec(),
            });
        }
        let out_size: usize = shape.iter().product();
        let offset = shape.len() - self.shape.len();
        let src_strides = strides(&self.shape);
        let mut data = Vec::with_capacity(out_size);
        let mut coords = vec![0usize; shape.len()];
        for _ in 0..out_size {
            let mut src = 0;
            for (axis, &dim) in self.shape.iter().enumerate() {
                let c = if dim == 1 { 0 } else { coords[axis + offset] };
                src += c * src_strides[axis];
            }
            data.push(self.data[src]);
            increment(&mut coords, shape);
        }
        Ok(Self {
            shape: shape.to_vec(),
            data: data.into(),
        })
    }

    /// True if any element is non-zero.
    pub fn any(&self) -> bool {
        self.data.iter().any(|&x| truthy(x))
    }

    /// True if every element is non-zero (vacuously true when empty).
    pub fn all(&self) -> bool {
        self.data.iter().all(|&x| truthy(x))
    }

    /// The `index`-th slice along axis 0.
    pub fn slice0(&self, index: usize) -> Result<Self, ShapeError> {
        let (&size, rest) = self.shape.split_first().ok_or(ShapeError::Rank0)?;
        if index >= size {
            return Err(ShapeError::Slice { index, size });
        }
        let stride: usize = rest.iter().product();
        let start = index * stride;
        Ok(Self {
            shape: rest.to_vec(),
            data: self.data[start..start + stride].into(),
        })
    }

    /// Size of axis 0.
    pub fn leading_dim(&self) -> Result<usize, ShapeError> {
        self.shape.first().copied().ok_or(ShapeError::Rank0)
    }

    /// Stack equally shaped arrays along a new axis 0.
    ///
    /// `element_shape` is used when `items` is empty.
    pub fn stack(items: &[Array], element_shape: Option<&[usize]>) -> Result<Self, ShapeError> {
        let elem: Vec<usize> = match (items.first(), element_shape) {
            (Some(first), _) => first.shape.clone(),
            (None, Some(shape)) => shape.to_vec(),
            (None, None) => return Err(ShapeError::EmptyStack),
        };
        let mut data = Vec::with_capacity(items.len() * elem.iter().product::<usize>());
        for item in items {
            if item.shape != elem {
                return Err(ShapeError::Stack(elem.clone(), item.shape.clone()));
            }
            data.extend_from_slice(&item.data);
        }
        let mut shape = Vec::with_capacity(elem.len() + 1);
        shape.push(items.len());
        shape.extend_from_slice(&elem);
        Ok(Self {
            shape,
            data: data.into(),
        })
    }
}

/// Treat a stored value as a boolean.
#[inline]
pub fn truthy(x: f64) -> bool {
    x != 0.0
}

/// Numpy broadcasting of two shapes.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, ShapeError> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let a = if i < rank - lhs.len() { 1 } else { lhs[i - (rank - lhs.len())] };
        let b = if i < rank - rhs.len() { 1 } else { rhs[i - (rank - rhs.len())] };
        out[i] = match (a, b) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(ShapeError::Broadcast {
                    lhs: lhs.to_vec(),
                    rhs: rhs.to_vec(),
                })
            }
        };
    }
    Ok(out)
}

/// Row-major strides for `shape`.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut out = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        out[axis] = out[axis + 1] * shape[axis + 1];
    }
    out
}

/// Advance a row-major multi-index by one position.
pub(crate) fn increment(coords: &mut [usize], shape: &[usize]) {
    for axis in (0..shape.len()).rev() {
        coords[axis] += 1;
        if coords[axis] < shape[axis] {
            return;
        }
        coords[axis] = 0;
    }
}

/// Render a number the way messages show it: integral values without a
/// fractional part.
pub fn format_number(x: f64) -> String {
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        format!("{x}")
    }
}

impl PartialEq for Array {
    /// Elementwise equality where NaN equals NaN.
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a == b || (a.is_nan() && b.is_nan()))
    }
}

impl From<f64> for Array {
    fn from(value: f64) -> Self {
        Array::scalar(value)
    }
}

impl From<bool> for Array {
    fn from(value: bool) -> Self {
        Array::from_bool(value)
    }
}

impl From<Vec<f64>> for Array {
    fn from(values: Vec<f64>) -> Self {
        Array::from_vec(values)
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Array{:?}({})", self.shape, self)
    }
}

impl fmt::Display for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_axis(
            f: &mut fmt::Formatter<'_>,
            shape: &[usize],
            data: &[f64],
        ) -> fmt::Result {
            match shape.split_first() {
                None => write!(f, "{}", format_number(data[0])),
                Some((&n, rest)) => {
                    let stride: usize = rest.iter().product();
                    write!(f, "[")?;
                    for i in 0..n {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write_axis(f, rest, &data[i * stride..(i + 1) * stride])?;
                    }
                    write!(f, "]")
                }
            }
        }
        write_axis(f, &self.shape, &self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_scalar_with_vector() {
        let a = Array::from_vec(vec![1.0, 2.0, 3.0]);
        let b = Array::scalar(10.0);
        let c = a.zip_with(&b, |x, y| x + y).unwrap();
        assert_eq!(c, Array::from_vec(vec![11.0, 12.0, 13.0]));
    }

    #[test]
    fn test_broadcast_row_and_column() {
        let row = Array::new(vec![1, 3], vec![1.0, 2.0, 3.0]).unwrap();
        let col = Array::new(vec![2, 1], vec![10.0, 20.0]).unwrap();
        let sum = row.zip_with(&col, |x, y| x + y).unwrap();
        assert_eq!(sum.shape(), &[2, 3]);
        assert_eq!(sum.data(), &[11.0, 12.0, 13.0, 21.0, 22.0, 23.0]);
    }

    #[test]
    fn test_broadcast_mismatch() {
        let a = Array::from_vec(vec![1.0, 2.0]);
        let b = Array::from_vec(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            a.zip_with(&b, |x, y| x + y),
            Err(ShapeError::Broadcast { .. })
        ));
    }

    #[test]
    fn test_stack_and_slice() {
        let rows = vec![Array::from_vec(vec![1.0, 2.0]), Array::from_vec(vec![3.0, 4.0])];
        let stacked = Array::stack(&rows, None).unwrap();
        assert_eq!(stacked.shape(), &[2, 2]);
        assert_eq!(stacked.slice0(1).unwrap(), rows[1]);
    }

    #[test]
    fn test_nan_aware_equality() {
        assert_eq!(Array::scalar(f64::NAN), Array::scalar(f64::NAN));
        assert_ne!(Array::scalar(1.0), Array::scalar(2.0));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(Array::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.5]).unwrap().to_string(), "[[1, 2], [3, 4.5]]");
    }
}
