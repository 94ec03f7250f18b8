//! Elementwise, reduction and error-channel kernels.

use crate::array::{truthy, Array};
use crate::checkify::error::ErrorValue;
use crate::ir::{BinaryOp, ReduceOp, UnaryOp};

use super::{EvalError, Result};

fn from_bool(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// `max` that propagates NaN.
pub(crate) fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

/// `min` that propagates NaN.
pub(crate) fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

pub(crate) fn unary(op: UnaryOp, x: &Array) -> Array {
    let f: fn(f64) -> f64 = match op {
        UnaryOp::Neg => |v: f64| -v,
        UnaryOp::Sin => f64::sin,
        UnaryOp::Cos => f64::cos,
        UnaryOp::Tanh => f64::tanh,
        UnaryOp::Exp => f64::exp,
        UnaryOp::Log => f64::ln,
        UnaryOp::Sqrt => f64::sqrt,
        UnaryOp::Abs => f64::abs,
        UnaryOp::Not => |v: f64| from_bool(!truthy(v)),
        UnaryOp::IsNan => |v: f64| from_bool(v.is_nan()),
    };
    x.map(f)
}

pub(crate) fn binary(op: BinaryOp, a: &Array, b: &Array) -> Result<Array> {
    let f: fn(f64, f64) -> f64 = match op {
        BinaryOp::Add => |x: f64, y: f64| x + y,
        BinaryOp::Sub => |x: f64, y: f64| x - y,
        BinaryOp::Mul => |x: f64, y: f64| x * y,
        BinaryOp::Div => |x: f64, y: f64| x / y,
        BinaryOp::Pow => f64::powf,
        BinaryOp::Max => nan_max,
        BinaryOp::Min => nan_min,
        BinaryOp::Lt => |x: f64, y: f64| from_bool(x < y),
        BinaryOp::Le => |x: f64, y: f64| from_bool(x <= y),
        BinaryOp::Gt => |x: f64, y: f64| from_bool(x > y),
        BinaryOp::Ge => |x: f64, y: f64| from_bool(x >= y),
        BinaryOp::Eq => |x: f64, y: f64| from_bool(x == y),
        BinaryOp::Ne => |x: f64, y: f64| from_bool(x != y),
        BinaryOp::And => |x: f64, y: f64| from_bool(truthy(x) && truthy(y)),
        BinaryOp::Or => |x: f64, y: f64| from_bool(truthy(x) || truthy(y)),
    };
    Ok(a.zip_with(b, f)?)
}

pub(crate) fn reduce(op: ReduceOp, x: &Array) -> Array {
    let data = x.data();
    let value = match op {
        ReduceOp::Sum => data.iter().sum(),
        ReduceOp::Max => data.iter().copied().fold(f64::NEG_INFINITY, nan_max),
        ReduceOp::Min => data.iter().copied().fold(f64::INFINITY, nan_min),
        ReduceOp::All => from_bool(x.all()),
        ReduceOp::Any => from_bool(x.any()),
    };
    Array::scalar(value)
}

/// Scalars to a rank-1 vector.
pub(crate) fn pack(items: &[Array]) -> Result<Array> {
    let values = items
        .iter()
        .map(|a| a.to_scalar())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Array::from_vec(values))
}

/// `(flags, values..) -> (any, values at the first true flag..)`.
///
/// Every value carries the shape of `flags` as a prefix; the selected row is
/// the remainder. With no true flag the rows are zeros.
pub(crate) fn first_where(inputs: &[Array]) -> Result<Vec<Array>> {
    let (flags, values) = inputs
        .split_first()
        .ok_or_else(|| EvalError::malformed("first_where", "missing flags"))?;
    let prefix = flags.shape();
    let first = flags.data().iter().position(|&f| truthy(f));

    let mut out = vec![Array::from_bool(first.is_some())];
    for value in values {
        if !value.shape().starts_with(prefix) {
            return Err(EvalError::malformed(
                "first_where",
                format!(
                    "value of shape {:?} is not batched like flags of shape {:?}",
                    value.shape(),
                    prefix
                ),
            ));
        }
        let row_shape = value.shape()[prefix.len()..].to_vec();
        let row_len: usize = row_shape.iter().product();
        let row = match first {
            Some(i) => value.data()[i * row_len..(i + 1) * row_len].to_vec(),
            None => vec![0.0; row_len],
        };
        out.push(Array::new(row_shape, row)?);
    }
    Ok(out)
}

/// `(flag, code, payload, pred, local_code, local_payload) -> (flag, code, payload)`.
pub(crate) fn error_merge(base: u32, offset: usize, inputs: &[Array]) -> Result<Vec<Array>> {
    let current = ErrorValue::from_channels(&inputs[0], &inputs[1], &inputs[2])?;
    let pred = inputs[3].any();
    let local_code = inputs[4].to_scalar()?;
    let local_payload = inputs[5].data();

    let end = offset + local_payload.len();
    if end > current.payload.len() {
        return Err(EvalError::malformed(
            "error_merge",
            format!(
                "payload range {offset}..{end} exceeds payload width {}",
                current.payload.len()
            ),
        ));
    }
    let mut payload = current.payload.clone();
    payload[offset..end].copy_from_slice(local_payload);
    let candidate = ErrorValue {
        triggered: pred,
        code: base + local_code as u32,
        payload,
    };
    Ok(current.merge(candidate).into_channels().to_vec())
}
