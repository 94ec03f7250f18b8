//! Gather, scatter and bounds probing for [`IndexSpec`] expressions.
//!
//! Indices are truncated toward zero and negative indices count from the end
//! of their axis. Out-of-range positions clamp on gather and are dropped on
//! scatter; the bounds probe reports the first offending position.

use crate::array::{broadcast_shapes, increment, strides, Array};
use crate::ir::{AxisIndex, IndexSpec, UpdateMode};

use super::{EvalError, Result};

/// Resolved geometry of one index expression.
struct IndexLayout {
    operand_shape: Vec<usize>,
    take_axes: Vec<usize>,
    full_axes: Vec<usize>,
    batch_shape: Vec<usize>,
    /// Where the broadcast index shape sits in the output shape.
    batch_pos: usize,
    out_shape: Vec<usize>,
    /// One broadcast index array per taken axis.
    indices: Vec<Array>,
}

/// Outcome of resolving one index position on one axis.
enum Resolved {
    InBounds(usize),
    Out { raw: i64, normalized: i64 },
}

impl IndexLayout {
    fn new(
        primitive: &'static str,
        spec: &IndexSpec,
        operand: &Array,
        indices: &[Array],
    ) -> Result<Self> {
        let operand_shape = operand.shape().to_vec();
        if spec.axes.len() > operand_shape.len() {
            return Err(EvalError::malformed(
                primitive,
                format!(
                    "index {spec} has more axes than operand of shape {operand_shape:?}"
                ),
            ));
        }
        if indices.len() != spec.num_indices() {
            return Err(EvalError::Arity {
                context: primitive,
                expected: spec.num_indices(),
                got: indices.len(),
            });
        }

        let mut take_axes = Vec::new();
        let mut full_axes = Vec::new();
        for axis in 0..operand_shape.len() {
            match spec.axes.get(axis) {
                Some(AxisIndex::Take) => take_axes.push(axis),
                _ => full_axes.push(axis),
            }
        }

        let mut batch_shape = Vec::new();
        for index in indices {
            batch_shape = broadcast_shapes(&batch_shape, index.shape())?;
        }
        let indices = indices
            .iter()
            .map(|i| i.broadcast_to(&batch_shape))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let adjacent = take_axes.windows(2).all(|w| w[1] == w[0] + 1);
        let batch_pos = match take_axes.first() {
            Some(&first) if adjacent => full_axes.iter().filter(|&&a| a < first).count(),
            _ => 0,
        };
        let mut out_shape: Vec<usize> = full_axes.iter().map(|&a| operand_shape[a]).collect();
        for (k, &dim) in batch_shape.iter().enumerate() {
            out_shape.insert(batch_pos + k, dim);
        }

        Ok(Self {
            operand_shape,
            take_axes,
            full_axes,
            batch_shape,
            batch_pos,
            out_shape,
            indices,
        })
    }

    fn batch_len(&self) -> usize {
        self.batch_shape.iter().product()
    }

    /// Resolve the index at batch position `b` for the `k`-th taken axis.
    fn resolve_axis(&self, k: usize, b: usize) -> Resolved {
        let axis = self.take_axes[k];
        let size = self.operand_shape[axis] as i64;
        let raw = self.indices[k].data()[b].trunc() as i64;
        let normalized = if raw < 0 { raw + size } else { raw };
        if (0..size).contains(&normalized) {
            Resolved::InBounds(normalized as usize)
        } else {
            Resolved::Out { raw, normalized }
        }
    }

    /// Operand coordinates for an output position.
    ///
    /// Out-of-range indices clamp when `clamp` is set; otherwise the position
    /// is skipped (`None`).
    fn operand_coords(&self, out_coords: &[usize], clamp: bool) -> Option<Vec<usize>> {
        let blen = self.batch_shape.len();
        let batch_coords = &out_coords[self.batch_pos..self.batch_pos + blen];
        let b = ravel(batch_coords, &self.batch_shape);

        let mut coords = vec![0usize; self.operand_shape.len()];
        let full_coords = out_coords[..self.batch_pos]
            .iter()
            .chain(&out_coords[self.batch_pos + blen..]);
        for (&axis, &c) in self.full_axes.iter().zip(full_coords) {
            coords[axis] = c;
        }
        for (k, &axis) in self.take_axes.iter().enumerate() {
            coords[axis] = match self.resolve_axis(k, b) {
                Resolved::InBounds(i) => i,
                Resolved::Out { normalized, .. } if clamp => {
                    let size = self.operand_shape[axis];
                    if size == 0 {
                        return None;
                    }
                    normalized.clamp(0, size as i64 - 1) as usize
                }
                Resolved::Out { .. } => return None,
            };
        }
        Some(coords)
    }
}

fn ravel(coords: &[usize], shape: &[usize]) -> usize {
    ravel_with(coords, &strides(shape))
}

/// `operand[spec]` with clamped indices.
pub(crate) fn gather(spec: &IndexSpec, operand: &Array, indices: &[Array]) -> Result<Array> {
    let layout = IndexLayout::new("index", spec, operand, indices)?;
    let out_len: usize = layout.out_shape.iter().product();
    let operand_strides = strides(&layout.operand_shape);
    let mut data = Vec::with_capacity(out_len);
    let mut out_coords = vec![0usize; layout.out_shape.len()];
    for _ in 0..out_len {
        let coords = layout
            .operand_coords(&out_coords, true)
            .ok_or_else(|| EvalError::malformed("index", "cannot index an empty axis"))?;
        data.push(operand.data()[ravel_with(&coords, &operand_strides)]);
        increment(&mut out_coords, &layout.out_shape);
    }
    Ok(Array::new(layout.out_shape, data)?)
}

/// `operand.at[spec].<mode>(updates)`; out-of-range positions are dropped.
pub(crate) fn scatter(
    spec: &IndexSpec,
    mode: UpdateMode,
    operand: &Array,
    indices: &[Array],
    updates: &Array,
) -> Result<Array> {
    let layout = IndexLayout::new("index_update", spec, operand, indices)?;
    let updates = updates.broadcast_to(&layout.out_shape)?;
    let operand_strides = strides(&layout.operand_shape);
    let mut data = operand.data().to_vec();
    let mut out_coords = vec![0usize; layout.out_shape.len()];
    for &update in updates.data() {
        if let Some(coords) = layout.operand_coords(&out_coords, false) {
            let at = ravel_with(&coords, &operand_strides);
            data[at] = mode.apply(data[at], update);
        }
        increment(&mut out_coords, &layout.out_shape);
    }
    Ok(Array::new(layout.operand_shape, data)?)
}

/// `(pred, raw, normalized, axis, size)` for the first out-of-range index.
///
/// Index positions are scanned in row-major order of the broadcast index
/// shape; within a position the lowest offending axis wins.
pub(crate) fn probe(spec: &IndexSpec, operand: &Array, indices: &[Array]) -> Result<Vec<Array>> {
    let layout = IndexLayout::new("bounds_probe", spec, operand, indices)?;
    for b in 0..layout.batch_len() {
        for (k, &axis) in layout.take_axes.iter().enumerate() {
            if let Resolved::Out { raw, normalized } = layout.resolve_axis(k, b) {
                return Ok(vec![
                    Array::from_bool(true),
                    Array::scalar(raw as f64),
                    Array::scalar(normalized as f64),
                    Array::scalar(axis as f64),
                    Array::scalar(layout.operand_shape[axis] as f64),
                ]);
            }
        }
    }
    Ok(vec![
        Array::from_bool(false),
        Array::scalar(0.0),
        Array::scalar(0.0),
        Array::scalar(0.0),
        Array::scalar(0.0),
    ])
}

fn ravel_with(coords: &[usize], strides: &[usize]) -> usize {
    coords.iter().zip(strides).map(|(c, s)| c * s).sum()
}
