//! Forward-mode differentiation.
//!
//! [`jvp`] maps `f: (xs..) -> (ys..)` to
//! `(xs.., ts..) -> (ys.., tangents of ys..)`. Tangents are tracked
//! symbolically while rewriting: a value with no tangent is a known zero and
//! emits no derivative code. Zeros are materialised only where a construct
//! needs a tangent for every operand (loop carries, branch results and the
//! final results).
//!
//! A `custom_jvp` is replaced by a call of its rule, so the rule's own
//! primitives appear in the derivative as ordinary operations. Error-channel
//! primitives are copied with zero tangents.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::array::Array;
use crate::ir::{
    Atom, BinaryOp, Equation, Function, FunctionBuilder, Primitive, ReduceOp, UnaryOp, UpdateMode,
    Var,
};

/// Errors raised while differentiating.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdError {
    #[error("cannot differentiate {primitive}: {detail}")]
    Unsupported {
        primitive: &'static str,
        detail: String,
    },

    #[error("variable {0} is not defined")]
    UnknownVariable(Var),
}

pub type Result<T> = std::result::Result<T, AdError>;

/// Value of one variable in the derivative: primal atom and optional tangent.
type Dual = (Atom, Option<Atom>);

/// Forward-mode derivative of `func`.
pub fn jvp(func: &Function) -> Result<Function> {
    let out = jvp_function(func)?;
    debug!(
        equations = func.equations.len(),
        derivative_equations = out.equations.len(),
        "jvp"
    );
    Ok(out)
}

/// Derivative of a function whose first result is a scalar, with respect
/// to its first argument.
///
/// The result takes the original arguments and returns the tangent of the
/// first output for a unit tangent on the first argument.
pub fn grad(func: &Function) -> Result<Function> {
    let derivative = Arc::new(jvp_function(func)?);
    let num_outs = func.num_results();
    Ok(Function::build(func.num_params(), |b, params| {
        let mut args = params.to_vec();
        for (i, p) in params.iter().enumerate() {
            let zero = b.zeros_like(p);
            let tangent = if i == 0 { b.add(zero, 1.0) } else { zero };
            args.push(tangent);
        }
        let outs = b.call_shared(derivative, None, args);
        vec![outs[num_outs].clone()]
    }))
}

fn jvp_function(func: &Function) -> Result<Function> {
    let mut b = FunctionBuilder::new();
    let mut env: Vec<Option<Dual>> = vec![None; func.var_count as usize];

    let primals: Vec<Atom> = func.params.iter().map(|_| b.param()).collect();
    let tangents: Vec<Atom> = func.params.iter().map(|_| b.param()).collect();
    for ((param, x), t) in func.params.iter().zip(primals).zip(tangents) {
        bind(&mut env, *param, (x, Some(t)))?;
    }

    for eq in &func.equations {
        let (xs, ts): (Vec<Atom>, Vec<Option<Atom>>) = eq
            .inputs
            .iter()
            .map(|a| read(&env, a))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();
        let (ys, tys) = differentiate(&mut b, eq, xs, &ts)?;
        for ((var, y), ty) in eq.outputs.iter().zip(ys).zip(tys) {
            bind(&mut env, *var, (y, ty))?;
        }
    }

    let results = func
        .results
        .iter()
        .map(|a| read(&env, a))
        .collect::<Result<Vec<_>>>()?;
    let mut outs: Vec<Atom> = results.iter().map(|(y, _)| y.clone()).collect();
    for (y, ty) in &results {
        let t = dense(&mut b, y, ty);
        outs.push(t);
    }
    Ok(b.finish(outs))
}

fn bind(env: &mut [Option<Dual>], var: Var, dual: Dual) -> Result<()> {
    let slot = env
        .get_mut(var.0 as usize)
        .ok_or(AdError::UnknownVariable(var))?;
    *slot = Some(dual);
    Ok(())
}

fn read(env: &[Option<Dual>], atom: &Atom) -> Result<Dual> {
    match atom {
        Atom::Lit(_) => Ok((atom.clone(), None)),
        Atom::Var(v) => env
            .get(v.0 as usize)
            .and_then(Option::clone)
            .ok_or(AdError::UnknownVariable(*v)),
    }
}

/// Tangent with zeros in place of a symbolic zero.
fn dense(b: &mut FunctionBuilder, primal: &Atom, tangent: &Option<Atom>) -> Atom {
    match (tangent, primal) {
        (Some(t), _) => t.clone(),
        (None, Atom::Lit(a)) => Atom::Lit(Array::zeros(a.shape())),
        (None, Atom::Var(_)) => b.zeros_like(primal),
    }
}

/// Broadcast a one-sided tangent to the output shape.
fn fit(b: &mut FunctionBuilder, t: Atom, y: &Atom) -> Atom {
    let zero = b.zeros_like(y);
    b.add(zero, t)
}

fn sum(b: &mut FunctionBuilder, terms: Vec<Atom>) -> Option<Atom> {
    terms.into_iter().reduce(|acc, t| b.add(acc, t))
}

fn differentiate(
    b: &mut FunctionBuilder,
    eq: &Equation,
    xs: Vec<Atom>,
    ts: &[Option<Atom>],
) -> Result<(Vec<Atom>, Vec<Option<Atom>>)> {
    let n_out = eq.outputs.len();
    if ts.iter().all(Option::is_none) {
        let ys = b.push(eq.primitive.clone(), xs, n_out);
        return Ok((ys, vec![None; n_out]));
    }

    match &eq.primitive {
        Primitive::Unary(op) => {
            let y = b.unary(*op, &xs[0]);
            let t = unary_tangent(b, *op, &xs[0], &y, ts[0].clone());
            Ok((vec![y], vec![t]))
        }
        Primitive::Binary(op) => {
            let y = b.binary(*op, &xs[0], &xs[1]);
            let t = binary_tangent(b, *op, &xs, &y, ts);
            Ok((vec![y], vec![t]))
        }
        Primitive::Reduce(op) => {
            let y = b.reduce(*op, &xs[0]);
            let t = reduce_tangent(b, *op, &xs[0], &y, ts[0].clone());
            Ok((vec![y], vec![t]))
        }
        Primitive::Select => {
            let y = b.select(&xs[0], &xs[1], &xs[2]);
            let on_true = dense(b, &xs[1], &ts[1]);
            let on_false = dense(b, &xs[2], &ts[2]);
            let t = b.select(&xs[0], on_true, on_false);
            Ok((vec![y], vec![Some(t)]))
        }
        Primitive::Pack => {
            let y = b.pack(xs.clone());
            let items = xs.iter().zip(ts).map(|(x, t)| dense(b, x, t)).collect();
            let t = b.pack(items);
            Ok((vec![y], vec![Some(t)]))
        }
        Primitive::Index(spec) => {
            let y = b.index(&xs[0], spec.clone(), xs[1..].to_vec());
            let t = ts[0]
                .as_ref()
                .map(|t| b.index(t, spec.clone(), xs[1..].to_vec()));
            Ok((vec![y], vec![t]))
        }
        Primitive::IndexUpdate { spec, mode } => {
            let last = xs.len() - 1;
            let y = b.push1(eq.primitive.clone(), xs.clone());
            let (t_operand, t_updates) = (&ts[0], &ts[last]);
            if t_operand.is_none() && t_updates.is_none() {
                return Ok((vec![y], vec![None]));
            }
            match mode {
                UpdateMode::Set | UpdateMode::Add => {
                    let operand = dense(b, &xs[0], t_operand);
                    let updates = dense(b, &xs[last], t_updates);
                    let t = b.index_update(operand, spec.clone(), xs[1..last].to_vec(), updates, *mode);
                    Ok((vec![y], vec![Some(t)]))
                }
                other => Err(AdError::Unsupported {
                    primitive: "index_update",
                    detail: format!("{other:?} updates with a nonzero tangent"),
                }),
            }
        }
        Primitive::Assert { .. } | Primitive::Reraise { .. } => {
            b.push(eq.primitive.clone(), xs, 0);
            Ok((Vec::new(), Vec::new()))
        }
        Primitive::ZerosLike
        | Primitive::BoundsProbe(_)
        | Primitive::ErrorMerge { .. }
        | Primitive::FirstWhere => {
            let ys = b.push(eq.primitive.clone(), xs, n_out);
            Ok((ys, vec![None; n_out]))
        }
        Primitive::Cond { branches } => {
            let branches = branches
                .iter()
                .map(|br| jvp_function(br).map(Arc::new))
                .collect::<Result<Vec<_>>>()?;
            trace!(branches = branches.len(), "jvp cond");
            let mut inputs = xs.clone();
            for (x, t) in xs.iter().zip(ts).skip(1) {
                let t = dense(b, x, t);
                inputs.push(t);
            }
            let outs = b.push(Primitive::Cond { branches }, inputs, 2 * n_out);
            Ok(split_duals(outs, n_out))
        }
        Primitive::Scan {
            body,
            length,
            num_consts,
            num_carry,
        } => jvp_scan(b, body, *length, *num_consts, *num_carry, xs, ts),
        Primitive::While {
            cond,
            body,
            cond_consts,
            body_consts,
        } => jvp_while(b, cond, body, *cond_consts, *body_consts, xs, ts),
        Primitive::Map { body, mapped } => {
            let body = Arc::new(jvp_function(body)?);
            trace!("jvp map");
            let inputs = with_dense(b, xs, ts);
            let mut mapped = mapped.clone();
            mapped.extend_from_within(..);
            let outs = b.push(Primitive::Map { body, mapped }, inputs, 2 * n_out);
            Ok(split_duals(outs, n_out))
        }
        Primitive::Partition {
            body,
            shards,
            mapped,
        } => {
            let body = Arc::new(jvp_function(body)?);
            trace!(shards, "jvp partition");
            let inputs = with_dense(b, xs, ts);
            let mut mapped = mapped.clone();
            mapped.extend_from_within(..);
            let partition = Primitive::Partition {
                body,
                shards: *shards,
                mapped,
            };
            let outs = b.push(partition, inputs, 2 * n_out);
            Ok(split_duals(outs, n_out))
        }
        Primitive::Call { body, name } => {
            let body = Arc::new(jvp_function(body)?);
            let inputs = with_dense(b, xs, ts);
            let outs = b.call_shared(body, name.clone(), inputs);
            Ok(split_duals(outs, n_out))
        }
        Primitive::CustomJvp { rule, .. } => {
            trace!("jvp custom_jvp: calling rule");
            let inputs = with_dense(b, xs, ts);
            let outs = b.call_shared(Arc::clone(rule), None, inputs);
            if outs.len() != 2 * n_out {
                return Err(AdError::Unsupported {
                    primitive: "custom_jvp",
                    detail: format!("rule returns {} values for {n_out} outputs", outs.len()),
                });
            }
            Ok(split_duals(outs, n_out))
        }
    }
}

fn unary_tangent(b: &mut FunctionBuilder, op: UnaryOp, x: &Atom, y: &Atom, t: Option<Atom>) -> Option<Atom> {
    let t = t?;
    let out = match op {
        UnaryOp::Neg => b.neg(t),
        UnaryOp::Sin => {
            let d = b.cos(x);
            b.mul(t, d)
        }
        UnaryOp::Cos => {
            let s = b.sin(x);
            let d = b.neg(s);
            b.mul(t, d)
        }
        UnaryOp::Tanh => {
            let yy = b.mul(y, y);
            let d = b.sub(1.0, yy);
            b.mul(t, d)
        }
        UnaryOp::Exp => b.mul(t, y),
        UnaryOp::Log => b.div(t, x),
        UnaryOp::Sqrt => {
            let d = b.mul(2.0, y);
            b.div(t, d)
        }
        UnaryOp::Abs => {
            let negative = b.lt(x, 0.0);
            let sign = b.select(negative, -1.0, 1.0);
            b.mul(t, sign)
        }
        UnaryOp::Not | UnaryOp::IsNan => return None,
    };
    Some(out)
}

fn binary_tangent(
    b: &mut FunctionBuilder,
    op: BinaryOp,
    xs: &[Atom],
    y: &Atom,
    ts: &[Option<Atom>],
) -> Option<Atom> {
    let (x0, x1) = (&xs[0], &xs[1]);
    let (t0, t1) = (ts[0].clone(), ts[1].clone());
    match op {
        BinaryOp::Add => match (t0, t1) {
            (Some(t0), Some(t1)) => Some(b.add(t0, t1)),
            (Some(t), None) | (None, Some(t)) => Some(fit(b, t, y)),
            (None, None) => None,
        },
        BinaryOp::Sub => match (t0, t1) {
            (Some(t0), Some(t1)) => Some(b.sub(t0, t1)),
            (Some(t0), None) => Some(fit(b, t0, y)),
            (None, Some(t1)) => {
                let n = b.neg(t1);
                Some(fit(b, n, y))
            }
            (None, None) => None,
        },
        BinaryOp::Mul => {
            let mut terms = Vec::new();
            if let Some(t0) = t0 {
                terms.push(b.mul(t0, x1));
            }
            if let Some(t1) = t1 {
                terms.push(b.mul(x0, t1));
            }
            sum(b, terms)
        }
        BinaryOp::Div => {
            let mut terms = Vec::new();
            if let Some(t0) = t0 {
                terms.push(b.div(t0, x1));
            }
            if let Some(t1) = t1 {
                let scaled = b.mul(y, t1);
                let quotient = b.div(scaled, x1);
                terms.push(b.neg(quotient));
            }
            sum(b, terms)
        }
        BinaryOp::Pow => {
            let mut terms = Vec::new();
            if let Some(t0) = t0 {
                let e = b.sub(x1, 1.0);
                let p = b.pow(x0, e);
                let scaled = b.mul(t0, x1);
                terms.push(b.mul(scaled, p));
            }
            if let Some(t1) = t1 {
                let l = b.log(x0);
                let scaled = b.mul(t1, l);
                terms.push(b.mul(scaled, y));
            }
            sum(b, terms)
        }
        BinaryOp::Max | BinaryOp::Min => {
            let pick_first = if op == BinaryOp::Max {
                b.ge(x0, x1)
            } else {
                b.le(x0, x1)
            };
            let d0 = dense(b, x0, &t0);
            let d1 = dense(b, x1, &t1);
            Some(b.select(pick_first, d0, d1))
        }
        BinaryOp::Lt
        | BinaryOp::Le
        | BinaryOp::Gt
        | BinaryOp::Ge
        | BinaryOp::Eq
        | BinaryOp::Ne
        | BinaryOp::And
        | BinaryOp::Or => None,
    }
}

fn reduce_tangent(b: &mut FunctionBuilder, op: ReduceOp, x: &Atom, y: &Atom, t: Option<Atom>) -> Option<Atom> {
    let t = t?;
    match op {
        ReduceOp::Sum => Some(b.reduce_sum(t)),
        ReduceOp::Max | ReduceOp::Min => {
            // Ties share the derivative evenly.
            let hits = b.eq(x, y);
            let count = b.reduce_sum(&hits);
            let picked = b.select(hits, t, 0.0);
            let total = b.reduce_sum(picked);
            Some(b.div(total, count))
        }
        ReduceOp::All | ReduceOp::Any => None,
    }
}

/// Primal inputs followed by dense tangents.
fn with_dense(b: &mut FunctionBuilder, xs: Vec<Atom>, ts: &[Option<Atom>]) -> Vec<Atom> {
    let tangents: Vec<Atom> = xs.iter().zip(ts).map(|(x, t)| dense(b, x, t)).collect();
    let mut inputs = xs;
    inputs.extend(tangents);
    inputs
}

fn split_duals(mut outs: Vec<Atom>, n_out: usize) -> (Vec<Atom>, Vec<Option<Atom>>) {
    let tangents = outs.split_off(n_out).into_iter().map(Some).collect();
    (outs, tangents)
}

fn jvp_scan(
    b: &mut FunctionBuilder,
    body: &Function,
    length: usize,
    num_consts: usize,
    num_carry: usize,
    xs: Vec<Atom>,
    ts: &[Option<Atom>],
) -> Result<(Vec<Atom>, Vec<Option<Atom>>)> {
    let derivative = Arc::new(jvp_function(body)?);
    let num_xs = xs.len() - num_consts - num_carry;
    let num_ys = body.num_results() - num_carry;
    trace!(length, num_consts, num_carry, "jvp scan");

    // (consts, tconsts, carry, tcarry, xs, txs) -> (carry, tcarry, ys, tys)
    let groups = [num_consts, num_carry, num_xs];
    let wrapper = Function::build(2 * xs.len(), |b, params| {
        let mut primal = Vec::new();
        let mut tangent = Vec::new();
        let mut at = 0;
        for n in groups {
            primal.extend_from_slice(&params[at..at + n]);
            tangent.extend_from_slice(&params[at + n..at + 2 * n]);
            at += 2 * n;
        }
        primal.extend(tangent);
        let outs = b.call_shared(derivative, None, primal);
        let n_res = num_carry + num_ys;
        let mut results = outs[..num_carry].to_vec();
        results.extend_from_slice(&outs[n_res..n_res + num_carry]);
        results.extend_from_slice(&outs[num_carry..n_res]);
        results.extend_from_slice(&outs[n_res + num_carry..]);
        results
    });

    let mut inputs = Vec::with_capacity(2 * xs.len());
    let mut at = 0;
    for n in groups {
        inputs.extend_from_slice(&xs[at..at + n]);
        for k in at..at + n {
            let t = dense(b, &xs[k], &ts[k]);
            inputs.push(t);
        }
        at += n;
    }
    let outs = b.push(
        Primitive::Scan {
            body: Arc::new(wrapper),
            length,
            num_consts: 2 * num_consts,
            num_carry: 2 * num_carry,
        },
        inputs,
        2 * (num_carry + num_ys),
    );

    let mut ys = outs[..num_carry].to_vec();
    ys.extend_from_slice(&outs[2 * num_carry..2 * num_carry + num_ys]);
    let mut tys: Vec<Option<Atom>> = outs[num_carry..2 * num_carry].iter().cloned().map(Some).collect();
    tys.extend(outs[2 * num_carry + num_ys..].iter().cloned().map(Some));
    Ok((ys, tys))
}

fn jvp_while(
    b: &mut FunctionBuilder,
    cond: &Arc<Function>,
    body: &Function,
    cond_consts: usize,
    body_consts: usize,
    xs: Vec<Atom>,
    ts: &[Option<Atom>],
) -> Result<(Vec<Atom>, Vec<Option<Atom>>)> {
    let derivative = Arc::new(jvp_function(body)?);
    let num_carry = xs.len() - cond_consts - body_consts;
    trace!(cond_consts, body_consts, num_carry, "jvp while");

    // (cond_consts, carry, tcarry) -> pred
    let cond = Arc::clone(cond);
    let cond_wrapper = Function::build(cond_consts + 2 * num_carry, |b, params| {
        let args = params[..cond_consts + num_carry].to_vec();
        b.call_shared(cond, None, args)
    });

    // (body_consts, tbody_consts, carry, tcarry) -> (carry, tcarry)
    let body_wrapper = Function::build(2 * body_consts + 2 * num_carry, |b, params| {
        let (bc, rest) = params.split_at(body_consts);
        let (tbc, rest) = rest.split_at(body_consts);
        let (carry, tcarry) = rest.split_at(num_carry);
        let mut args = bc.to_vec();
        args.extend_from_slice(carry);
        args.extend_from_slice(tbc);
        args.extend_from_slice(tcarry);
        b.call_shared(derivative, None, args)
    });

    let mut inputs = xs[..cond_consts + body_consts].to_vec();
    for k in cond_consts..cond_consts + body_consts {
        let t = dense(b, &xs[k], &ts[k]);
        inputs.push(t);
    }
    inputs.extend_from_slice(&xs[cond_consts + body_consts..]);
    for k in cond_consts + body_consts..xs.len() {
        let t = dense(b, &xs[k], &ts[k]);
        inputs.push(t);
    }
    let outs = b.push(
        Primitive::While {
            cond: Arc::new(cond_wrapper),
            body: Arc::new(body_wrapper),
            cond_consts,
            body_consts: 2 * body_consts,
        },
        inputs,
        2 * num_carry,
    );
    Ok(split_duals(outs, num_carry))
}
