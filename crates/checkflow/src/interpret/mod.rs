//! Reference interpreter.
//!
//! Evaluates a [`Function`] on concrete [`Array`] arguments, equation by
//! equation. Control constructs evaluate their nested bodies recursively;
//! `partition` replicas run in parallel on the rayon pool.
//!
//! # Error Handling
//!
//! Evaluation fails loudly. Malformed programs surface as
//! [`EvalError::Malformed`] or [`EvalError::Shape`]. An `assert` whose
//! predicate is false, or a `reraise` of a triggered error, aborts evaluation
//! with [`EvalError::CheckFailed`]: this is the synchronous raise used when a
//! check runs outside any instrumentation.

pub(crate) mod index;
pub(crate) mod ops;

use rayon::prelude::*;
use thiserror::Error;
use tracing::trace;

use crate::array::{truthy, Array, ShapeError};
use crate::checkify::schema::render_template;
use crate::ir::{Atom, Function, Primitive, Var};

/// Interpreter result type alias.
pub type Result<T> = std::result::Result<T, EvalError>;

/// Errors raised while evaluating a function.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// An unguarded check failed.
    #[error("{message}")]
    CheckFailed { message: String },

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("{context}: expected {expected} arguments, got {got}")]
    Arity {
        context: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("variable {0} has no value")]
    Unbound(Var),

    #[error("{primitive}: {detail}")]
    Malformed {
        primitive: &'static str,
        detail: String,
    },
}

impl EvalError {
    pub(crate) fn malformed(primitive: &'static str, detail: impl Into<String>) -> Self {
        EvalError::Malformed {
            primitive,
            detail: detail.into(),
        }
    }
}

/// Evaluate `func` on `args`.
pub fn eval(func: &Function, args: &[Array]) -> Result<Vec<Array>> {
    if args.len() != func.params.len() {
        return Err(EvalError::Arity {
            context: "function",
            expected: func.params.len(),
            got: args.len(),
        });
    }

    let mut env: Vec<Option<Array>> = vec![None; func.var_count as usize];
    for (param, arg) in func.params.iter().zip(args) {
        bind(&mut env, *param, arg.clone())?;
    }

    for eq in &func.equations {
        let inputs = eq
            .inputs
            .iter()
            .map(|a| read(&env, a))
            .collect::<Result<Vec<_>>>()?;
        let outputs = apply(&eq.primitive, &inputs)?;
        if outputs.len() != eq.outputs.len() {
            return Err(EvalError::Arity {
                context: eq.primitive.name(),
                expected: eq.outputs.len(),
                got: outputs.len(),
            });
        }
        for (var, value) in eq.outputs.iter().zip(outputs) {
            bind(&mut env, *var, value)?;
        }
    }

    func.results.iter().map(|a| read(&env, a)).collect()
}

fn bind(env: &mut [Option<Array>], var: Var, value: Array) -> Result<()> {
    let slot = env.get_mut(var.0 as usize).ok_or(EvalError::Unbound(var))?;
    *slot = Some(value);
    Ok(())
}

fn read(env: &[Option<Array>], atom: &Atom) -> Result<Array> {
    match atom {
        Atom::Lit(a) => Ok(a.clone()),
        Atom::Var(v) => env
            .get(v.0 as usize)
            .and_then(Option::clone)
            .ok_or(EvalError::Unbound(*v)),
    }
}

/// Apply one primitive to evaluated inputs.
pub(crate) fn apply(primitive: &Primitive, inputs: &[Array]) -> Result<Vec<Array>> {
    let required = min_inputs(primitive);
    if inputs.len() < required {
        return Err(EvalError::Arity {
            context: primitive.name(),
            expected: required,
            got: inputs.len(),
        });
    }
    let one = |a: Array| -> Result<Vec<Array>> { Ok(vec![a]) };
    match primitive {
        Primitive::Unary(op) => one(ops::unary(*op, &inputs[0])),
        Primitive::Binary(op) => one(ops::binary(*op, &inputs[0], &inputs[1])?),
        Primitive::Reduce(op) => one(ops::reduce(*op, &inputs[0])),
        Primitive::Select => one(Array::select(&inputs[0], &inputs[1], &inputs[2])?),
        Primitive::ZerosLike => one(Array::zeros(inputs[0].shape())),
        Primitive::Pack => one(ops::pack(inputs)?),
        Primitive::Index(spec) => one(index::gather(spec, &inputs[0], &inputs[1..])?),
        Primitive::IndexUpdate { spec, mode } => {
            let (updates, rest) = inputs
                .split_last()
                .ok_or_else(|| EvalError::malformed("index_update", "missing updates"))?;
            one(index::scatter(spec, *mode, &rest[0], &rest[1..], updates)?)
        }
        Primitive::BoundsProbe(spec) => index::probe(spec, &inputs[0], &inputs[1..]),
        Primitive::Assert { message } => {
            if inputs[0].all() {
                return Ok(Vec::new());
            }
            let args = inputs[1..]
                .iter()
                .map(|a| a.to_scalar().map(crate::array::format_number))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Err(EvalError::CheckFailed {
                message: render_template(message, &args),
            })
        }
        Primitive::ErrorMerge { base, offset, .. } => ops::error_merge(*base, *offset, inputs),
        Primitive::FirstWhere => ops::first_where(inputs),
        Primitive::Reraise { slots } => {
            let first = ops::first_where(inputs)?;
            if !truthy(first[0].to_scalar()?) {
                return Ok(Vec::new());
            }
            let code = first[1].to_scalar()? as usize;
            let slot = slots.get(code).ok_or_else(|| {
                EvalError::malformed("reraise", format!("code {code} is not in the message table"))
            })?;
            Err(EvalError::CheckFailed {
                message: slot.render(first[2].data()),
            })
        }
        Primitive::Cond { branches } => {
            if branches.is_empty() {
                return Err(EvalError::malformed("cond", "no branches"));
            }
            let index = inputs[0].to_scalar()?;
            let chosen = branch_index(index, branches.len());
            trace!(branch = chosen, "cond");
            eval(&branches[chosen], &inputs[1..])
        }
        Primitive::Scan {
            body,
            length,
            num_consts,
            num_carry,
        } => scan(body, *length, *num_consts, *num_carry, inputs),
        Primitive::While {
            cond,
            body,
            cond_consts,
            body_consts,
        } => while_loop(cond, body, *cond_consts, *body_consts, inputs),
        Primitive::Map { body, mapped } => {
            let n = batch_size("map", mapped, inputs)?;
            trace!(replicas = n, "map");
            let replicas = (0..n)
                .map(|i| eval(body, &replica_args(mapped, inputs, i)?))
                .collect::<Result<Vec<_>>>()?;
            stack_replicas(body, replicas)
        }
        Primitive::Partition {
            body,
            shards,
            mapped,
        } => {
            let n = batch_size("partition", mapped, inputs)?;
            if n != *shards {
                return Err(EvalError::malformed(
                    "partition",
                    format!("mapped inputs have {n} rows for {shards} shards"),
                ));
            }
            trace!(shards = n, "partition");
            let replicas = (0..n)
                .into_par_iter()
                .map(|i| eval(body, &replica_args(mapped, inputs, i)?))
                .collect::<Result<Vec<_>>>()?;
            stack_replicas(body, replicas)
        }
        Primitive::Call { body, .. } => eval(body, inputs),
        Primitive::CustomJvp { primal, .. } => eval(primal, inputs),
    }
}

fn min_inputs(primitive: &Primitive) -> usize {
    match primitive {
        Primitive::Unary(_)
        | Primitive::Reduce(_)
        | Primitive::ZerosLike
        | Primitive::Assert { .. }
        | Primitive::FirstWhere
        | Primitive::Cond { .. } => 1,
        Primitive::Binary(_) => 2,
        Primitive::Select | Primitive::Reraise { .. } => 3,
        Primitive::Index(spec) | Primitive::BoundsProbe(spec) => 1 + spec.num_indices(),
        Primitive::IndexUpdate { spec, .. } => 2 + spec.num_indices(),
        Primitive::ErrorMerge { .. } => 6,
        _ => 0,
    }
}

/// Branch selected by a `cond` index: truncated, then clamped to range.
pub(crate) fn branch_index(index: f64, branches: usize) -> usize {
    if index.is_nan() || index <= 0.0 {
        0
    } else {
        (index.trunc() as usize).min(branches.saturating_sub(1))
    }
}

fn scan(
    body: &Function,
    length: usize,
    num_consts: usize,
    num_carry: usize,
    inputs: &[Array],
) -> Result<Vec<Array>> {
    let (consts, rest) = inputs.split_at(num_consts);
    let (init, xs) = rest.split_at(num_carry);
    for x in xs {
        let rows = x.leading_dim()?;
        if rows != length {
            return Err(EvalError::malformed(
                "scan",
                format!("xs have leading dimension {rows}, expected {length}"),
            ));
        }
    }
    trace!(length, "scan");

    let num_ys = body.num_results().saturating_sub(num_carry);
    let mut carry = init.to_vec();
    let mut ys: Vec<Vec<Array>> = vec![Vec::with_capacity(length); num_ys];
    for step in 0..length {
        let mut args = consts.to_vec();
        args.extend(carry.iter().cloned());
        for x in xs {
            args.push(x.slice0(step)?);
        }
        let mut outs = eval(body, &args)?;
        let step_ys = outs.split_off(num_carry);
        carry = outs;
        for (acc, y) in ys.iter_mut().zip(step_ys) {
            acc.push(y);
        }
    }

    let mut outputs = carry;
    for acc in ys {
        outputs.push(Array::stack(&acc, None)?);
    }
    Ok(outputs)
}

fn while_loop(
    cond: &Function,
    body: &Function,
    cond_consts: usize,
    body_consts: usize,
    inputs: &[Array],
) -> Result<Vec<Array>> {
    let (cc, rest) = inputs.split_at(cond_consts);
    let (bc, init) = rest.split_at(body_consts);
    let mut carry = init.to_vec();
    let mut iterations = 0usize;
    loop {
        let mut args = cc.to_vec();
        args.extend(carry.iter().cloned());
        let pred = eval(cond, &args)?;
        let keep_going = pred
            .first()
            .ok_or_else(|| EvalError::malformed("while", "predicate returned no value"))?
            .to_scalar()?;
        if !truthy(keep_going) {
            break;
        }
        let mut args = bc.to_vec();
        args.extend(carry);
        carry = eval(body, &args)?;
        iterations += 1;
    }
    trace!(iterations, "while");
    Ok(carry)
}

fn batch_size(primitive: &'static str, mapped: &[bool], inputs: &[Array]) -> Result<usize> {
    if mapped.len() != inputs.len() {
        return Err(EvalError::Arity {
            context: primitive,
            expected: mapped.len(),
            got: inputs.len(),
        });
    }
    let mut size = None;
    for (input, _) in inputs.iter().zip(mapped).filter(|(_, m)| **m) {
        let rows = input.leading_dim()?;
        match size {
            None => size = Some(rows),
            Some(n) if n != rows => {
                return Err(EvalError::malformed(
                    primitive,
                    format!("mapped inputs disagree on axis 0 ({n} vs {rows})"),
                ))
            }
            Some(_) => {}
        }
    }
    match size {
        Some(0) => Err(EvalError::malformed(primitive, "empty batch")),
        Some(n) => Ok(n),
        None => Err(EvalError::malformed(primitive, "no mapped input")),
    }
}

fn replica_args(mapped: &[bool], inputs: &[Array], i: usize) -> Result<Vec<Array>> {
    inputs
        .iter()
        .zip(mapped)
        .map(|(input, m)| if *m { Ok(input.slice0(i)?) } else { Ok(input.clone()) })
        .collect()
}

fn stack_replicas(body: &Function, replicas: Vec<Vec<Array>>) -> Result<Vec<Array>> {
    (0..body.num_results())
        .map(|k| {
            let column: Vec<Array> = replicas.iter().map(|r| r[k].clone()).collect();
            Ok(Array::stack(&column, None)?)
        })
        .collect()
}
