//! Program IR validation.
//!
//! Validates that a function is well-formed:
//! - every used variable is defined before use
//! - no variable is defined twice
//! - every primitive receives the number of inputs and outputs it expects
//! - nested bodies agree with the signature of the construct that owns them

use std::collections::HashSet;

use thiserror::Error;

use super::types::{Atom, Equation, Function, Primitive, Var};

/// IR validation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("variable {var} is used before it is defined")]
    UndefinedVariable { var: Var },

    #[error("variable {var} is defined more than once")]
    DuplicateDefinition { var: Var },

    #[error("variable {var} is outside the allocated range (var_count = {var_count})")]
    OutOfRange { var: Var, var_count: u32 },

    #[error("{primitive}: {detail}")]
    Arity {
        primitive: &'static str,
        detail: String,
    },

    #[error("in body {index} of {primitive}: {error}")]
    Nested {
        primitive: &'static str,
        index: usize,
        error: Box<ValidationError>,
    },
}

/// Validate a function and all of its nested bodies.
///
/// Returns Ok(()) if the function is valid, or every error found.
pub fn validate(func: &Function) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut defined: HashSet<Var> = HashSet::new();

    let define = |var: Var, defined: &mut HashSet<Var>, errors: &mut Vec<ValidationError>| {
        if var.0 >= func.var_count {
            errors.push(ValidationError::OutOfRange {
                var,
                var_count: func.var_count,
            });
        }
        if !defined.insert(var) {
            errors.push(ValidationError::DuplicateDefinition { var });
        }
    };

    for &p in &func.params {
        define(p, &mut defined, &mut errors);
    }

    for eq in &func.equations {
        for input in &eq.inputs {
            check_use(input, &defined, &mut errors);
        }
        check_arity(eq, &mut errors);
        for (index, sub) in eq.primitive.subfunctions().into_iter().enumerate() {
            if let Err(nested) = validate(sub) {
                errors.extend(nested.into_iter().map(|error| ValidationError::Nested {
                    primitive: eq.primitive.name(),
                    index,
                    error: Box::new(error),
                }));
            }
        }
        for &out in &eq.outputs {
            define(out, &mut defined, &mut errors);
        }
    }

    for result in &func.results {
        check_use(result, &defined, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_use(atom: &Atom, defined: &HashSet<Var>, errors: &mut Vec<ValidationError>) {
    if let Atom::Var(v) = atom {
        if !defined.contains(v) {
            errors.push(ValidationError::UndefinedVariable { var: *v });
        }
    }
}

fn check_arity(eq: &Equation, errors: &mut Vec<ValidationError>) {
    let n_in = eq.inputs.len();
    let n_out = eq.outputs.len();
    let expect = |want_in: usize, want_out: usize| -> Option<String> {
        (n_in != want_in || n_out != want_out).then(|| {
            format!("expected {want_in} inputs and {want_out} outputs, got {n_in} and {n_out}")
        })
    };
    let mut problems: Vec<String> = Vec::new();

    match &eq.primitive {
        Primitive::Unary(_) | Primitive::Reduce(_) | Primitive::ZerosLike => problems.extend(expect(1, 1)),
        Primitive::Binary(_) => problems.extend(expect(2, 1)),
        Primitive::Select => problems.extend(expect(3, 1)),
        Primitive::Pack => problems.extend(expect(n_in, 1)),
        Primitive::Index(spec) => problems.extend(expect(1 + spec.num_indices(), 1)),
        Primitive::IndexUpdate { spec, .. } => problems.extend(expect(2 + spec.num_indices(), 1)),
        Primitive::BoundsProbe(spec) => problems.extend(expect(1 + spec.num_indices(), 5)),
        Primitive::ErrorMerge { .. } => problems.extend(expect(6, 3)),
        Primitive::Reraise { .. } => problems.extend(expect(3, 0)),
        Primitive::Assert { .. } => {
            if n_in == 0 || n_out != 0 {
                problems.push(format!("expected a predicate and no outputs, got {n_in} inputs and {n_out} outputs"));
            }
        }
        Primitive::FirstWhere => {
            if n_in == 0 || n_out != n_in {
                problems.push(format!("expected flags plus values with matching outputs, got {n_in} inputs and {n_out} outputs"));
            }
        }
        Primitive::Cond { branches } => {
            if branches.is_empty() {
                problems.push("no branches".to_string());
            }
            if n_in == 0 {
                problems.push("missing branch index".to_string());
            }
            for (i, branch) in branches.iter().enumerate() {
                if branch.num_params() + 1 != n_in || branch.num_results() != n_out {
                    problems.push(format!(
                        "branch {i} has signature {} -> {}, expected {} -> {n_out}",
                        branch.num_params(),
                        branch.num_results(),
                        n_in.saturating_sub(1)
                    ));
                }
            }
        }
        Primitive::Scan {
            body,
            num_consts,
            num_carry,
            ..
        } => {
            if num_consts + num_carry > n_in || *num_carry > n_out {
                problems.push(format!(
                    "{num_consts} consts and {num_carry} carry do not fit {n_in} inputs and {n_out} outputs"
                ));
            }
            if body.num_params() != n_in || body.num_results() != n_out {
                problems.push(format!(
                    "body has signature {} -> {}, expected {n_in} -> {n_out}",
                    body.num_params(),
                    body.num_results()
                ));
            }
        }
        Primitive::While {
            cond,
            body,
            cond_consts,
            body_consts,
        } => {
            let carry = n_in.saturating_sub(cond_consts + body_consts);
            if cond_consts + body_consts > n_in {
                problems.push(format!("{n_in} inputs cannot hold {cond_consts} + {body_consts} consts"));
            }
            if n_out != carry {
                problems.push(format!("expected {carry} outputs, got {n_out}"));
            }
            if cond.num_params() != cond_consts + carry || cond.num_results() != 1 {
                problems.push(format!(
                    "cond has signature {} -> {}, expected {} -> 1",
                    cond.num_params(),
                    cond.num_results(),
                    cond_consts + carry
                ));
            }
            if body.num_params() != body_consts + carry || body.num_results() != carry {
                problems.push(format!(
                    "body has signature {} -> {}, expected {} -> {carry}",
                    body.num_params(),
                    body.num_results(),
                    body_consts + carry
                ));
            }
        }
        Primitive::Map { body, mapped } | Primitive::Partition { body, mapped, .. } => {
            if mapped.len() != n_in {
                problems.push(format!("{} mapped flags for {n_in} inputs", mapped.len()));
            }
            if !mapped.iter().any(|m| *m) {
                problems.push("no mapped input".to_string());
            }
            if body.num_params() != n_in || body.num_results() != n_out {
                problems.push(format!(
                    "body has signature {} -> {}, expected {n_in} -> {n_out}",
                    body.num_params(),
                    body.num_results()
                ));
            }
            if let Primitive::Partition { shards: 0, .. } = eq.primitive {
                problems.push("zero shards".to_string());
            }
        }
        Primitive::Call { body, .. } => {
            if body.num_params() != n_in || body.num_results() != n_out {
                problems.push(format!(
                    "body has signature {} -> {}, expected {n_in} -> {n_out}",
                    body.num_params(),
                    body.num_results()
                ));
            }
        }
        Primitive::CustomJvp { primal, rule } => {
            if primal.num_params() != n_in || primal.num_results() != n_out {
                problems.push(format!(
                    "primal has signature {} -> {}, expected {n_in} -> {n_out}",
                    primal.num_params(),
                    primal.num_results()
                ));
            }
            if rule.num_params() != 2 * n_in || rule.num_results() != 2 * n_out {
                problems.push(format!(
                    "rule has signature {} -> {}, expected {} -> {}",
                    rule.num_params(),
                    rule.num_results(),
                    2 * n_in,
                    2 * n_out
                ));
            }
        }
    }

    let name = eq.primitive.name();
    errors.extend(problems.into_iter().map(|detail| ValidationError::Arity {
        primitive: name,
        detail,
    }));
}
