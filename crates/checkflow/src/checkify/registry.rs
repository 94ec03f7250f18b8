//! Check registry.
//!
//! A [`CheckRule`] says which primitives it guards, what message it reports,
//! and how to build its fault predicate and payload from an equation's own
//! inputs and outputs. The instrumentation pass consults the registry at every
//! equation and emits each enabled rule's probe right after the operation, so
//! a check never alters the value it guards.
//!
//! # Built-in rules
//!
//! | Rule | Guards | Fires when | Payload |
//! |---|---|---|---|
//! | `div` | `div` | any divisor element is exactly zero | none |
//! | `nan` | float arithmetic | an output is NaN and no input was | none |
//! | `oob` | `index`, `index_update` | an index is outside `[-size, size)` | raw, normalized, axis, size |
//! | `user` | `assert` | the predicate is not all true | format arguments |
//!
//! Rules run in registry order, so on one equation the division check is
//! merged before the NaN check.

use std::fmt;

use tracing::debug;

use crate::ir::{Atom, FunctionBuilder, Primitive, UnaryOp};

use super::error::{ErrorCategory, ErrorSet};

/// One equation being checked, with atoms already rewritten into the
/// instrumented function.
#[derive(Debug)]
pub struct CheckSite<'a> {
    pub primitive: &'a Primitive,
    pub inputs: &'a [Atom],
    pub outputs: &'a [Atom],
}

/// Fault predicate and captured payload emitted for one site.
#[derive(Debug, Clone)]
pub struct Probe {
    /// Scalar, true when the fault occurred.
    pub predicate: Atom,
    /// Scalars rendered into the message template, captured only when the
    /// predicate is true.
    pub payload: Vec<Atom>,
}

/// Builds the probe for a site.
pub type ProbeFn = fn(&mut FunctionBuilder, &CheckSite<'_>) -> Probe;

/// A registered check.
#[derive(Clone)]
pub struct CheckRule {
    pub category: ErrorCategory,
    pub name: &'static str,
    /// Whether the rule guards this primitive.
    pub applies: fn(&Primitive) -> bool,
    /// Message template for a site of this primitive.
    pub template: fn(&Primitive) -> String,
    pub probe: ProbeFn,
}

impl fmt::Debug for CheckRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckRule")
            .field("category", &self.category)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Ordered collection of check rules.
#[derive(Debug, Clone)]
pub struct CheckRegistry {
    rules: Vec<CheckRule>,
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CheckRegistry {
    /// Registry without any rules.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Division, NaN, bounds and user-assertion rules, in that order.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry
            .register(division_rule())
            .register(nan_rule())
            .register(bounds_rule())
            .register(user_rule());
        registry
    }

    /// Append a rule; it runs after every rule registered before it.
    pub fn register(&mut self, rule: CheckRule) -> &mut Self {
        debug!(rule = rule.name, category = %rule.category, "check rule registered");
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[CheckRule] {
        &self.rules
    }

    /// Enabled rules guarding `primitive`, in registration order.
    pub fn applicable<'a>(
        &'a self,
        primitive: &'a Primitive,
        enabled: ErrorSet,
    ) -> impl Iterator<Item = &'a CheckRule> + 'a {
        self.rules
            .iter()
            .filter(move |r| enabled.contains(r.category) && (r.applies)(primitive))
    }
}

// ============================================================================
// Built-in rules
// ============================================================================

fn division_rule() -> CheckRule {
    CheckRule {
        category: ErrorCategory::Div,
        name: "div",
        applies: |p| matches!(p, Primitive::Binary(crate::ir::BinaryOp::Div)),
        template: |_| "division by zero".to_string(),
        probe: |b, site| {
            let is_zero = b.eq(&site.inputs[1], 0.0);
            Probe {
                predicate: b.reduce_any(is_zero),
                payload: Vec::new(),
            }
        },
    }
}

fn nan_rule() -> CheckRule {
    CheckRule {
        category: ErrorCategory::Nan,
        name: "nan",
        applies: |p| match p {
            Primitive::Unary(op) => op.is_arithmetic(),
            Primitive::Binary(op) => op.is_arithmetic(),
            Primitive::Reduce(op) => op.is_arithmetic(),
            _ => false,
        },
        template: |p| format!("nan generated by primitive {}", p.name()),
        probe: |b, site| {
            let out_nan = b.unary(UnaryOp::IsNan, &site.outputs[0]);
            let out_nan = b.reduce_any(out_nan);

            let mut in_nan: Option<Atom> = None;
            for input in site.inputs {
                let this = match input {
                    Atom::Lit(a) if a.data().iter().any(|x| x.is_nan()) => Atom::scalar(1.0),
                    Atom::Lit(_) => continue,
                    Atom::Var(_) => {
                        let flags = b.is_nan(input);
                        b.reduce_any(flags)
                    }
                };
                in_nan = Some(match in_nan {
                    None => this,
                    Some(acc) => b.or(acc, this),
                });
            }

            let predicate = match in_nan {
                None => out_nan,
                Some(in_nan) => {
                    let clean = b.not(in_nan);
                    b.and(out_nan, clean)
                }
            };
            Probe {
                predicate,
                payload: Vec::new(),
            }
        },
    }
}

/// Template of the bounds message; placeholders index the payload
/// `[raw, normalized, axis, size]`.
pub const BOUNDS_TEMPLATE: &str =
    "out-of-bounds indexing: index {1} is out of bounds for axis {2} with size {3}";

fn bounds_rule() -> CheckRule {
    CheckRule {
        category: ErrorCategory::OutOfBounds,
        name: "oob",
        applies: |p| matches!(p, Primitive::Index(_) | Primitive::IndexUpdate { .. }),
        template: |_| BOUNDS_TEMPLATE.to_string(),
        probe: |b, site| {
            let (spec, operands) = match site.primitive {
                Primitive::Index(spec) => (spec.clone(), site.inputs.to_vec()),
                Primitive::IndexUpdate { spec, .. } => {
                    (spec.clone(), site.inputs[..site.inputs.len() - 1].to_vec())
                }
                _ => {
                    return Probe {
                        predicate: Atom::from(false),
                        payload: Vec::new(),
                    }
                }
            };
            let mut outs = b.push(Primitive::BoundsProbe(spec), operands, 5);
            let payload = outs.split_off(1);
            Probe {
                predicate: outs.remove(0),
                payload,
            }
        },
    }
}

fn user_rule() -> CheckRule {
    CheckRule {
        category: ErrorCategory::UserAssert,
        name: "user",
        applies: |p| matches!(p, Primitive::Assert { .. }),
        template: |p| match p {
            Primitive::Assert { message } => message.clone(),
            _ => String::new(),
        },
        probe: |b, site| {
            let holds = b.reduce_all(&site.inputs[0]);
            Probe {
                predicate: b.not(holds),
                payload: site.inputs[1..].to_vec(),
            }
        },
    }
}
