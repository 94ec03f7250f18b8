//! Instrumentation pass.
//!
//! Rewrites a function `args.. -> outs..` into its checked form
//! `(flag, code, payload, args..) -> (flag, code, payload, outs..)`. The
//! three leading values are the error channel. Every enabled check site
//! appends an `error_merge` right after the operation it guards; control
//! constructs are rewritten by the rules in [`super::rules`] so their bodies
//! thread the same channel.
//!
//! Message slots are allocated in program order while rewriting, so the
//! schema is complete (and the payload width fixed) once the pass returns.

use std::sync::Arc;

use tracing::trace;

use crate::array::Array;
use crate::ir::{Atom, Equation, Function, FunctionBuilder, Primitive, Var};

use super::config::WhileInMap;
use super::error::{CheckifyError, ErrorCategory, ErrorSet};
use super::registry::{CheckRegistry, CheckSite, Probe};
use super::schema::{ErrorSchema, MessageSlot};

pub(crate) type Result<T> = std::result::Result<T, CheckifyError>;

/// Name of the `call` that embeds an already checked function. Its body owns
/// a separate error channel and is left alone by later passes.
pub(crate) const CHECKED_CALL: &str = "checkify";

/// Error channel atoms inside a function being rewritten.
#[derive(Debug, Clone)]
pub(crate) struct Channel {
    pub(crate) flag: Atom,
    pub(crate) code: Atom,
    pub(crate) payload: Atom,
}

impl Channel {
    pub(crate) fn from_atoms(atoms: &[Atom]) -> Self {
        Self {
            flag: atoms[0].clone(),
            code: atoms[1].clone(),
            payload: atoms[2].clone(),
        }
    }

    pub(crate) fn atoms(&self) -> Vec<Atom> {
        vec![self.flag.clone(), self.code.clone(), self.payload.clone()]
    }
}

/// Variable mapping from an original function into its rewrite.
pub(crate) struct Env {
    slots: Vec<Option<Atom>>,
}

impl Env {
    pub(crate) fn new(var_count: u32) -> Self {
        Self {
            slots: vec![None; var_count as usize],
        }
    }

    pub(crate) fn bind(&mut self, var: Var, atom: Atom) -> Result<()> {
        let slot = self
            .slots
            .get_mut(var.0 as usize)
            .ok_or(CheckifyError::UnknownVariable(var))?;
        *slot = Some(atom);
        Ok(())
    }

    pub(crate) fn resolve(&self, atom: &Atom) -> Result<Atom> {
        match atom {
            Atom::Lit(_) => Ok(atom.clone()),
            Atom::Var(v) => self
                .slots
                .get(v.0 as usize)
                .and_then(Option::clone)
                .ok_or(CheckifyError::UnknownVariable(*v)),
        }
    }
}

/// Stateful rewriter; one instance per `checkify`.
pub(crate) struct Instrumenter<'a> {
    pub(super) registry: &'a CheckRegistry,
    pub(super) errors: ErrorSet,
    pub(super) while_in_map: WhileInMap,
    pub(super) schema: ErrorSchema,
    /// Check sites emitted so far.
    pub(super) sites: usize,
    /// Number of enclosing `map` bodies.
    pub(super) map_depth: usize,
}

impl<'a> Instrumenter<'a> {
    pub(crate) fn new(registry: &'a CheckRegistry, errors: ErrorSet, while_in_map: WhileInMap) -> Self {
        Self {
            registry,
            errors,
            while_in_map,
            schema: ErrorSchema::new(),
            sites: 0,
            map_depth: 0,
        }
    }

    pub(crate) fn into_schema(self) -> ErrorSchema {
        self.schema
    }

    pub(crate) fn sites(&self) -> usize {
        self.sites
    }

    /// Rewrite the outermost function.
    ///
    /// With nothing enabled the result only forwards the channel around a
    /// call of the original body, with assertions stripped.
    pub(crate) fn instrument(&mut self, func: &Function) -> Result<Function> {
        if self.errors.is_empty() {
            return Ok(bypass(func));
        }
        self.thread(func, 0, 0)
    }

    /// Rewrite `func`, inserting the channel parameters before parameter
    /// `at_param` and the channel results before result `at_result`.
    pub(crate) fn thread(&mut self, func: &Function, at_param: usize, at_result: usize) -> Result<Function> {
        let mut b = FunctionBuilder::new();
        let mut env = Env::new(func.var_count);
        let mut channel = None;
        for i in 0..=func.params.len() {
            if i == at_param {
                channel = Some(Channel {
                    flag: b.param(),
                    code: b.param(),
                    payload: b.param(),
                });
            }
            if let Some(&p) = func.params.get(i) {
                let atom = b.param();
                env.bind(p, atom)?;
            }
        }
        let mut channel = channel.ok_or_else(|| CheckifyError::Composition {
            combination: "instrumentation".to_string(),
            detail: format!("channel position {at_param} is past {} parameters", func.params.len()),
        })?;

        for eq in &func.equations {
            self.rewrite(&mut b, &mut env, &mut channel, eq)?;
        }

        let mut results = func
            .results
            .iter()
            .map(|r| env.resolve(r))
            .collect::<Result<Vec<_>>>()?;
        let at = at_result.min(results.len());
        for (k, atom) in channel.atoms().into_iter().enumerate() {
            results.insert(at + k, atom);
        }
        Ok(b.finish(results))
    }

    fn rewrite(
        &mut self,
        b: &mut FunctionBuilder,
        env: &mut Env,
        channel: &mut Channel,
        eq: &Equation,
    ) -> Result<()> {
        let inputs = eq
            .inputs
            .iter()
            .map(|a| env.resolve(a))
            .collect::<Result<Vec<_>>>()?;

        match &eq.primitive {
            Primitive::Assert { .. } => {
                if self.errors.contains(ErrorCategory::UserAssert) {
                    self.apply_rules(b, channel, &eq.primitive, &inputs, &[]);
                }
                Ok(())
            }
            Primitive::Reraise { slots } => {
                if self.errors.contains(ErrorCategory::UserAssert) {
                    self.reattach(b, channel, slots, inputs);
                }
                Ok(())
            }
            Primitive::Cond { .. }
            | Primitive::Scan { .. }
            | Primitive::While { .. }
            | Primitive::Map { .. }
            | Primitive::Partition { .. }
            | Primitive::Call { .. }
            | Primitive::CustomJvp { .. } => {
                let outs = self.thread_construct(b, channel, &eq.primitive, inputs, eq.outputs.len())?;
                for (var, atom) in eq.outputs.iter().zip(outs) {
                    env.bind(*var, atom)?;
                }
                Ok(())
            }
            _ => {
                let outs = b.push(eq.primitive.clone(), inputs.clone(), eq.outputs.len());
                for (var, atom) in eq.outputs.iter().zip(&outs) {
                    env.bind(*var, atom.clone())?;
                }
                self.apply_rules(b, channel, &eq.primitive, &inputs, &outs);
                Ok(())
            }
        }
    }

    /// Emit every enabled rule guarding `primitive`.
    fn apply_rules(
        &mut self,
        b: &mut FunctionBuilder,
        channel: &mut Channel,
        primitive: &Primitive,
        inputs: &[Atom],
        outputs: &[Atom],
    ) {
        let site = CheckSite {
            primitive,
            inputs,
            outputs,
        };
        let registry = self.registry;
        for rule in registry.applicable(primitive, self.errors) {
            let probe = (rule.probe)(b, &site);
            let template = (rule.template)(primitive);
            let (code, offset) = self.schema.push(rule.category, template, probe.payload.len());
            let payload = capture(b, &probe);
            trace!(rule = rule.name, primitive = primitive.name(), code, "check site");
            self.merge(
                b,
                channel,
                Primitive::ErrorMerge {
                    base: code,
                    span: 1,
                    offset,
                },
                probe.predicate,
                Atom::scalar(0.0),
                payload,
            );
        }
    }

    /// Re-attach a captured error whose message table is `slots`.
    fn reattach(&mut self, b: &mut FunctionBuilder, channel: &mut Channel, slots: &[MessageSlot], inputs: Vec<Atom>) {
        let (base, offset) = self.schema.append(slots);
        let first = b.push(Primitive::FirstWhere, inputs, 3);
        trace!(slots = slots.len(), base, "reattach captured error");
        self.merge(
            b,
            channel,
            Primitive::ErrorMerge {
                base,
                span: slots.len() as u32,
                offset,
            },
            first[0].clone(),
            first[1].clone(),
            first[2].clone(),
        );
    }

    /// Merge a candidate error into the channel.
    pub(super) fn merge(
        &mut self,
        b: &mut FunctionBuilder,
        channel: &mut Channel,
        merge: Primitive,
        pred: Atom,
        code: Atom,
        payload: Atom,
    ) {
        let mut inputs = channel.atoms();
        inputs.extend([pred, code, payload]);
        let outs = b.push(merge, inputs, 3);
        *channel = Channel::from_atoms(&outs);
        self.sites += 1;
    }
}

/// Payload vector of a probe, packed only on the faulting branch so a site
/// that holds never reads its format arguments.
fn capture(b: &mut FunctionBuilder, probe: &Probe) -> Atom {
    let width = probe.payload.len();
    if width == 0 {
        return Atom::Lit(Array::from_vec(Vec::new()));
    }
    let faulted = Function::build(width, |b, args| vec![b.pack(args.to_vec())]);
    let held = Function::build(width, |_, _| vec![Atom::Lit(Array::zeros(&[width]))]);
    let mut outs = b.cond(probe.predicate.clone(), faulted, held, probe.payload.clone());
    outs.remove(0)
}

/// Checked form of `func` that forwards the channel untouched.
fn bypass(func: &Function) -> Function {
    let body = Arc::new(strip_checks(func));
    Function::build(3 + func.num_params(), |b, params| {
        let mut results = params[..3].to_vec();
        results.extend(b.call_shared(body, None, params[3..].to_vec()));
        results
    })
}

/// Remove `assert` and `reraise` equations, recursively.
pub(crate) fn strip_checks(func: &Function) -> Function {
    let equations = func
        .equations
        .iter()
        .filter(|eq| !matches!(eq.primitive, Primitive::Assert { .. } | Primitive::Reraise { .. }))
        .map(|eq| Equation {
            primitive: map_subfunctions(&eq.primitive, strip_checks),
            ..eq.clone()
        })
        .collect();
    Function {
        equations,
        ..func.clone()
    }
}

/// Rebuild a primitive with every nested function passed through `f`.
pub(crate) fn map_subfunctions(primitive: &Primitive, f: impl Fn(&Function) -> Function) -> Primitive {
    let g = |body: &Arc<Function>| Arc::new(f(body.as_ref()));
    match primitive {
        Primitive::Cond { branches } => Primitive::Cond {
            branches: branches.iter().map(g).collect(),
        },
        Primitive::Scan {
            body,
            length,
            num_consts,
            num_carry,
        } => Primitive::Scan {
            body: g(body),
            length: *length,
            num_consts: *num_consts,
            num_carry: *num_carry,
        },
        Primitive::While {
            cond,
            body,
            cond_consts,
            body_consts,
        } => Primitive::While {
            cond: g(cond),
            body: g(body),
            cond_consts: *cond_consts,
            body_consts: *body_consts,
        },
        Primitive::Map { body, mapped } => Primitive::Map {
            body: g(body),
            mapped: mapped.clone(),
        },
        Primitive::Partition {
            body,
            shards,
            mapped,
        } => Primitive::Partition {
            body: g(body),
            shards: *shards,
            mapped: mapped.clone(),
        },
        Primitive::Call { body, name } => Primitive::Call {
            body: g(body),
            name: name.clone(),
        },
        Primitive::CustomJvp { primal, rule } => Primitive::CustomJvp {
            primal: g(primal),
            rule: g(rule),
        },
        other => other.clone(),
    }
}

/// Codes an instrumented function can report, ascending.
pub(crate) fn reachable_codes(func: &Function) -> Vec<u32> {
    fn walk(func: &Function, codes: &mut Vec<u32>) {
        for eq in &func.equations {
            if let Primitive::ErrorMerge { base, span, .. } = eq.primitive {
                codes.extend(base..base + span);
            }
            if let Primitive::Call { name: Some(name), .. } = &eq.primitive {
                if name == CHECKED_CALL {
                    continue;
                }
            }
            for sub in eq.primitive.subfunctions() {
                walk(sub, codes);
            }
        }
    }
    let mut codes = Vec::new();
    walk(func, &mut codes);
    codes.sort_unstable();
    codes.dedup();
    codes
}
