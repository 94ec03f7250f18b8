//! Control-flow threading rules.
//!
//! Each construct gets its nested bodies instrumented and its own state
//! extended with the error channel:
//!
//! | Construct | Channel placement |
//! |---|---|
//! | `cond` | after the branch index, before the results |
//! | `scan` | ahead of the carry |
//! | `while` | in the carry, next to the carried predicate |
//! | `map`, `partition` | broadcast in, stacked out, reduced with `first_where` |
//! | `call` | ahead of the arguments and results |
//! | `custom_jvp` | primal instrumented, rule passes the channel through |

use std::sync::Arc;

use tracing::trace;

use crate::ir::{Atom, Function, FunctionBuilder, Primitive, ValidationError};

use super::config::WhileInMap;
use super::error::CheckifyError;
use super::instrument::{Channel, Instrumenter, Result, CHECKED_CALL};

impl Instrumenter<'_> {
    /// Rewrite one control construct; returns the atoms bound to its original
    /// outputs and advances `channel` past it.
    pub(super) fn thread_construct(
        &mut self,
        b: &mut FunctionBuilder,
        channel: &mut Channel,
        primitive: &Primitive,
        inputs: Vec<Atom>,
        n_out: usize,
    ) -> Result<Vec<Atom>> {
        match primitive {
            Primitive::Cond { branches } => {
                let (index, operands) = inputs
                    .split_first()
                    .ok_or_else(|| malformed(primitive.name(), "missing branch index"))?;
                let branches = branches
                    .iter()
                    .map(|branch| self.thread(branch, 0, 0).map(Arc::new))
                    .collect::<Result<Vec<_>>>()?;
                trace!(branches = branches.len(), "thread cond");
                let mut ins = vec![index.clone()];
                ins.extend(channel.atoms());
                ins.extend_from_slice(operands);
                Ok(emit(b, channel, Primitive::Cond { branches }, ins, n_out))
            }

            Primitive::Scan {
                body,
                length,
                num_consts,
                num_carry,
            } => {
                if inputs.len() < num_consts + num_carry {
                    return Err(malformed(primitive.name(), "fewer inputs than consts and carry"));
                }
                let body = self.thread(body, *num_consts, 0)?;
                trace!(length, num_consts, num_carry, "thread scan");
                let (consts, rest) = inputs.split_at(*num_consts);
                let mut ins = consts.to_vec();
                ins.extend(channel.atoms());
                ins.extend_from_slice(rest);
                let scan = Primitive::Scan {
                    body: Arc::new(body),
                    length: *length,
                    num_consts: *num_consts,
                    num_carry: num_carry + 3,
                };
                Ok(emit(b, channel, scan, ins, n_out))
            }

            Primitive::While {
                cond,
                body,
                cond_consts,
                body_consts,
            } => self.thread_while(b, channel, cond, body, *cond_consts, *body_consts, inputs),

            Primitive::Map { body, mapped } => {
                self.map_depth += 1;
                let threaded = self.thread(body, 0, 0);
                self.map_depth -= 1;
                let body = threaded?;
                trace!(depth = self.map_depth, "thread map");
                let map = Primitive::Map {
                    body: Arc::new(body),
                    mapped: replicated(mapped),
                };
                Ok(self.emit_replicated(b, channel, map, inputs, n_out))
            }

            Primitive::Partition {
                body,
                shards,
                mapped,
            } => {
                let body = self.thread(body, 0, 0)?;
                trace!(shards, "thread partition");
                let partition = Primitive::Partition {
                    body: Arc::new(body),
                    shards: *shards,
                    mapped: replicated(mapped),
                };
                Ok(self.emit_replicated(b, channel, partition, inputs, n_out))
            }

            Primitive::Call { name: Some(name), .. } if name == CHECKED_CALL => {
                trace!("pass checked call through");
                Ok(b.push(primitive.clone(), inputs, n_out))
            }

            Primitive::Call { body, name } => {
                let body = self.thread(body, 0, 0)?;
                trace!(name = name.as_deref().unwrap_or("<anonymous>"), "thread call");
                let mut ins = channel.atoms();
                ins.extend(inputs);
                let call = Primitive::Call {
                    body: Arc::new(body),
                    name: name.clone(),
                };
                Ok(emit(b, channel, call, ins, n_out))
            }

            Primitive::CustomJvp { primal, rule } => {
                let checked_primal = self.thread(primal, 0, 0)?;
                let lifted = lift_rule(rule, primal.num_params(), primal.num_results());
                trace!("thread custom_jvp");
                let mut ins = channel.atoms();
                ins.extend(inputs);
                let custom = Primitive::CustomJvp {
                    primal: Arc::new(checked_primal),
                    rule: Arc::new(lifted),
                };
                Ok(emit(b, channel, custom, ins, n_out))
            }

            other => Err(malformed(other.name(), "not a control construct")),
        }
    }

    /// Thread a `while` loop.
    ///
    /// The rewritten loop carries `(pred, flag, code, payload, carry..)`. The
    /// checked predicate runs once before the loop and again after every
    /// checked body step, so each predicate evaluation is checked exactly
    /// once, including the terminating one. The loop's own condition only
    /// reads the carried predicate.
    #[allow(clippy::too_many_arguments)]
    fn thread_while(
        &mut self,
        b: &mut FunctionBuilder,
        channel: &mut Channel,
        cond: &Function,
        body: &Function,
        cond_consts: usize,
        body_consts: usize,
        inputs: Vec<Atom>,
    ) -> Result<Vec<Atom>> {
        if inputs.len() < cond_consts + body_consts {
            return Err(malformed("while", "fewer inputs than consts"));
        }
        let sites_before = self.sites;
        let checked_cond = Arc::new(self.thread(cond, cond_consts, 0)?);
        let checked_body = Arc::new(self.thread(body, body_consts, 0)?);
        if self.map_depth > 0 && self.sites > sites_before && self.while_in_map == WhileInMap::Reject {
            return Err(CheckifyError::Composition {
                combination: "checkify-of-map-of-while".to_string(),
                detail: "a while loop with enabled checks inside a map may run masked \
                         iterations; set whileInMap: masked to run replicas independently"
                    .to_string(),
            });
        }

        let (cc, rest) = inputs.split_at(cond_consts);
        let (bc, init) = rest.split_at(body_consts);
        let n_carry = init.len();
        trace!(cond_consts, body_consts, n_carry, "thread while");

        // Checked predicate on the initial carry.
        let mut args = cc.to_vec();
        args.extend(channel.atoms());
        args.extend_from_slice(init);
        let first = b.call_shared(Arc::clone(&checked_cond), None, args);

        let carried_pred = Function::build(4 + n_carry, |_, params| vec![params[0].clone()]);
        let step = Function::build(body_consts + cond_consts + 4 + n_carry, |b, params| {
            let (bc, rest) = params.split_at(body_consts);
            let (cc, state) = rest.split_at(cond_consts);
            let mut args = bc.to_vec();
            args.extend_from_slice(&state[1..]);
            let stepped = b.call_shared(checked_body, None, args);
            let mut args = cc.to_vec();
            args.extend_from_slice(&stepped);
            let checked = b.call_shared(checked_cond, None, args);
            let mut results = vec![checked[3].clone()];
            results.extend_from_slice(&checked[..3]);
            results.extend_from_slice(&stepped[3..]);
            results
        });

        let mut ins = bc.to_vec();
        ins.extend_from_slice(cc);
        ins.push(first[3].clone());
        ins.extend_from_slice(&first[..3]);
        ins.extend_from_slice(init);
        let mut outs = b.push(
            Primitive::While {
                cond: Arc::new(carried_pred),
                body: Arc::new(step),
                cond_consts: 0,
                body_consts: body_consts + cond_consts,
            },
            ins,
            4 + n_carry,
        );
        let results = outs.split_off(4);
        *channel = Channel::from_atoms(&outs[1..]);
        Ok(results)
    }

    /// Emit a replicated construct whose body returns the channel first, then
    /// fold the stacked per-replica errors into `channel`.
    fn emit_replicated(
        &mut self,
        b: &mut FunctionBuilder,
        channel: &mut Channel,
        primitive: Primitive,
        inputs: Vec<Atom>,
        n_out: usize,
    ) -> Vec<Atom> {
        let mut ins = channel.atoms();
        ins.extend(inputs);
        let mut outs = b.push(primitive, ins, 3 + n_out);
        let results = outs.split_off(3);
        let first = b.push(Primitive::FirstWhere, outs, 3);
        self.merge(
            b,
            channel,
            Primitive::ErrorMerge {
                base: 0,
                span: 0,
                offset: 0,
            },
            first[0].clone(),
            first[1].clone(),
            first[2].clone(),
        );
        results
    }
}

/// Push `primitive` with `3 + n_out` outputs; the first three become the new
/// channel.
fn emit(
    b: &mut FunctionBuilder,
    channel: &mut Channel,
    primitive: Primitive,
    inputs: Vec<Atom>,
    n_out: usize,
) -> Vec<Atom> {
    let mut outs = b.push(primitive, inputs, 3 + n_out);
    let results = outs.split_off(3);
    *channel = Channel::from_atoms(&outs);
    results
}

/// Mapped flags with the channel prepended; the channel is never mapped.
fn replicated(mapped: &[bool]) -> Vec<bool> {
    let mut flags = vec![false; 3];
    flags.extend_from_slice(mapped);
    flags
}

/// Derivative rule of an instrumented `custom_jvp`.
///
/// Maps `(flag, code, payload, args.., t_flag, t_code, t_payload, t_args..)`
/// to `(flag, code, payload, outs.., 0, 0, 0, t_outs..)`. The original rule is
/// called as an opaque body, so nothing inside it is checked.
fn lift_rule(rule: &Arc<Function>, num_args: usize, num_outs: usize) -> Function {
    let rule = Arc::clone(rule);
    Function::build(2 * (3 + num_args), |b, params| {
        let (primals, tangents) = params.split_at(3 + num_args);
        let mut args = primals[3..].to_vec();
        args.extend_from_slice(&tangents[3..]);
        let outs = b.call_shared(rule, None, args);
        let (outs, touts) = outs.split_at(num_outs.min(outs.len()));

        let mut results = primals[..3].to_vec();
        results.extend_from_slice(outs);
        for channel in &primals[..3] {
            let zero = b.zeros_like(channel);
            results.push(zero);
        }
        results.extend_from_slice(touts);
        results
    })
}

fn malformed(primitive: &'static str, detail: &str) -> CheckifyError {
    CheckifyError::Invalid(vec![ValidationError::Arity {
        primitive,
        detail: detail.to_string(),
    }])
}
