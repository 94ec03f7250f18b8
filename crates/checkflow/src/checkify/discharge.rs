//! Discharge and the surface API.
//!
//! [`checkify`] instruments a function and returns a [`Checked`] handle.
//! Calling it starts from an untriggered error and converts the final error
//! channel into an [`Error`] report; checked faults never surface as `Err`.
//! [`check`] and [`check_error`] are the eager host-level raises, and
//! [`FunctionBuilder::call_checked`] / [`FunctionBuilder::check_error`] embed
//! a checked function into another program and re-attach its error there.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::array::{format_number, Array};
use crate::interpret::{eval, EvalError};
use crate::ir::{Atom, Function, FunctionBuilder, Primitive, ValidationError};

use super::config::{CheckifyConfig, ReplicaErrors};
use super::error::{CheckFailure, CheckifyError, Error, ErrorSet, ErrorValue};
use super::instrument::{reachable_codes, Instrumenter, CHECKED_CALL};
use super::registry::CheckRegistry;
use super::schema::{render_template, ErrorSchema};

/// Instrument `func` for the `errors` categories with the default policy and
/// the built-in rules.
pub fn checkify(func: &Function, errors: impl Into<ErrorSet>) -> Result<Checked, CheckifyError> {
    let config = CheckifyConfig::new(errors);
    checkify_with(func, &config, &CheckRegistry::builtin())
}

/// Instrument `func` under an explicit policy and rule set.
#[instrument(skip_all, name = "checkify")]
pub fn checkify_with(
    func: &Function,
    config: &CheckifyConfig,
    registry: &CheckRegistry,
) -> Result<Checked, CheckifyError> {
    func.validate().map_err(CheckifyError::Invalid)?;

    let mut pass = Instrumenter::new(registry, config.errors, config.while_in_map);
    let checked = pass.instrument(func)?;
    let sites = pass.sites();
    let schema = pass.into_schema();
    debug!(
        errors = ?config.errors,
        sites,
        codes = schema.len(),
        width = schema.width(),
        "instrumented"
    );

    Ok(Checked {
        reachable: reachable_codes(&checked),
        func: Arc::new(checked),
        schema: Arc::new(schema),
        num_args: func.num_params(),
        num_outs: func.num_results(),
        batched: false,
        replica_errors: ReplicaErrors::PerReplica,
        replica_override: config.replica_errors,
    })
}

/// A checked function: `(flag, code, payload, args..) -> (flag, code, payload, outs..)`
/// together with its message table.
#[derive(Debug, Clone)]
pub struct Checked {
    func: Arc<Function>,
    schema: Arc<ErrorSchema>,
    num_args: usize,
    num_outs: usize,
    batched: bool,
    replica_errors: ReplicaErrors,
    replica_override: Option<ReplicaErrors>,
    reachable: Vec<u32>,
}

impl Checked {
    /// Run on `args` starting from an untriggered error.
    #[instrument(skip_all, name = "checked_call")]
    pub fn call(&self, args: &[Array]) -> Result<(Error, Vec<Array>), EvalError> {
        if args.len() != self.num_args {
            return Err(EvalError::Arity {
                context: "checked function",
                expected: self.num_args,
                got: args.len(),
            });
        }
        let mut inputs = ErrorValue::untriggered(self.schema.width())
            .into_channels()
            .to_vec();
        inputs.extend_from_slice(args);
        let mut outs = eval(&self.func, &inputs)?;
        let values = outs.split_off(3);
        let error = Error::from_outputs(
            &outs[0],
            &outs[1],
            &outs[2],
            Arc::clone(&self.schema),
            self.reachable.clone(),
        )?;
        let error = if self.batched && self.replica_errors == ReplicaErrors::Reduce {
            error.reduce()
        } else {
            error
        };
        debug!(triggered = error.is_triggered(), "discharged");
        Ok((error, values))
    }

    /// Templates of every check reachable in this function, in code order.
    pub fn messages(&self) -> Vec<String> {
        self.schema.templates(&self.reachable)
    }

    /// The instrumented function.
    pub fn function(&self) -> &Function {
        &self.func
    }

    pub fn schema(&self) -> &Arc<ErrorSchema> {
        &self.schema
    }

    pub fn num_args(&self) -> usize {
        self.num_args
    }

    pub fn replica_errors(&self) -> Option<ReplicaErrors> {
        self.batched.then_some(self.replica_errors)
    }

    /// Batch over axis 0 of the `mapped` arguments.
    ///
    /// Reports keep one error per replica unless the policy says `reduce`.
    pub fn vmap(&self, mapped: Vec<bool>) -> Result<Checked, CheckifyError> {
        let policy = self.replica_override.unwrap_or(ReplicaErrors::PerReplica);
        self.replicate("vmap", mapped, policy, |body, mapped| Primitive::Map { body, mapped })
    }

    /// Run one replica per shard in parallel; the leading axis of every
    /// mapped argument must equal `shards`.
    ///
    /// Reports collapse to the first triggered shard unless the policy says
    /// `per_replica`.
    pub fn shard(&self, shards: usize, mapped: Vec<bool>) -> Result<Checked, CheckifyError> {
        let policy = self.replica_override.unwrap_or(ReplicaErrors::Reduce);
        self.replicate("shard", mapped, policy, |body, mapped| Primitive::Partition {
            body,
            shards,
            mapped,
        })
    }

    fn replicate(
        &self,
        label: &'static str,
        mapped: Vec<bool>,
        policy: ReplicaErrors,
        construct: impl FnOnce(Arc<Function>, Vec<bool>) -> Primitive,
    ) -> Result<Checked, CheckifyError> {
        if mapped.len() != self.num_args {
            return Err(CheckifyError::Invalid(vec![ValidationError::Arity {
                primitive: label,
                detail: format!("{} mapped flags for {} arguments", mapped.len(), self.num_args),
            }]));
        }
        if !mapped.iter().any(|&m| m) {
            return Err(CheckifyError::Invalid(vec![ValidationError::Arity {
                primitive: label,
                detail: "no argument is mapped".to_string(),
            }]));
        }
        let mut flags = vec![false; 3];
        flags.extend(mapped);
        let primitive = construct(Arc::clone(&self.func), flags);
        let n_out = self.func.num_results();
        let wrapped = Function::build(self.func.num_params(), |b, params| {
            b.push(primitive, params.to_vec(), n_out)
        });
        debug!(label, policy = ?policy, "replicated checked function");
        Ok(Checked {
            func: Arc::new(wrapped),
            schema: Arc::clone(&self.schema),
            num_args: self.num_args,
            num_outs: self.num_outs,
            batched: true,
            replica_errors: policy,
            replica_override: self.replica_override,
            reachable: self.reachable.clone(),
        })
    }

    /// Forward-mode derivative of the checked function.
    ///
    /// Derivative rules of `custom_jvp` bodies are opaque, so checks that
    /// would occur inside them are not present in the result.
    pub fn jvp(&self) -> Result<CheckedJvp, CheckifyError> {
        let func = crate::ad::jvp(&self.func)?;
        let reachable = reachable_codes(&func);
        Ok(CheckedJvp {
            func: Arc::new(func),
            schema: Arc::clone(&self.schema),
            num_args: self.num_args,
            num_outs: self.num_outs,
            batched: self.batched,
            replica_errors: self.replica_errors,
            reachable,
        })
    }
}

/// Forward-mode derivative of a [`Checked`] function.
#[derive(Debug, Clone)]
pub struct CheckedJvp {
    func: Arc<Function>,
    schema: Arc<ErrorSchema>,
    num_args: usize,
    num_outs: usize,
    batched: bool,
    replica_errors: ReplicaErrors,
    reachable: Vec<u32>,
}

impl CheckedJvp {
    /// Returns the error, the primal outputs and their tangents.
    pub fn call(
        &self,
        primals: &[Array],
        tangents: &[Array],
    ) -> Result<(Error, Vec<Array>, Vec<Array>), EvalError> {
        for (context, given) in [
            ("checked derivative primals", primals.len()),
            ("checked derivative tangents", tangents.len()),
        ] {
            if given != self.num_args {
                return Err(EvalError::Arity {
                    context,
                    expected: self.num_args,
                    got: given,
                });
            }
        }
        let channels = ErrorValue::untriggered(self.schema.width()).into_channels();
        let mut inputs = channels.to_vec();
        inputs.extend_from_slice(primals);
        inputs.extend(channels.iter().map(|c| Array::zeros(c.shape())));
        inputs.extend_from_slice(tangents);

        let mut outs = eval(&self.func, &inputs)?;
        let n = 3 + self.num_outs;
        let mut touts = outs.split_off(n);
        let values = outs.split_off(3);
        let touts = touts.split_off(3.min(touts.len()));
        let error = Error::from_outputs(
            &outs[0],
            &outs[1],
            &outs[2],
            Arc::clone(&self.schema),
            self.reachable.clone(),
        )?;
        let error = if self.batched && self.replica_errors == ReplicaErrors::Reduce {
            error.reduce()
        } else {
            error
        };
        Ok((error, values, touts))
    }

    /// Templates of every check reachable in the derivative.
    pub fn messages(&self) -> Vec<String> {
        self.schema.templates(&self.reachable)
    }

    pub fn function(&self) -> &Function {
        &self.func
    }
}

// ============================================================================
// Embedding
// ============================================================================

/// Error channel of an embedded checked call.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorChannel {
    pub flag: Atom,
    pub code: Atom,
    pub payload: Atom,
}

impl FunctionBuilder {
    /// Call a checked function from a fresh error; returns its error channel
    /// and outputs. The error stays a plain value until
    /// [`check_error`](FunctionBuilder::check_error) re-attaches it.
    pub fn call_checked(&mut self, checked: &Checked, args: Vec<Atom>) -> (ErrorChannel, Vec<Atom>) {
        let mut inputs = vec![
            Atom::from(false),
            Atom::scalar(0.0),
            Atom::Lit(Array::zeros(&[checked.schema.width()])),
        ];
        inputs.extend(args);
        let mut outs = self.call_shared(
            Arc::clone(&checked.func),
            Some(CHECKED_CALL.to_string()),
            inputs,
        );
        let values = outs.split_off(3);
        let error = ErrorChannel {
            flag: outs[0].clone(),
            code: outs[1].clone(),
            payload: outs[2].clone(),
        };
        (error, values)
    }

    /// Raise the error captured from `checked` if it is triggered.
    ///
    /// Inside an instrumented function the error is merged into the enclosing
    /// one instead.
    pub fn check_error(&mut self, error: &ErrorChannel, checked: &Checked) {
        self.push(
            Primitive::Reraise {
                slots: checked.schema.slots().to_vec(),
            },
            vec![error.flag.clone(), error.code.clone(), error.payload.clone()],
            0,
        );
    }
}

// ============================================================================
// Eager raises
// ============================================================================

/// Fail with `message` unless `pred` is all true.
///
/// Format arguments are scalars rendered into `{}`/`{N}` placeholders.
pub fn check(pred: &Array, message: &str, args: &[Array]) -> Result<(), CheckFailure> {
    if pred.all() {
        return Ok(());
    }
    let args: Vec<String> = args
        .iter()
        .map(|a| match a.to_scalar() {
            Ok(x) => format_number(x),
            Err(_) => a.to_string(),
        })
        .collect();
    Err(CheckFailure {
        message: render_template(message, &args),
    })
}

/// Raise the report's message if it is triggered; otherwise do nothing.
pub fn check_error(error: &Error) -> Result<(), CheckFailure> {
    match error.get() {
        Some(message) => Err(CheckFailure { message }),
        None => Ok(()),
    }
}
