//! Tracing-style function construction.
//!
//! [`FunctionBuilder`] hands out fresh variables and records equations in
//! program order. The helpers mirror the operations a numerical program
//! would call; each returns the atoms bound to the equation outputs.

use std::sync::Arc;

use crate::array::Array;

use super::types::{
    Atom, BinaryOp, Equation, Function, IndexSpec, Primitive, ReduceOp, UnaryOp, UpdateMode, Var,
};

/// Incremental builder for a [`Function`].
#[derive(Debug, Default)]
pub struct FunctionBuilder {
    params: Vec<Var>,
    equations: Vec<Equation>,
    next: u32,
}

impl Function {
    /// Build a function of `num_params` parameters from a tracing closure.
    pub fn build(
        num_params: usize,
        trace: impl FnOnce(&mut FunctionBuilder, &[Atom]) -> Vec<Atom>,
    ) -> Function {
        let mut b = FunctionBuilder::new();
        let params: Vec<Atom> = (0..num_params).map(|_| b.param()).collect();
        let results = trace(&mut b, &params);
        b.finish(results)
    }
}

impl FunctionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh variable.
    pub fn fresh(&mut self) -> Var {
        let v = Var(self.next);
        self.next += 1;
        v
    }

    /// Declare the next parameter.
    pub fn param(&mut self) -> Atom {
        let v = self.fresh();
        self.params.push(v);
        Atom::Var(v)
    }

    /// Record an equation with `num_outputs` fresh outputs.
    pub fn push(&mut self, primitive: Primitive, inputs: Vec<Atom>, num_outputs: usize) -> Vec<Atom> {
        let outputs: Vec<Var> = (0..num_outputs).map(|_| self.fresh()).collect();
        self.equations.push(Equation {
            primitive,
            inputs,
            outputs: outputs.clone(),
        });
        outputs.into_iter().map(Atom::Var).collect()
    }

    /// Record a single-output equation.
    pub fn push1(&mut self, primitive: Primitive, inputs: Vec<Atom>) -> Atom {
        let v = self.fresh();
        self.equations.push(Equation {
            primitive,
            inputs,
            outputs: vec![v],
        });
        Atom::Var(v)
    }

    /// Record an equation whose outputs were allocated by the caller.
    pub fn push_equation(&mut self, equation: Equation) {
        self.equations.push(equation);
    }

    pub fn finish(self, results: Vec<Atom>) -> Function {
        Function {
            params: self.params,
            equations: self.equations,
            results,
            var_count: self.next,
        }
    }

    // === Elementwise ===

    pub fn unary(&mut self, op: UnaryOp, x: impl Into<Atom>) -> Atom {
        self.push1(Primitive::Unary(op), vec![x.into()])
    }

    pub fn binary(&mut self, op: BinaryOp, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.push1(Primitive::Binary(op), vec![a.into(), b.into()])
    }

    pub fn neg(&mut self, x: impl Into<Atom>) -> Atom {
        self.unary(UnaryOp::Neg, x)
    }

    pub fn sin(&mut self, x: impl Into<Atom>) -> Atom {
        self.unary(UnaryOp::Sin, x)
    }

    pub fn cos(&mut self, x: impl Into<Atom>) -> Atom {
        self.unary(UnaryOp::Cos, x)
    }

    pub fn tanh(&mut self, x: impl Into<Atom>) -> Atom {
        self.unary(UnaryOp::Tanh, x)
    }

    pub fn exp(&mut self, x: impl Into<Atom>) -> Atom {
        self.unary(UnaryOp::Exp, x)
    }

    pub fn log(&mut self, x: impl Into<Atom>) -> Atom {
        self.unary(UnaryOp::Log, x)
    }

    pub fn sqrt(&mut self, x: impl Into<Atom>) -> Atom {
        self.unary(UnaryOp::Sqrt, x)
    }

    pub fn abs(&mut self, x: impl Into<Atom>) -> Atom {
        self.unary(UnaryOp::Abs, x)
    }

    pub fn not(&mut self, x: impl Into<Atom>) -> Atom {
        self.unary(UnaryOp::Not, x)
    }

    pub fn is_nan(&mut self, x: impl Into<Atom>) -> Atom {
        self.unary(UnaryOp::IsNan, x)
    }

    pub fn add(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::Add, a, b)
    }

    pub fn sub(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::Mul, a, b)
    }

    pub fn div(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::Div, a, b)
    }

    pub fn pow(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::Pow, a, b)
    }

    pub fn max(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::Max, a, b)
    }

    pub fn min(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::Min, a, b)
    }

    pub fn lt(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::Lt, a, b)
    }

    pub fn le(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::Le, a, b)
    }

    pub fn gt(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::Gt, a, b)
    }

    pub fn ge(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::Ge, a, b)
    }

    pub fn eq(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::Eq, a, b)
    }

    pub fn ne(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::Ne, a, b)
    }

    pub fn and(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::And, a, b)
    }

    pub fn or(&mut self, a: impl Into<Atom>, b: impl Into<Atom>) -> Atom {
        self.binary(BinaryOp::Or, a, b)
    }

    pub fn select(
        &mut self,
        pred: impl Into<Atom>,
        on_true: impl Into<Atom>,
        on_false: impl Into<Atom>,
    ) -> Atom {
        self.push1(
            Primitive::Select,
            vec![pred.into(), on_true.into(), on_false.into()],
        )
    }

    pub fn zeros_like(&mut self, x: impl Into<Atom>) -> Atom {
        self.push1(Primitive::ZerosLike, vec![x.into()])
    }

    /// Pack scalars into a vector.
    pub fn pack(&mut self, items: Vec<Atom>) -> Atom {
        self.push1(Primitive::Pack, items)
    }

    // === Reductions ===

    pub fn reduce(&mut self, op: ReduceOp, x: impl Into<Atom>) -> Atom {
        self.push1(Primitive::Reduce(op), vec![x.into()])
    }

    pub fn reduce_sum(&mut self, x: impl Into<Atom>) -> Atom {
        self.reduce(ReduceOp::Sum, x)
    }

    pub fn reduce_all(&mut self, x: impl Into<Atom>) -> Atom {
        self.reduce(ReduceOp::All, x)
    }

    pub fn reduce_any(&mut self, x: impl Into<Atom>) -> Atom {
        self.reduce(ReduceOp::Any, x)
    }

    // === Indexing ===

    /// General indexing: `operand[spec]` with one index operand per taken axis.
    pub fn index(&mut self, operand: impl Into<Atom>, spec: IndexSpec, indices: Vec<Atom>) -> Atom {
        let mut inputs = vec![operand.into()];
        inputs.extend(indices);
        self.push1(Primitive::Index(spec), inputs)
    }

    /// `operand[i]` along axis 0.
    pub fn take(&mut self, operand: impl Into<Atom>, i: impl Into<Atom>) -> Atom {
        self.index(operand, IndexSpec::leading(), vec![i.into()])
    }

    /// `operand.at[spec].<mode>(updates)`.
    pub fn index_update(
        &mut self,
        operand: impl Into<Atom>,
        spec: IndexSpec,
        indices: Vec<Atom>,
        updates: impl Into<Atom>,
        mode: UpdateMode,
    ) -> Atom {
        let mut inputs = vec![operand.into()];
        inputs.extend(indices);
        inputs.push(updates.into());
        self.push1(Primitive::IndexUpdate { spec, mode }, inputs)
    }

    // === Assertions ===

    /// Record a user assertion: fail with `message` unless `pred` is all true.
    ///
    /// `message` may reference `args` with `{}` or `{N}` placeholders. Format
    /// arguments are read only when the check fails, and must then be
    /// scalars; a failing check with a non-scalar argument is a shape error,
    /// checked or not. Evaluated without instrumentation, a false predicate
    /// aborts evaluation immediately.
    pub fn check(&mut self, pred: impl Into<Atom>, message: impl Into<String>, args: Vec<Atom>) {
        let mut inputs = vec![pred.into()];
        inputs.extend(args);
        self.push(
            Primitive::Assert {
                message: message.into(),
            },
            inputs,
            0,
        );
    }

    // === Control flow ===

    /// `on_true(operands)` if `pred` else `on_false(operands)`.
    pub fn cond(
        &mut self,
        pred: impl Into<Atom>,
        on_true: Function,
        on_false: Function,
        operands: Vec<Atom>,
    ) -> Vec<Atom> {
        self.switch(pred, vec![on_false, on_true], operands)
    }

    /// Run `branches[index]` on `operands`; the index is clamped to range.
    pub fn switch(
        &mut self,
        index: impl Into<Atom>,
        branches: Vec<Function>,
        operands: Vec<Atom>,
    ) -> Vec<Atom> {
        let n_out = branches.first().map_or(0, Function::num_results);
        let mut inputs = vec![index.into()];
        inputs.extend(operands);
        self.push(
            Primitive::Cond {
                branches: branches.into_iter().map(Arc::new).collect(),
            },
            inputs,
            n_out,
        )
    }

    /// Fixed-trip-count loop. `body: (consts.., carry.., x..) -> (carry.., y..)`.
    ///
    /// Returns the final carry followed by the stacked per-step outputs.
    pub fn scan(
        &mut self,
        body: Function,
        length: usize,
        consts: Vec<Atom>,
        init: Vec<Atom>,
        xs: Vec<Atom>,
    ) -> Vec<Atom> {
        let n_out = body.num_results();
        let primitive = Primitive::Scan {
            body: Arc::new(body),
            length,
            num_consts: consts.len(),
            num_carry: init.len(),
        };
        let mut inputs = consts;
        inputs.extend(init);
        inputs.extend(xs);
        self.push(primitive, inputs, n_out)
    }

    /// Dynamic loop. `cond: (cond_consts.., carry..) -> pred`,
    /// `body: (body_consts.., carry..) -> carry..`.
    pub fn while_loop(
        &mut self,
        cond: Function,
        body: Function,
        cond_consts: Vec<Atom>,
        body_consts: Vec<Atom>,
        init: Vec<Atom>,
    ) -> Vec<Atom> {
        let n_out = init.len();
        let primitive = Primitive::While {
            cond: Arc::new(cond),
            body: Arc::new(body),
            cond_consts: cond_consts.len(),
            body_consts: body_consts.len(),
        };
        let mut inputs = cond_consts;
        inputs.extend(body_consts);
        inputs.extend(init);
        self.push(primitive, inputs, n_out)
    }

    /// Batched map over axis 0 of the args flagged in `mapped`.
    pub fn map(&mut self, body: Function, mapped: Vec<bool>, args: Vec<Atom>) -> Vec<Atom> {
        let n_out = body.num_results();
        self.push(
            Primitive::Map {
                body: Arc::new(body),
                mapped,
            },
            args,
            n_out,
        )
    }

    /// Partitioned execution: one replica per shard, run in parallel.
    pub fn partition(
        &mut self,
        body: Function,
        shards: usize,
        mapped: Vec<bool>,
        args: Vec<Atom>,
    ) -> Vec<Atom> {
        let n_out = body.num_results();
        self.push(
            Primitive::Partition {
                body: Arc::new(body),
                shards,
                mapped,
            },
            args,
            n_out,
        )
    }

    /// Nested call.
    pub fn call(&mut self, body: Function, args: Vec<Atom>) -> Vec<Atom> {
        self.call_shared(Arc::new(body), None, args)
    }

    pub(crate) fn call_shared(
        &mut self,
        body: Arc<Function>,
        name: Option<String>,
        args: Vec<Atom>,
    ) -> Vec<Atom> {
        let n_out = body.num_results();
        self.push(Primitive::Call { body, name }, args, n_out)
    }

    /// Function with a custom derivative rule.
    pub fn custom_jvp(&mut self, primal: Function, rule: Function, args: Vec<Atom>) -> Vec<Atom> {
        let n_out = primal.num_results();
        self.push(
            Primitive::CustomJvp {
                primal: Arc::new(primal),
                rule: Arc::new(rule),
            },
            args,
            n_out,
        )
    }

    /// Literal array operand.
    pub fn lit(&self, value: Array) -> Atom {
        Atom::Lit(value)
    }
}
