//! Program IR type definitions.
//!
//! A [`Function`] is a closed, straight-line list of [`Equation`]s in SSA
//! form. Structured control flow is expressed by primitives that carry their
//! own nested functions (`cond`, `scan`, `while`, `map`, `partition`, `call`,
//! `custom_jvp`), so every transformation is a recursive rewrite over one
//! closed [`Primitive`] set.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::array::Array;
use crate::checkify::schema::MessageSlot;

/// Function-local SSA value.
///
/// Each variable is defined exactly once, either as a parameter or as an
/// equation output, and may be used any number of times afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Var(pub u32);

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// An equation operand: a variable or an inline literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Atom {
    Var(Var),
    Lit(Array),
}

impl Atom {
    /// Scalar literal.
    pub fn scalar(value: f64) -> Self {
        Atom::Lit(Array::scalar(value))
    }

    pub fn as_var(&self) -> Option<Var> {
        match self {
            Atom::Var(v) => Some(*v),
            Atom::Lit(_) => None,
        }
    }

    pub fn as_lit(&self) -> Option<&Array> {
        match self {
            Atom::Lit(a) => Some(a),
            Atom::Var(_) => None,
        }
    }
}

impl From<Var> for Atom {
    fn from(v: Var) -> Self {
        Atom::Var(v)
    }
}

impl From<&Atom> for Atom {
    fn from(a: &Atom) -> Self {
        a.clone()
    }
}

impl From<f64> for Atom {
    fn from(value: f64) -> Self {
        Atom::scalar(value)
    }
}

impl From<bool> for Atom {
    fn from(value: bool) -> Self {
        Atom::Lit(Array::from_bool(value))
    }
}

impl From<Array> for Atom {
    fn from(value: Array) -> Self {
        Atom::Lit(value)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Var(v) => write!(f, "{v}"),
            Atom::Lit(a) => write!(f, "{a}"),
        }
    }
}

// ============================================================================
// Operators
// ============================================================================

/// Elementwise unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Sin,
    Cos,
    Tanh,
    Exp,
    Log,
    Sqrt,
    Abs,
    Not,
    IsNan,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Abs => "abs",
            UnaryOp::Not => "not",
            UnaryOp::IsNan => "is_nan",
        }
    }

    /// Whether the operator computes floating-point values (as opposed to
    /// predicates).
    pub fn is_arithmetic(self) -> bool {
        !matches!(self, UnaryOp::Not | UnaryOp::IsNan)
    }
}

/// Elementwise binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Max,
    Min,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
            BinaryOp::Lt => "lt",
            BinaryOp::Le => "le",
            BinaryOp::Gt => "gt",
            BinaryOp::Ge => "ge",
            BinaryOp::Eq => "eq",
            BinaryOp::Ne => "ne",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Sub
                | BinaryOp::Mul
                | BinaryOp::Div
                | BinaryOp::Pow
                | BinaryOp::Max
                | BinaryOp::Min
        )
    }
}

/// Reductions over every axis, producing a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
    All,
    Any,
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Sum => "reduce_sum",
            ReduceOp::Max => "reduce_max",
            ReduceOp::Min => "reduce_min",
            ReduceOp::All => "reduce_all",
            ReduceOp::Any => "reduce_any",
        }
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(self, ReduceOp::Sum | ReduceOp::Max | ReduceOp::Min)
    }
}

// ============================================================================
// Indexing
// ============================================================================

/// How one operand axis participates in an index expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisIndex {
    /// Indexed by an integer array operand.
    Take,
    /// Kept whole (`:`).
    Full,
}

/// Index expression over an operand: one entry per leading axis.
///
/// Axes past the end of `axes` are implicitly [`AxisIndex::Full`]. Every
/// `Take` axis consumes one index operand, in axis order. Index operands
/// broadcast together; the broadcast shape replaces the taken axes in place
/// when they are adjacent and moves to the front otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSpec {
    pub axes: Vec<AxisIndex>,
}

impl IndexSpec {
    /// `x[i]`
    pub fn leading() -> Self {
        Self {
            axes: vec![AxisIndex::Take],
        }
    }

    /// `x[i0, i1, ..]` over the first `n` axes.
    pub fn take(n: usize) -> Self {
        Self {
            axes: vec![AxisIndex::Take; n],
        }
    }

    pub fn new(axes: Vec<AxisIndex>) -> Self {
        Self { axes }
    }

    /// Number of index operands this expression consumes.
    pub fn num_indices(&self) -> usize {
        self.axes.iter().filter(|a| **a == AxisIndex::Take).count()
    }
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self
            .axes
            .iter()
            .map(|a| match a {
                AxisIndex::Take => "i",
                AxisIndex::Full => ":",
            })
            .collect();
        write!(f, "[{}]", parts.join(","))
    }
}

/// Combination applied by an indexed update (`x.at[i].set(..)` and friends).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    Set,
    Add,
    Mul,
    Div,
    Pow,
    Min,
    Max,
}

impl UpdateMode {
    pub fn apply(self, old: f64, update: f64) -> f64 {
        match self {
            UpdateMode::Set => update,
            UpdateMode::Add => old + update,
            UpdateMode::Mul => old * update,
            UpdateMode::Div => old / update,
            UpdateMode::Pow => old.powf(update),
            UpdateMode::Min => crate::interpret::ops::nan_min(old, update),
            UpdateMode::Max => crate::interpret::ops::nan_max(old, update),
        }
    }
}

// ============================================================================
// Primitives
// ============================================================================

/// The closed set of operations an [`Equation`] can apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Primitive {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Reduce(ReduceOp),
    /// `(pred, on_true, on_false) -> out`
    Select,
    ZerosLike,
    /// Scalars to a vector.
    Pack,
    /// `(operand, indices..) -> out`; out-of-range indices clamp.
    Index(IndexSpec),
    /// `(operand, indices.., updates) -> out`; out-of-range updates are dropped.
    IndexUpdate { spec: IndexSpec, mode: UpdateMode },

    // === Error channel ===
    /// `(pred, args..) -> ()`: raise `message` unless `pred` is all true.
    Assert { message: String },
    /// `(operand, indices..) -> (pred, raw, normalized, axis, size)`
    BoundsProbe(IndexSpec),
    /// `(flag, code, payload, pred, local_code, local_payload) -> (flag, code, payload)`
    ///
    /// Keeps an already triggered error; otherwise, when `pred` holds, takes
    /// code `base + local_code` and writes `local_payload` at `offset`.
    /// `span` counts the codes this merge can introduce.
    ErrorMerge { base: u32, span: u32, offset: usize },
    /// `(flags, values..) -> (any, values at first true flag..)`
    FirstWhere,
    /// `(flags, codes, payloads) -> ()`: raise the first triggered error.
    Reraise { slots: Vec<MessageSlot> },

    // === Control flow ===
    /// `(index, operands..) -> outs`
    Cond { branches: Vec<Arc<Function>> },
    /// `(consts.., carry.., xs..) -> (carry.., ys..)`
    Scan {
        body: Arc<Function>,
        length: usize,
        num_consts: usize,
        num_carry: usize,
    },
    /// `(cond_consts.., body_consts.., carry..) -> carry..`
    While {
        cond: Arc<Function>,
        body: Arc<Function>,
        cond_consts: usize,
        body_consts: usize,
    },
    /// `args.. -> stacked outs..`, one replica per axis-0 slice of the mapped args.
    Map { body: Arc<Function>, mapped: Vec<bool> },
    /// Like `map`, one replica per shard, executed in parallel.
    Partition {
        body: Arc<Function>,
        shards: usize,
        mapped: Vec<bool>,
    },
    Call {
        body: Arc<Function>,
        name: Option<String>,
    },
    /// `primal` computes the value; `rule` maps `(primals.., tangents..)`
    /// to `(outs.., tangent_outs..)`.
    CustomJvp {
        primal: Arc<Function>,
        rule: Arc<Function>,
    },
}

impl Primitive {
    /// Short name used in listings and messages.
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Unary(op) => op.name(),
            Primitive::Binary(op) => op.name(),
            Primitive::Reduce(op) => op.name(),
            Primitive::Select => "select",
            Primitive::ZerosLike => "zeros_like",
            Primitive::Pack => "pack",
            Primitive::Index(_) => "index",
            Primitive::IndexUpdate { .. } => "index_update",
            Primitive::Assert { .. } => "assert",
            Primitive::BoundsProbe(_) => "bounds_probe",
            Primitive::ErrorMerge { .. } => "error_merge",
            Primitive::FirstWhere => "first_where",
            Primitive::Reraise { .. } => "reraise",
            Primitive::Cond { .. } => "cond",
            Primitive::Scan { .. } => "scan",
            Primitive::While { .. } => "while",
            Primitive::Map { .. } => "map",
            Primitive::Partition { .. } => "partition",
            Primitive::Call { .. } => "call",
            Primitive::CustomJvp { .. } => "custom_jvp",
        }
    }

    /// Nested functions carried by this primitive.
    pub fn subfunctions(&self) -> Vec<&Arc<Function>> {
        match self {
            Primitive::Cond { branches } => branches.iter().collect(),
            Primitive::Scan { body, .. }
            | Primitive::Map { body, .. }
            | Primitive::Partition { body, .. }
            | Primitive::Call { body, .. } => vec![body],
            Primitive::While { cond, body, .. } => vec![cond, body],
            Primitive::CustomJvp { primal, rule } => vec![primal, rule],
            _ => Vec::new(),
        }
    }

    fn attributes(&self) -> String {
        match self {
            Primitive::Index(spec) | Primitive::BoundsProbe(spec) => spec.to_string(),
            Primitive::IndexUpdate { spec, mode } => format!("{spec}{{{mode:?}}}"),
            Primitive::Assert { message } => format!("{{{message:?}}}"),
            Primitive::ErrorMerge { base, span, offset } => {
                format!("{{base={base}, span={span}, offset={offset}}}")
            }
            Primitive::Reraise { slots } => format!("{{slots={}}}", slots.len()),
            Primitive::Scan {
                length,
                num_consts,
                num_carry,
                ..
            } => format!("{{length={length}, consts={num_consts}, carry={num_carry}}}"),
            Primitive::While {
                cond_consts,
                body_consts,
                ..
            } => format!("{{cond_consts={cond_consts}, body_consts={body_consts}}}"),
            Primitive::Map { mapped, .. } => format!("{{mapped={mapped:?}}}"),
            Primitive::Partition { shards, mapped, .. } => {
                format!("{{shards={shards}, mapped={mapped:?}}}")
            }
            Primitive::Call { name: Some(n), .. } => format!("{{{n}}}"),
            _ => String::new(),
        }
    }
}

// ============================================================================
// Equations and functions
// ============================================================================

/// One primitive application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equation {
    pub primitive: Primitive,
    pub inputs: Vec<Atom>,
    pub outputs: Vec<Var>,
}

/// A closed function in SSA form.
///
/// Nested bodies never capture variables of the enclosing function; values
/// they need are passed as explicit inputs of the primitive that owns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub params: Vec<Var>,
    pub equations: Vec<Equation>,
    pub results: Vec<Atom>,
    /// Number of variables allocated (all variables are below this bound).
    pub var_count: u32,
}

impl Function {
    /// Identity function over `n` values.
    pub fn identity(n: usize) -> Self {
        let params: Vec<Var> = (0..n as u32).map(Var).collect();
        Self {
            results: params.iter().copied().map(Atom::Var).collect(),
            params,
            equations: Vec::new(),
            var_count: n as u32,
        }
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn num_results(&self) -> usize {
        self.results.len()
    }

    /// Pretty-print the function with nested bodies indented.
    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        self.write_indented(&mut out, 0);
        out
    }

    fn write_indented(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
        out.push_str(&format!("{{ lambda {} .\n", params.join(" ")));
        for eq in &self.equations {
            let outs: Vec<String> = eq.outputs.iter().map(|v| v.to_string()).collect();
            let ins: Vec<String> = eq.inputs.iter().map(|a| a.to_string()).collect();
            out.push_str(&pad);
            out.push_str("  ");
            if !outs.is_empty() {
                out.push_str(&format!("{} = ", outs.join(" ")));
            }
            out.push_str(&format!(
                "{}{} {}\n",
                eq.primitive.name(),
                eq.primitive.attributes(),
                ins.join(" ")
            ));
            for (i, sub) in eq.primitive.subfunctions().into_iter().enumerate() {
                out.push_str(&format!("{pad}    [{i}] "));
                sub.write_indented(out, depth + 2);
            }
        }
        let results: Vec<String> = self.results.iter().map(|r| r.to_string()).collect();
        out.push_str(&format!("{pad}  in ({}) }}\n", results.join(", ")));
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty_print())
    }
}
