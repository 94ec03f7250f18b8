//! Error categories, the threaded error value and the discharged report.
//!
//! # Error Categories
//!
//! - **Value-domain**: [`ErrorCategory::Div`], [`ErrorCategory::Nan`]
//! - **Indexing**: [`ErrorCategory::OutOfBounds`]
//! - **User**: [`ErrorCategory::UserAssert`]
//!
//! # Merge algebra
//!
//! [`ErrorValue::merge`] keeps the earlier triggered error. It is associative,
//! idempotent and has the untriggered value as identity, so it can be folded
//! over program order, loop iterations and replicas alike.
//!
//! # Reports
//!
//! [`Error`] is what a checked function returns. It stores flags, codes and
//! payload rows as parallel sequences indexed by replica position, so one
//! type covers both plain and batched calls.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ad::AdError;
use crate::array::{strides, truthy, Array, ShapeError};
use crate::ir::{ValidationError, Var};

use super::schema::ErrorSchema;

// ============================================================================
// Categories
// ============================================================================

/// One kind of runtime fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Division by exactly zero.
    #[serde(rename = "div")]
    Div,
    /// NaN produced from NaN-free inputs.
    #[serde(rename = "nan")]
    Nan,
    /// Index outside `[-size, size)` on some axis.
    #[serde(rename = "oob")]
    OutOfBounds,
    /// Explicit `check` with a false predicate.
    #[serde(rename = "user")]
    UserAssert,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 4] = [
        ErrorCategory::Div,
        ErrorCategory::Nan,
        ErrorCategory::OutOfBounds,
        ErrorCategory::UserAssert,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ErrorCategory::Div => "div",
            ErrorCategory::Nan => "nan",
            ErrorCategory::OutOfBounds => "oob",
            ErrorCategory::UserAssert => "user",
        }
    }

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of enabled categories.
///
/// The named constants are plain unions; raw sets built from categories are
/// accepted anywhere a named set is.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ErrorSetRepr", into = "ErrorSetRepr")]
pub struct ErrorSet(u8);

impl ErrorSet {
    pub const NONE: ErrorSet = ErrorSet(0);
    pub const FLOAT_CHECKS: ErrorSet = ErrorSet(0b0011);
    pub const INDEX_CHECKS: ErrorSet = ErrorSet(0b0100);
    pub const USER_CHECKS: ErrorSet = ErrorSet(0b1000);
    pub const AUTOMATIC_CHECKS: ErrorSet = ErrorSet(0b0111);
    pub const ALL_CHECKS: ErrorSet = ErrorSet(0b1111);

    const NAMED: [(&'static str, ErrorSet); 6] = [
        ("none", ErrorSet::NONE),
        ("float_checks", ErrorSet::FLOAT_CHECKS),
        ("index_checks", ErrorSet::INDEX_CHECKS),
        ("user_checks", ErrorSet::USER_CHECKS),
        ("automatic_checks", ErrorSet::AUTOMATIC_CHECKS),
        ("all_checks", ErrorSet::ALL_CHECKS),
    ];

    pub fn contains(self, category: ErrorCategory) -> bool {
        self.0 & category.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, category: ErrorCategory) {
        self.0 |= category.bit();
    }

    /// Categories in the set, in canonical order.
    pub fn iter(self) -> impl Iterator<Item = ErrorCategory> {
        ErrorCategory::ALL.into_iter().filter(move |c| self.contains(*c))
    }

    /// Look up a named set (`"float_checks"`, `"all_checks"`, ...).
    pub fn from_name(name: &str) -> Option<ErrorSet> {
        Self::NAMED
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, set)| *set)
    }

    /// Name of this set if it is one of the named constants.
    pub fn name(self) -> Option<&'static str> {
        Self::NAMED
            .iter()
            .find(|(_, set)| *set == self)
            .map(|(n, _)| *n)
    }
}

impl Default for ErrorSet {
    fn default() -> Self {
        ErrorSet::USER_CHECKS
    }
}

impl fmt::Debug for ErrorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl From<ErrorCategory> for ErrorSet {
    fn from(category: ErrorCategory) -> Self {
        ErrorSet(category.bit())
    }
}

impl FromIterator<ErrorCategory> for ErrorSet {
    fn from_iter<I: IntoIterator<Item = ErrorCategory>>(iter: I) -> Self {
        let mut set = ErrorSet::NONE;
        for category in iter {
            set.insert(category);
        }
        set
    }
}

impl<const N: usize> From<[ErrorCategory; N]> for ErrorSet {
    fn from(categories: [ErrorCategory; N]) -> Self {
        categories.into_iter().collect()
    }
}

impl BitOr for ErrorSet {
    type Output = ErrorSet;

    fn bitor(self, rhs: ErrorSet) -> ErrorSet {
        ErrorSet(self.0 | rhs.0)
    }
}

impl BitOr<ErrorCategory> for ErrorSet {
    type Output = ErrorSet;

    fn bitor(self, rhs: ErrorCategory) -> ErrorSet {
        ErrorSet(self.0 | rhs.bit())
    }
}

/// Serialized form: a named set or a list of category names.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ErrorSetRepr {
    Named(String),
    List(Vec<ErrorCategory>),
}

impl TryFrom<ErrorSetRepr> for ErrorSet {
    type Error = String;

    fn try_from(repr: ErrorSetRepr) -> Result<Self, Self::Error> {
        match repr {
            ErrorSetRepr::Named(name) => ErrorSet::from_name(&name)
                .ok_or_else(|| format!("unknown error set `{name}`")),
            ErrorSetRepr::List(categories) => Ok(categories.into_iter().collect()),
        }
    }
}

impl From<ErrorSet> for ErrorSetRepr {
    fn from(set: ErrorSet) -> Self {
        match set.name() {
            Some(name) => ErrorSetRepr::Named(name.to_string()),
            None => ErrorSetRepr::List(set.iter().collect()),
        }
    }
}

// ============================================================================
// Error value
// ============================================================================

/// The accumulator threaded through a checked function.
///
/// `code` and `payload` are meaningful only while `triggered` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub triggered: bool,
    pub code: u32,
    pub payload: Vec<f64>,
}

impl ErrorValue {
    /// Fresh error with a zeroed payload of `width` values.
    pub fn untriggered(width: usize) -> Self {
        Self {
            triggered: false,
            code: 0,
            payload: vec![0.0; width],
        }
    }

    /// First-triggered-wins merge; `self` is earlier in program order.
    pub fn merge(self, later: ErrorValue) -> ErrorValue {
        if self.triggered {
            self
        } else {
            later
        }
    }

    /// Read an unbatched `(flag, code, payload)` triple.
    pub fn from_channels(flag: &Array, code: &Array, payload: &Array) -> Result<Self, ShapeError> {
        Ok(Self {
            triggered: truthy(flag.to_scalar()?),
            code: code.to_scalar()? as u32,
            payload: payload.data().to_vec(),
        })
    }

    /// The `(flag, code, payload)` triple as arrays.
    pub fn into_channels(self) -> [Array; 3] {
        [
            Array::from_bool(self.triggered),
            Array::scalar(self.code as f64),
            Array::from_vec(self.payload),
        ]
    }
}

// ============================================================================
// Failures
// ============================================================================

/// A synchronous raise of a failed check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CheckFailure {
    pub message: String,
}

impl CheckFailure {
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors raised while building a checked function.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CheckifyError {
    /// A combination of transformations the pass cannot resolve statically.
    #[error("{combination} is not supported: {detail}")]
    Composition { combination: String, detail: String },

    #[error("variable {0} is not defined")]
    UnknownVariable(Var),

    #[error("invalid function: {}", join_errors(.0))]
    Invalid(Vec<ValidationError>),

    #[error(transparent)]
    Ad(#[from] AdError),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Report
// ============================================================================

/// Discharged error report.
///
/// Unbatched reports hold one entry; reports from replicated calls hold one
/// entry per replica, in replica order.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    flags: Vec<bool>,
    codes: Vec<u32>,
    /// `flags.len()` rows of `width` values.
    payload: Vec<f64>,
    width: usize,
    batch_shape: Vec<usize>,
    schema: Arc<ErrorSchema>,
    reachable: Vec<u32>,
}

impl Error {
    /// Build a report from discharged channels.
    pub(crate) fn from_outputs(
        flag: &Array,
        code: &Array,
        payload: &Array,
        schema: Arc<ErrorSchema>,
        reachable: Vec<u32>,
    ) -> Result<Self, ShapeError> {
        let batch_shape = flag.shape().to_vec();
        let n = flag.len();
        if code.shape() != batch_shape.as_slice() || !payload.shape().starts_with(&batch_shape) {
            return Err(ShapeError::Stack(batch_shape, payload.shape().to_vec()));
        }
        let width = if n == 0 {
            schema.width()
        } else {
            payload.len() / n
        };
        Ok(Self {
            flags: flag.data().iter().map(|&f| truthy(f)).collect(),
            codes: code.data().iter().map(|&c| c as u32).collect(),
            payload: payload.data().to_vec(),
            width,
            batch_shape,
            schema,
            reachable,
        })
    }

    /// Rebuild a report from channels that crossed an array boundary.
    pub fn from_channels(
        schema: Arc<ErrorSchema>,
        flag: &Array,
        code: &Array,
        payload: &Array,
    ) -> Result<Self, ShapeError> {
        let reachable = (0..schema.len() as u32).collect();
        Self::from_outputs(flag, code, payload, schema, reachable)
    }

    /// The error as `(flag, code, payload)` arrays.
    pub fn channels(&self) -> [Array; 3] {
        let flags = self.flags.iter().map(|&f| if f { 1.0 } else { 0.0 }).collect();
        let codes = self.codes.iter().map(|&c| c as f64).collect();
        let mut payload_shape = self.batch_shape.clone();
        payload_shape.push(self.width);
        [
            Array::from_parts(self.batch_shape.clone(), flags),
            Array::from_parts(self.batch_shape.clone(), codes),
            Array::from_parts(payload_shape, self.payload.clone()),
        ]
    }

    /// Rendered message of the first triggered error, or `None`.
    ///
    /// Batched reports render one line per triggered replica.
    pub fn get(&self) -> Option<String> {
        if !self.is_batched() {
            return self.flags.first().copied().unwrap_or(false).then(|| self.render(0));
        }
        let lines: Vec<String> = (0..self.flags.len())
            .filter(|&i| self.flags[i])
            .map(|i| format!("at mapped index {}: {}", self.replica_label(i), self.render(i)))
            .collect();
        (!lines.is_empty()).then(|| lines.join("\n"))
    }

    /// Distinct message templates reachable in the checked function, in code
    /// order.
    pub fn messages(&self) -> Vec<String> {
        self.schema.templates(&self.reachable)
    }

    pub fn is_triggered(&self) -> bool {
        self.flags.iter().any(|&f| f)
    }

    pub fn is_batched(&self) -> bool {
        !self.batch_shape.is_empty()
    }

    pub fn batch_shape(&self) -> &[usize] {
        &self.batch_shape
    }

    pub fn schema(&self) -> &Arc<ErrorSchema> {
        &self.schema
    }

    /// Code of the first triggered entry.
    pub fn code(&self) -> Option<u32> {
        self.first_triggered().map(|i| self.codes[i])
    }

    /// Category of the first triggered entry.
    pub fn category(&self) -> Option<ErrorCategory> {
        self.code()
            .and_then(|c| self.schema.slot(c))
            .map(|slot| slot.category)
    }

    /// Collapse replicas to the first triggered one (in replica order).
    pub fn reduce(&self) -> Error {
        let i = self.first_triggered().unwrap_or(0);
        let row = if self.flags.is_empty() {
            vec![0.0; self.width]
        } else {
            self.row(i).to_vec()
        };
        Error {
            flags: vec![self.flags.get(i).copied().unwrap_or(false)],
            codes: vec![self.codes.get(i).copied().unwrap_or(0)],
            payload: row,
            width: self.width,
            batch_shape: Vec::new(),
            schema: Arc::clone(&self.schema),
            reachable: self.reachable.clone(),
        }
    }

    fn first_triggered(&self) -> Option<usize> {
        self.flags.iter().position(|&f| f)
    }

    fn row(&self, i: usize) -> &[f64] {
        &self.payload[i * self.width..(i + 1) * self.width]
    }

    fn render(&self, i: usize) -> String {
        let code = self.codes[i];
        match self.schema.slot(code) {
            Some(slot) => slot.render(self.row(i)),
            None => format!("unknown error code {code}"),
        }
    }

    fn replica_label(&self, i: usize) -> String {
        let coords: Vec<String> = strides(&self.batch_shape)
            .iter()
            .zip(&self.batch_shape)
            .map(|(stride, dim)| ((i / stride) % dim).to_string())
            .collect();
        coords.join(", ")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(message) => f.write_str(&message),
            None => f.write_str("no error"),
        }
    }
}
