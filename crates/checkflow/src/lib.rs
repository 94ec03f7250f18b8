//! checkflow - runtime-checked execution for staged numerical programs.
//!
//! A program is a closed [`Function`] built with [`FunctionBuilder`]. The
//! reference interpreter ([`eval`]) runs it on [`Array`] values, [`ad::jvp`]
//! differentiates it in forward mode, and [`checkify`] rewrites it so that
//! division by zero, NaN production, out-of-bounds indexing and failed user
//! assertions are reported through an [`Error`] value instead of being
//! silently absorbed or aborting evaluation.
//!
//! Pipeline: FunctionBuilder -> Function -> checkify -> Checked::call -> (Error, outputs)

pub mod ad;
pub mod array;
pub mod checkify;
pub mod interpret;
pub mod ir;

pub use array::{Array, ShapeError};
pub use checkify::{
    check, check_error, checkify, checkify_with, CheckFailure, CheckRegistry, Checked, CheckedJvp,
    CheckifyConfig, CheckifyError, Error, ErrorCategory, ErrorChannel, ErrorSet, ReplicaErrors,
    WhileInMap,
};
pub use interpret::{eval, EvalError};
pub use ir::{Atom, Function, FunctionBuilder, IndexSpec, Primitive, UpdateMode};
