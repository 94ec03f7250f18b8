//! Checked execution.
//!
//! `checkify` rewrites a function so that it carries an explicit error value
//! alongside its outputs. Enabled checks are inserted right after the
//! operations they guard and every control construct threads the error
//! through its bodies, so the caller receives the first fault in program
//! order without any change to the numerical results.
//!
//! # Pipeline
//!
//! ```text
//! Function ─► Instrumenter (registry + rules) ─► checked Function + ErrorSchema
//!                                                   │
//!                          Checked::call ◄──────────┘
//!                               │
//!                               ▼
//!                       (Error report, outputs)
//! ```
//!
//! # Example
//!
//! ```
//! use checkflow::{checkify, Array, ErrorSet, Function};
//!
//! let f = Function::build(1, |b, x| vec![b.sin(&x[0])]);
//! let checked = checkify(&f, ErrorSet::FLOAT_CHECKS).unwrap();
//! let (error, _) = checked.call(&[Array::scalar(f64::INFINITY)]).unwrap();
//! assert_eq!(error.get().as_deref(), Some("nan generated by primitive sin"));
//! ```

pub mod config;
pub mod discharge;
pub mod error;
pub(crate) mod instrument;
pub mod registry;
mod rules;
pub mod schema;

#[cfg(test)]
mod tests;

pub use config::{CheckifyConfig, ConfigError, ReplicaErrors, WhileInMap};
pub use discharge::{check, check_error, checkify, checkify_with, Checked, CheckedJvp, ErrorChannel};
pub use error::{CheckFailure, CheckifyError, Error, ErrorCategory, ErrorSet, ErrorValue};
pub use registry::{CheckRegistry, CheckRule, CheckSite, Probe, BOUNDS_TEMPLATE};
pub use schema::{ErrorSchema, MessageSlot};
