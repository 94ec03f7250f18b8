//! Program IR.
//!
//! Functions are closed SSA programs over [`Array`](crate::array::Array)
//! values, built with [`FunctionBuilder`] and checked with [`validate`].
//!
//! Pipeline: FunctionBuilder -> Function -> (checkify | jvp) -> eval

mod builder;
mod types;
mod validate;


pub use builder::FunctionBuilder;
pub use types::*;
pub use validate::{validate, ValidationError};

impl Function {
    /// Validate this function and its nested bodies.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        validate(self)
    }
}
