//! Checkflow Tools
//!
//! Logging setup and file loading for the `checkflow` command line tool.
//!
//! Programs are JSON-serialized [`Function`]s. Argument files are JSON lists
//! whose entries are a number, a flat list of numbers, or an object with
//! `shape` and `data`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

use checkflow::checkify::ConfigError;
use checkflow::{Array, CheckifyConfig, Function, ShapeError};

/// Initialize logging with a default filter.
///
/// Use `RUST_LOG` environment variable to override the default filter.
/// Default is `info`, with `debug` for the checkflow crates.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,checkflow=debug,checkflow_tools=debug"));

    fmt().with_env_filter(filter).with_target(false).init();
}

/// Errors raised while loading tool inputs.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{path}': {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("argument {index}: {source}")]
    Shape {
        index: usize,
        #[source]
        source: ShapeError,
    },

    #[error("invalid program: {0}")]
    Program(String),

    #[error(transparent)]
    Policy(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, ToolError>;

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| ToolError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn parse<T: for<'de> Deserialize<'de>>(path: &Path, content: &str) -> Result<T> {
    serde_json::from_str(content).map_err(|source| ToolError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Load and validate a JSON-serialized program.
pub fn load_program(path: &Path) -> Result<Function> {
    let program: Function = parse(path, &read(path)?)?;
    program.validate().map_err(|errors| {
        ToolError::Program(
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    })?;
    debug!(
        params = program.num_params(),
        equations = program.equations.len(),
        "loaded program"
    );
    Ok(program)
}

/// One argument as written in an argument file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Scalar(f64),
    Vector(Vec<f64>),
    Shaped { shape: Vec<usize>, data: Vec<f64> },
}

impl ArgValue {
    pub fn into_array(self) -> std::result::Result<Array, ShapeError> {
        match self {
            ArgValue::Scalar(x) => Ok(Array::scalar(x)),
            ArgValue::Vector(values) => Ok(Array::from_vec(values)),
            ArgValue::Shaped { shape, data } => Array::new(shape, data),
        }
    }
}

/// Parse a JSON argument list.
pub fn parse_args(path: &Path, content: &str) -> Result<Vec<Array>> {
    let values: Vec<ArgValue> = parse(path, content)?;
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            value
                .into_array()
                .map_err(|source| ToolError::Shape { index, source })
        })
        .collect()
}

/// Load a JSON argument file.
pub fn load_args(path: &Path) -> Result<Vec<Array>> {
    parse_args(path, &read(path)?)
}

/// Load a policy file; without one every category is checked.
pub fn load_policy(path: Option<&Path>) -> Result<CheckifyConfig> {
    match path {
        Some(path) => Ok(CheckifyConfig::load(path)?),
        None => Ok(CheckifyConfig::new(checkflow::ErrorSet::ALL_CHECKS)),
    }
}

/// Machine-readable outcome of a checked run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub triggered: bool,
    pub message: Option<String>,
    pub category: Option<String>,
    pub outputs: Vec<ArgValue>,
}

impl RunReport {
    pub fn new(error: &checkflow::Error, outputs: &[Array]) -> Self {
        Self {
            triggered: error.is_triggered(),
            message: error.get(),
            category: error.category().map(|c| c.to_string()),
            outputs: outputs
                .iter()
                .map(|a| ArgValue::Shaped {
                    shape: a.shape().to_vec(),
                    data: a.data().to_vec(),
                })
                .collect(),
        }
    }
}
