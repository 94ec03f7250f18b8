//! Check policy files.
//!
//! A policy selects which categories are instrumented and how the checked
//! function treats replicated execution. Policies are YAML documents:
//!
//! ```yaml
//! apiVersion: checkflow/v1
//! kind: CheckPolicy
//!
//! metadata:
//!   name: strict
//!   description: "Every built-in check plus user assertions"
//!
//! # Named set, or a list of categories: [div, nan, oob, user]
//! errors: all_checks
//!
//! # reject | masked
//! whileInMap: reject
//!
//! # per_replica | reduce (unset: per_replica for vmap, reduce for shard)
//! replicaErrors: per_replica
//! ```

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::ErrorSet;

const API_VERSION: &str = "checkflow/v1";
const KIND: &str = "CheckPolicy";

/// Errors that can occur when loading a policy.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse policy YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid apiVersion: expected 'checkflow/v1', got '{0}'")]
    UnsupportedVersion(String),

    #[error("invalid kind: expected 'CheckPolicy', got '{0}'")]
    UnsupportedKind(String),
}

/// Result type for policy operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// What to do with a `while` loop that has enabled checks inside a `map`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhileInMap {
    /// Fail instrumentation with a composition error.
    #[default]
    Reject,
    /// Run every replica's loop on its own, so a finished replica never
    /// executes masked iterations.
    Masked,
}

/// How errors of replicated calls are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaErrors {
    /// One entry per replica.
    PerReplica,
    /// The first triggered replica only.
    Reduce,
}

/// Policy metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyMetadata {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub labels: IndexMap<String, String>,
}

/// Options of one `checkify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckifyConfig {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_kind")]
    pub kind: String,

    #[serde(default)]
    pub metadata: PolicyMetadata,

    /// Enabled categories.
    #[serde(default)]
    pub errors: ErrorSet,

    #[serde(default)]
    pub while_in_map: WhileInMap,

    /// Replica policy override for `vmap` and `shard`.
    #[serde(default)]
    pub replica_errors: Option<ReplicaErrors>,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    KIND.to_string()
}

impl Default for CheckifyConfig {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: PolicyMetadata::default(),
            errors: ErrorSet::default(),
            while_in_map: WhileInMap::default(),
            replica_errors: None,
        }
    }
}

impl CheckifyConfig {
    /// Default policy with the given categories enabled.
    pub fn new(errors: impl Into<ErrorSet>) -> Self {
        Self {
            errors: errors.into(),
            ..Self::default()
        }
    }

    pub fn with_while_in_map(mut self, policy: WhileInMap) -> Self {
        self.while_in_map = policy;
        self
    }

    pub fn with_replica_errors(mut self, policy: ReplicaErrors) -> Self {
        self.replica_errors = Some(policy);
        self
    }

    /// Load a policy from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a policy from a YAML string.
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let config: CheckifyConfig = serde_yaml::from_str(yaml)?;
        config.validate_schema()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn validate_schema(&self) -> ConfigResult<()> {
        if self.api_version != API_VERSION {
            return Err(ConfigError::UnsupportedVersion(self.api_version.clone()));
        }
        if self.kind != KIND {
            return Err(ConfigError::UnsupportedKind(self.kind.clone()));
        }
        Ok(())
    }
}
