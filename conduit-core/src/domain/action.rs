//! Action domain model
//!
//! Actions are owned by an external catalog service and are read-only here.
//! A step references one by `name@version`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Backend an action runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerType {
    Docker,
    K8s,
    Local,
}

impl fmt::Display for RunnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerType::Docker => write!(f, "docker"),
            RunnerType::K8s => write!(f, "k8s"),
            RunnerType::Local => write!(f, "local"),
        }
    }
}

impl FromStr for RunnerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(RunnerType::Docker),
            "k8s" => Ok(RunnerType::K8s),
            "local" => Ok(RunnerType::Local),
            other => Err(Error::validation(format!("unknown runner type '{}'", other))),
        }
    }
}

/// Catalog entry describing how to run a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub version: String,

    /// Declared runner backend, kept as a string so an unknown value can be
    /// reported as a step failure instead of a decode error
    pub runner_type: String,

    /// Default run parameters, lowest precedence in resolution
    #[serde(default)]
    pub run_params: BTreeMap<String, String>,

    /// Parameters that must be present and non-empty after resolution
    #[serde(default)]
    pub required_params: Vec<String>,

    /// Backend-specific parameters (image reference, command, ...)
    #[serde(default)]
    pub runner_params: BTreeMap<String, String>,
}

impl Action {
    /// Parses the declared runner type
    pub fn runner(&self) -> Result<RunnerType> {
        self.runner_type.parse()
    }
}

/// Parsed `name@version` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRef {
    pub name: String,
    pub version: String,
}

impl ActionRef {
    /// Version used when a reference omits one
    pub const DEFAULT_VERSION: &'static str = "latest";
}

impl FromStr for ActionRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, version) = match s.rsplit_once('@') {
            Some((name, version)) => (name, version),
            None => (s, Self::DEFAULT_VERSION),
        };

        if name.trim().is_empty() {
            return Err(Error::validation(format!("action reference '{}' has no name", s)));
        }

        if version.trim().is_empty() {
            return Err(Error::validation(format!(
                "action reference '{}' has an empty version",
                s
            )));
        }

        Ok(ActionRef {
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}
