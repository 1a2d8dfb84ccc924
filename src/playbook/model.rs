#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub run: String,
}

/// A user-editable value exported to every step as an environment variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub label: String,
    pub default: String,
}

/// A validated playbook. `file_path` identifies it at runtime; two files may
/// share a `name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Playbook {
    pub name: String,
    pub description: String,
    pub cwd: PathBuf,
    pub steps: Vec<Step>,
    pub params: Vec<Param>,
    pub file_path: PathBuf,
}

impl Playbook {
    #[must_use]
    pub fn default_params(&self) -> BTreeMap<String, String> {
        self.params
            .iter()
            .map(|p| (p.name.clone(), p.default.clone()))
            .collect()
    }
}
