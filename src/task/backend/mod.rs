#![forbid(unsafe_code)]

//! Task destinations.
//!
//! A backend turns a [`TaskPayload`] into a [`TaskResult`]. The queue owns
//! exactly one backend and never calls it concurrently, so implementations
//! only need to be `Send`.

pub mod jira;
pub mod json;

use std::str::FromStr;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::CtrlLordError;
use crate::task::model::{TaskPayload, TaskResult};

pub use jira::JiraBackend;
pub use json::JsonBackend;

#[async_trait]
pub trait TaskBackend: Send {
    fn name(&self) -> &'static str;

    async fn submit(&mut self, payload: &TaskPayload) -> anyhow::Result<TaskResult>;

    /// Swap in new configuration. Called between submissions, never during one.
    fn reload(&mut self, cfg: &Config) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Json,
    Jira,
}

impl FromStr for BackendKind {
    type Err = CtrlLordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "jira" => Ok(Self::Jira),
            _ => Err(CtrlLordError::UnknownBackend(s.to_owned())),
        }
    }
}

pub fn backend_from_config(cfg: &Config) -> anyhow::Result<Box<dyn TaskBackend>> {
    let kind: BackendKind = cfg.task.backend.parse()?;
    Ok(match kind {
        BackendKind::Json => Box::new(JsonBackend::from_config(cfg)?),
        BackendKind::Jira => Box::new(JiraBackend::from_config(cfg)?),
    })
}
