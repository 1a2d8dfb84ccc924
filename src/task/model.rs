#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::error::CtrlLordError;

/// A task creation request, built by the front-end and consumed by the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPayload {
    pub summary: String,
    pub description: String,
    pub issue_type: String,
    pub component: String,
}

impl TaskPayload {
    pub fn new(
        summary: &str,
        description: impl Into<String>,
        issue_type: impl Into<String>,
        component: impl Into<String>,
    ) -> Result<Self, CtrlLordError> {
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(CtrlLordError::InvalidPayload(
                "summary must not be empty".to_owned(),
            ));
        }
        Ok(Self {
            summary: summary.to_owned(),
            description: description.into(),
            issue_type: issue_type.into(),
            component: component.into(),
        })
    }
}

/// What a backend hands back for a created task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskResult {
    pub key: String,
    pub summary: String,
    pub description: String,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub component: String,
    pub url: String,
}

impl TaskResult {
    #[must_use]
    pub fn from_payload(payload: &TaskPayload, key: String, url: String) -> Self {
        Self {
            key,
            summary: payload.summary.clone(),
            description: payload.description.clone(),
            issue_type: payload.issue_type.clone(),
            component: payload.component.clone(),
            url,
        }
    }
}

/// A persisted [`TaskResult`], stamped when it was written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRecord {
    #[serde(flatten)]
    pub result: TaskResult,
    pub created_at: String,
}
