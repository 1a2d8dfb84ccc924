#![forbid(unsafe_code)]

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CtrlLordError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid config key '{0}'")]
    InvalidConfigKey(String),

    #[error("invalid config value for '{key}': {msg}")]
    InvalidConfigValue { key: String, msg: String },

    #[error("invalid task: {0}")]
    InvalidPayload(String),

    #[error("unknown task backend '{0}' (expected json or jira)")]
    UnknownBackend(String),

    #[error("{backend} returned HTTP {status}: {body}")]
    HttpStatus {
        backend: &'static str,
        status: u16,
        body: String,
    },

    #[error("task record {0} already exists")]
    RecordExists(String),

    #[error("task queue is closed")]
    QueueClosed,

    #[error("playbook not found matching pattern: {0}")]
    PlaybookNotFound(String),

    #[error("multiple playbooks match pattern: {0}")]
    AmbiguousPlaybook(String),

    #[error("playbook is already running: {0}")]
    AlreadyRunning(String),

    #[error("invalid parameter '{0}': expected NAME=VALUE")]
    InvalidParam(String),
}
