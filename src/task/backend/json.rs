#![forbid(unsafe_code)]

use async_trait::async_trait;
use tracing::info;

use crate::config::{self, Config};
use crate::task::backend::TaskBackend;
use crate::task::model::{TaskPayload, TaskResult};
use crate::task::storage::TaskStorage;

/// Local store: every task becomes `TASK-<n>.json` in the data directory.
#[derive(Debug, Clone)]
pub struct JsonBackend {
    storage: TaskStorage,
}

impl JsonBackend {
    #[must_use]
    pub fn new(storage: TaskStorage) -> Self {
        Self { storage }
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let dir = config::expand_path(&cfg.task.data_dir)?;
        Ok(Self::new(TaskStorage::new(dir)))
    }

    #[must_use]
    pub fn storage(&self) -> &TaskStorage {
        &self.storage
    }
}

#[async_trait]
impl TaskBackend for JsonBackend {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn submit(&mut self, payload: &TaskPayload) -> anyhow::Result<TaskResult> {
        let key = self.storage.next_key()?;
        let url = self.storage.record_path(&key).to_string_lossy().to_string();
        let result = TaskResult::from_payload(payload, key, url);
        self.storage.save(&result)?;
        Ok(result)
    }

    fn reload(&mut self, cfg: &Config) -> anyhow::Result<()> {
        info!("json backend config is reloading");
        *self = Self::from_config(cfg)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(summary: &str) -> TaskPayload {
        TaskPayload::new(summary, "details", "Task", "Core").unwrap()
    }

    #[tokio::test]
    async fn submit_allocates_sequential_keys_and_persists() {
        let td = tempfile::tempdir().unwrap();
        let mut backend = JsonBackend::new(TaskStorage::new(td.path().join("data")));

        let first = backend.submit(&payload("one")).await.unwrap();
        let second = backend.submit(&payload("two")).await.unwrap();

        assert_eq!(first.key, "TASK-1");
        assert_eq!(second.key, "TASK-2");
        assert_eq!(second.summary, "two");
        assert!(second.url.ends_with("TASK-2.json"));
        assert!(std::path::Path::new(&second.url).exists());
        assert_eq!(backend.storage().list().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reload_switches_data_dir() {
        let td = tempfile::tempdir().unwrap();
        let mut backend = JsonBackend::new(TaskStorage::new(td.path().join("a")));
        backend.submit(&payload("in a")).await.unwrap();

        let mut cfg = Config::default();
        cfg.task.data_dir = td.path().join("b").to_string_lossy().to_string();
        backend.reload(&cfg).unwrap();

        let result = backend.submit(&payload("in b")).await.unwrap();
        assert_eq!(result.key, "TASK-1");
        assert!(td.path().join("b").join("TASK-1.json").exists());
    }
}
