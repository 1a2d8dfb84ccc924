#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use crate::error::CtrlLordError;
use crate::task::model::{TaskRecord, TaskResult};

const KEY_PREFIX: &str = "TASK-";

/// One JSON file per created task, named by its key.
#[derive(Debug, Clone)]
pub struct TaskStorage {
    dir: PathBuf,
}

impl TaskStorage {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create task data dir {}", self.dir.display()))
    }

    /// Next free `TASK-<n>` key: one past the highest numeric suffix on disk.
    pub fn next_key(&self) -> anyhow::Result<String> {
        if !self.dir.exists() {
            return Ok(format!("{KEY_PREFIX}1"));
        }
        let mut max_id = 0u64;
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(n) = name
                .to_str()
                .and_then(|s| s.strip_prefix(KEY_PREFIX))
                .and_then(|s| s.strip_suffix(".json"))
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            max_id = max_id.max(n);
        }
        Ok(format!("{KEY_PREFIX}{}", max_id + 1))
    }

    #[must_use]
    pub fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub fn save(&self, result: &TaskResult) -> anyhow::Result<TaskRecord> {
        validate_key(&result.key)?;
        self.ensure_dir()?;
        let record = TaskRecord {
            result: result.clone(),
            created_at: now_rfc3339(),
        };
        let path = self.record_path(&result.key);
        // Keys are unique per data dir; one writer per dir makes this check sound.
        if path.exists() {
            return Err(CtrlLordError::RecordExists(result.key.clone()).into());
        }
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(&record)?;
        std::fs::write(&tmp, &data)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {} -> {}", tmp.display(), path.display()))?;
        info!(path = %path.display(), "saved task record");
        Ok(record)
    }

    pub fn list(&self) -> anyhow::Result<Vec<TaskRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let data = match std::fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable task record: {e}");
                    continue;
                }
            };
            match serde_json::from_slice::<TaskRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), "skipping malformed task record: {e}"),
            }
        }
        Ok(records)
    }

    /// Records created on `date` (UTC), newest first.
    pub fn created_on(&self, date: time::Date) -> anyhow::Result<Vec<TaskRecord>> {
        let mut dated: Vec<(OffsetDateTime, TaskRecord)> = Vec::new();
        for record in self.list()? {
            let Ok(at) = OffsetDateTime::parse(&record.created_at, &Rfc3339) else {
                warn!(key = %record.result.key, "skipping task with invalid created_at");
                continue;
            };
            if at.to_offset(time::UtcOffset::UTC).date() == date {
                dated.push((at, record));
            }
        }
        dated.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(dated.into_iter().map(|(_, r)| r).collect())
    }

    pub fn today(&self) -> anyhow::Result<Vec<TaskRecord>> {
        self.created_on(OffsetDateTime::now_utc().date())
    }
}

fn validate_key(key: &str) -> anyhow::Result<()> {
    if key.trim().is_empty() {
        anyhow::bail!("task key is required");
    }
    if key.contains('/') || key.contains('\\') {
        anyhow::bail!("invalid task key '{key}': must not contain path separators");
    }
    if key.contains("..") {
        anyhow::bail!("invalid task key '{key}': must not contain '..'");
    }
    Ok(())
}

#[must_use]
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_owned())
}
