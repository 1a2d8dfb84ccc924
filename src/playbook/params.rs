#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Context as _;
use tracing::{debug, warn};

use crate::playbook::model::Playbook;

type CacheFile = BTreeMap<String, BTreeMap<String, String>>;

/// Last-used parameter values per playbook, persisted as
/// `{ "<file_path>": { "<param>": "<value>" } }`.
///
/// Saves are read-modify-write under a mutex and land via rename, so two runs
/// saving at once cannot drop each other's entries. Share one instance (for
/// example behind an `Arc`) between everything that writes the file.
#[derive(Debug)]
pub struct ParamCache {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ParamCache {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved values for one playbook; empty when nothing was saved or the
    /// cache is unreadable.
    #[must_use]
    pub fn load(&self, playbook_path: &Path) -> BTreeMap<String, String> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read()
            .remove(playbook_path.to_string_lossy().as_ref())
            .unwrap_or_default()
    }

    pub fn save(
        &self,
        playbook_path: &Path,
        values: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cache = self.read();
        cache.insert(playbook_path.to_string_lossy().to_string(), values.clone());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));
        let data = serde_json::to_vec_pretty(&cache)?;
        std::fs::write(&tmp, &data)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path).with_context(|| {
            format!("failed to rename {} -> {}", tmp.display(), self.path.display())
        })?;
        debug!(playbook = %playbook_path.display(), "saved playbook params");
        Ok(())
    }

    /// Field values for the next run: declared defaults, overlaid with saved
    /// values for params the playbook still declares.
    #[must_use]
    pub fn prefill(&self, playbook: &Playbook) -> BTreeMap<String, String> {
        let saved = self.load(&playbook.file_path);
        let mut values = playbook.default_params();
        for (name, value) in values.iter_mut() {
            if let Some(v) = saved.get(name) {
                value.clone_from(v);
            }
        }
        values
    }

    fn read(&self) -> CacheFile {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheFile::new(),
            Err(e) => {
                warn!(path = %self.path.display(), "failed to read param cache: {e}");
                return CacheFile::new();
            }
        };
        serde_json::from_slice(&data).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), "ignoring corrupt param cache: {e}");
            CacheFile::new()
        })
    }
}
