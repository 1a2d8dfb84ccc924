#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::PlaybooksConfig;
use crate::error::CtrlLordError;
use crate::playbook::model::Playbook;
use crate::playbook::runner::{
    DEFAULT_SHELL, DEFAULT_STOP_GRACE, PlaybookRunner, RunEvent, RunHandle, RunOutcome,
};

/// Live runs keyed by playbook file path.
///
/// At most one run per playbook; different playbooks run side by side.
/// Finished runs are dropped the next time the map is touched.
#[derive(Debug)]
pub struct RunManager {
    shell: String,
    stop_grace: Duration,
    runs: HashMap<PathBuf, RunHandle>,
}

impl Default for RunManager {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL, DEFAULT_STOP_GRACE)
    }
}

impl RunManager {
    #[must_use]
    pub fn new(shell: impl Into<String>, stop_grace: Duration) -> Self {
        Self {
            shell: shell.into(),
            stop_grace,
            runs: HashMap::new(),
        }
    }

    #[must_use]
    pub fn from_config(cfg: &PlaybooksConfig) -> Self {
        Self::new(cfg.shell.clone(), Duration::from_millis(cfg.stop_grace_ms))
    }

    /// Starts `playbook` unless a run for the same file is still live.
    /// Returns the new run id and its event stream.
    pub fn start(
        &mut self,
        playbook: &Playbook,
        overrides: BTreeMap<String, String>,
    ) -> Result<(String, mpsc::UnboundedReceiver<RunEvent>), CtrlLordError> {
        self.reap();
        if self.runs.contains_key(&playbook.file_path) {
            return Err(CtrlLordError::AlreadyRunning(playbook.name.clone()));
        }

        let (handle, events) = PlaybookRunner::new(playbook.clone())
            .env_overrides(overrides)
            .shell(self.shell.clone())
            .stop_grace(self.stop_grace)
            .start();
        let run_id = handle.run_id().to_owned();
        info!(playbook = %playbook.name, %run_id, "run registered");
        self.runs.insert(playbook.file_path.clone(), handle);
        Ok((run_id, events))
    }

    /// Requests a stop; returns false when nothing is running for `file_path`.
    pub fn stop(&mut self, file_path: &Path) -> bool {
        self.reap();
        match self.runs.get(file_path) {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for handle in self.runs.values() {
            handle.stop();
        }
    }

    #[must_use]
    pub fn is_running(&self, file_path: &Path) -> bool {
        self.runs.get(file_path).is_some_and(|h| !h.is_finished())
    }

    /// Waits for the run of `file_path` and forgets it.
    pub async fn join(&mut self, file_path: &Path) -> Option<RunOutcome> {
        let handle = self.runs.remove(file_path)?;
        Some(handle.join().await)
    }

    fn reap(&mut self) {
        self.runs.retain(|path, handle| {
            let live = !handle.is_finished();
            if !live {
                debug!(playbook = %path.display(), run_id = handle.run_id(), "reaped run");
            }
            live
        });
    }
}
