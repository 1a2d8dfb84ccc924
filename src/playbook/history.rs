#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::playbook::model::Playbook;
use crate::playbook::runner::{RunEvent, RunOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Running,
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSnapshot {
    pub name: String,
    pub state: StepState,
}

/// What the front-end shows for one run: step markers plus the full log.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub steps: Vec<StepSnapshot>,
    pub logs: Vec<String>,
    pub finished: Option<RunOutcome>,
}

impl RunSnapshot {
    #[must_use]
    pub fn new(run_id: impl Into<String>, playbook: &Playbook) -> Self {
        Self {
            run_id: run_id.into(),
            steps: playbook
                .steps
                .iter()
                .map(|s| StepSnapshot {
                    name: s.name.clone(),
                    state: StepState::Pending,
                })
                .collect(),
            logs: Vec::new(),
            finished: None,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.finished.is_none()
    }

    pub fn apply(&mut self, event: &RunEvent) {
        match event {
            RunEvent::StepStarted { index, .. } => self.set_state(*index, StepState::Running),
            RunEvent::StepFinished { index, success } => {
                let state = if *success {
                    StepState::Success
                } else {
                    StepState::Failure
                };
                self.set_state(*index, state);
            }
            RunEvent::LogLine(line) => self.logs.push(line.clone()),
            RunEvent::RunFinished { success, cancelled } => {
                self.finished = Some(RunOutcome {
                    success: *success,
                    cancelled: *cancelled,
                });
            }
        }
    }

    fn set_state(&mut self, index: usize, state: StepState) {
        if let Some(step) = self.steps.get_mut(index) {
            step.state = state;
        }
    }
}

/// Latest run per playbook, keyed by the playbook's file path.
///
/// Starting a new run replaces the previous snapshot; a finished run stays
/// visible until then.
#[derive(Debug, Default)]
pub struct RunHistory {
    runs: HashMap<PathBuf, RunSnapshot>,
}

impl RunHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, run_id: impl Into<String>, playbook: &Playbook) -> &mut RunSnapshot {
        let snapshot = RunSnapshot::new(run_id, playbook);
        match self.runs.entry(playbook.file_path.clone()) {
            Entry::Occupied(mut slot) => {
                slot.insert(snapshot);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(snapshot),
        }
    }

    /// Events for a playbook with no snapshot are ignored.
    pub fn apply(&mut self, file_path: &Path, event: &RunEvent) {
        if let Some(snapshot) = self.runs.get_mut(file_path) {
            snapshot.apply(event);
        }
    }

    #[must_use]
    pub fn get(&self, file_path: &Path) -> Option<&RunSnapshot> {
        self.runs.get(file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::model::Step;

    fn playbook(path: &str, steps: &[&str]) -> Playbook {
        Playbook {
            name: "pb".to_owned(),
            description: String::new(),
            cwd: PathBuf::from("/tmp"),
            steps: steps
                .iter()
                .map(|s| Step {
                    name: (*s).to_owned(),
                    run: "true".to_owned(),
                })
                .collect(),
            params: Vec::new(),
            file_path: PathBuf::from(path),
        }
    }

    #[test]
    fn snapshot_tracks_step_states_and_logs() {
        let pb = playbook("/p/a.yml", &["build", "test", "ship"]);
        let mut snap = RunSnapshot::new("run-1", &pb);

        snap.apply(&RunEvent::StepStarted {
            index: 0,
            name: "build".to_owned(),
        });
        assert_eq!(snap.steps[0].state, StepState::Running);
        snap.apply(&RunEvent::LogLine("compiling".to_owned()));
        snap.apply(&RunEvent::StepFinished {
            index: 0,
            success: true,
        });
        snap.apply(&RunEvent::StepStarted {
            index: 1,
            name: "test".to_owned(),
        });
        snap.apply(&RunEvent::StepFinished {
            index: 1,
            success: false,
        });
        assert!(snap.is_running());
        snap.apply(&RunEvent::RunFinished {
            success: false,
            cancelled: false,
        });

        let states: Vec<StepState> = snap.steps.iter().map(|s| s.state).collect();
        assert_eq!(
            states,
            vec![StepState::Success, StepState::Failure, StepState::Pending]
        );
        assert_eq!(snap.logs, vec!["compiling"]);
        assert!(!snap.is_running());
    }

    #[test]
    fn history_is_keyed_by_file_path_and_replaced_on_new_run() {
        let a = playbook("/p/a.yml", &["one"]);
        let b = playbook("/p/b.yml", &["one"]);
        let mut history = RunHistory::new();

        history.begin("run-a1", &a);
        history.begin("run-b1", &b);
        history.apply(&a.file_path, &RunEvent::LogLine("from a".to_owned()));
        history.apply(&b.file_path, &RunEvent::LogLine("from b".to_owned()));
        history.apply(Path::new("/p/unknown.yml"), &RunEvent::LogLine("x".to_owned()));

        assert_eq!(history.get(&a.file_path).unwrap().logs, vec!["from a"]);
        assert_eq!(history.get(&b.file_path).unwrap().logs, vec!["from b"]);

        history.begin("run-a2", &a);
        let snap = history.get(&a.file_path).unwrap();
        assert_eq!(snap.run_id, "run-a2");
        assert!(snap.logs.is_empty());
    }
}
