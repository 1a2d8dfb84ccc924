#![forbid(unsafe_code)]

//! Playbook execution.
//!
//! A run executes the playbook's steps one after another, each through
//! `<shell> -c <run>` in the playbook's working directory. stdout and stderr
//! share one pipe and are forwarded line by line while the step is still
//! running, in the order the step wrote them. The
//! first failing step ends the run. [`RunHandle::stop`] requests a cooperative
//! stop that is honoured before the next step starts or while output is being
//! drained; a running child is sent SIGTERM and killed if it is still alive
//! after the grace period.
//!
//! Every run owns its own tokio task and child process. Progress is reported
//! only through [`RunEvent`]s, never by touching caller state.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::playbook::model::{Playbook, Step};

pub const DEFAULT_SHELL: &str = "bash";
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    StepStarted { index: usize, name: String },
    StepFinished { index: usize, success: bool },
    /// One line of combined stdout/stderr, without the line terminator.
    LogLine(String),
    RunFinished { success: bool, cancelled: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    pub cancelled: bool,
}

impl RunOutcome {
    const SUCCEEDED: Self = Self {
        success: true,
        cancelled: false,
    };
    const FAILED: Self = Self {
        success: false,
        cancelled: false,
    };
    const CANCELLED: Self = Self {
        success: false,
        cancelled: true,
    };
}

#[derive(Debug, Clone)]
pub struct PlaybookRunner {
    playbook: Playbook,
    env_overrides: BTreeMap<String, String>,
    shell: String,
    stop_grace: Duration,
}

impl PlaybookRunner {
    #[must_use]
    pub fn new(playbook: Playbook) -> Self {
        Self {
            playbook,
            env_overrides: BTreeMap::new(),
            shell: DEFAULT_SHELL.to_owned(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Extra environment for every step; wins over inherited variables.
    #[must_use]
    pub fn env_overrides(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.env_overrides = overrides;
        self
    }

    #[must_use]
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    #[must_use]
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Spawns the run on its own task. Must be called inside a tokio runtime.
    pub fn start(self) -> (RunHandle, mpsc::UnboundedReceiver<RunEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(events_tx, stop_rx));
        let handle = RunHandle {
            run_id: new_run_id(),
            stop_tx,
            task,
        };
        (handle, events_rx)
    }

    async fn run(
        self,
        events: mpsc::UnboundedSender<RunEvent>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> RunOutcome {
        let name = self.playbook.name.as_str();
        info!(playbook = name, steps = self.playbook.steps.len(), "playbook run started");

        for (index, step) in self.playbook.steps.iter().enumerate() {
            if *stop_rx.borrow() {
                info!(playbook = name, "playbook stopped before step {index}");
                return finish(&events, RunOutcome::CANCELLED);
            }

            debug!(playbook = name, step = %step.name, "step started");
            emit(
                &events,
                RunEvent::StepStarted {
                    index,
                    name: step.name.clone(),
                },
            );

            let exit = match self.run_step(step, &events, &mut stop_rx).await {
                Ok(exit) => exit,
                Err(e) => {
                    error!(playbook = name, "step {index} ({}) error: {e:#}", step.name);
                    emit(&events, RunEvent::LogLine(format!("Error: {e:#}")));
                    StepExit::Failed
                }
            };

            let success = exit == StepExit::Succeeded;
            emit(&events, RunEvent::StepFinished { index, success });
            match exit {
                StepExit::Succeeded => {}
                StepExit::Failed => {
                    info!(playbook = name, "step {index} ({}) failed", step.name);
                    return finish(&events, RunOutcome::FAILED);
                }
                StepExit::Stopped => {
                    info!(playbook = name, "playbook stopped during step {index}");
                    return finish(&events, RunOutcome::CANCELLED);
                }
            }
        }

        info!(playbook = name, "playbook run succeeded");
        finish(&events, RunOutcome::SUCCEEDED)
    }

    async fn run_step(
        &self,
        step: &Step,
        events: &mpsc::UnboundedSender<RunEvent>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<StepExit> {
        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&step.run)
            .current_dir(&self.playbook.cwd)
            .env("PYTHONUNBUFFERED", "1")
            .envs(&self.env_overrides)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        // Own process group, so a stop reaches everything the step started.
        #[cfg(unix)]
        cmd.process_group(0);
        let mut output = merged_output(&mut cmd).context("failed to create output pipe")?;

        let spawned = cmd.spawn();
        // The command still holds the pipe's write ends; EOF needs them gone.
        drop(cmd);
        let mut child = spawned.with_context(|| {
            format!(
                "failed to start '{}' in {}",
                self.shell,
                self.playbook.cwd.display()
            )
        })?;
        let mut output_done = false;
        let mut stop_closed = false;

        loop {
            tokio::select! {
                biased;

                changed = stop_rx.changed(), if !stop_closed => match changed {
                    Ok(()) => {
                        if *stop_rx.borrow_and_update() {
                            self.terminate(&mut child).await;
                            return Ok(StepExit::Stopped);
                        }
                    }
                    // Handle dropped: nobody can ask for a stop any more.
                    Err(_) => stop_closed = true,
                },
                segment = output.next_segment(), if !output_done => {
                    match segment.context("failed to read step output")? {
                        Some(bytes) => emit(events, RunEvent::LogLine(decode_line(&bytes))),
                        None => output_done = true,
                    }
                }
                status = child.wait(), if output_done => {
                    let status = status.context("failed to wait for step")?;
                    debug!(step = %step.name, ?status, "step exited");
                    return Ok(if status.code() == Some(0) {
                        StepExit::Succeeded
                    } else {
                        StepExit::Failed
                    });
                }
            }
        }
    }

    async fn terminate(&self, child: &mut Child) {
        let Some(pid) = child.id() else {
            return;
        };
        info!(pid, "terminating step");
        if signal_group(pid, "TERM").await {
            match tokio::time::timeout(self.stop_grace, child.wait()).await {
                Ok(_) => return,
                Err(_) => warn!(pid, grace = ?self.stop_grace, "step ignored SIGTERM, killing"),
            }
            let _ = signal_group(pid, "KILL").await;
        }
        if let Err(e) = child.kill().await {
            warn!(pid, "failed to kill step: {e}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepExit {
    Succeeded,
    Failed,
    Stopped,
}

#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Cooperative stop; idempotent, and a no-op once the run has finished.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> RunOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(run_id = %self.run_id, "playbook run join error: {e}");
                RunOutcome::FAILED
            }
        }
    }
}

/// stdout and stderr of a step share one pipe, so lines arrive in the order
/// the step wrote them.
#[cfg(unix)]
struct MergedOutput(tokio::io::Split<BufReader<tokio::net::unix::pipe::Receiver>>);

#[cfg(unix)]
impl MergedOutput {
    async fn next_segment(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        self.0.next_segment().await
    }
}

#[cfg(unix)]
fn merged_output(cmd: &mut tokio::process::Command) -> std::io::Result<MergedOutput> {
    let (reader, writer) = std::io::pipe()?;
    cmd.stdout(writer.try_clone()?).stderr(writer);
    let receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(reader.into())?;
    Ok(MergedOutput(BufReader::new(receiver).split(b'\n')))
}

#[cfg(not(unix))]
struct MergedOutput(mpsc::UnboundedReceiver<std::io::Result<Vec<u8>>>);

#[cfg(not(unix))]
impl MergedOutput {
    async fn next_segment(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        self.0.recv().await.transpose()
    }
}

#[cfg(not(unix))]
fn merged_output(cmd: &mut tokio::process::Command) -> std::io::Result<MergedOutput> {
    use std::io::BufRead as _;

    let (reader, writer) = std::io::pipe()?;
    cmd.stdout(writer.try_clone()?).stderr(writer);
    let (tx, rx) = mpsc::unbounded_channel();
    // No async pipe type here; a blocking reader feeds the channel instead.
    tokio::task::spawn_blocking(move || {
        for segment in std::io::BufReader::new(reader).split(b'\n') {
            let failed = segment.is_err();
            if tx.send(segment).is_err() || failed {
                break;
            }
        }
    });
    Ok(MergedOutput(rx))
}

fn finish(events: &mpsc::UnboundedSender<RunEvent>, outcome: RunOutcome) -> RunOutcome {
    emit(
        events,
        RunEvent::RunFinished {
            success: outcome.success,
            cancelled: outcome.cancelled,
        },
    );
    outcome
}

fn emit(events: &mpsc::UnboundedSender<RunEvent>, event: RunEvent) {
    // The run carries on even if nobody is listening.
    let _ = events.send(event);
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(unix)]
async fn signal_group(pid: u32, signal: &str) -> bool {
    // The child leads its own process group, so -pid addresses all of it.
    tokio::process::Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|s| s.success())
}

#[cfg(not(unix))]
async fn signal_group(_pid: u32, _signal: &str) -> bool {
    false
}

#[must_use]
pub fn new_run_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    let short: String = id.chars().take(6).collect();
    format!("run-{short}")
}
