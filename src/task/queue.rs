#![forbid(unsafe_code)]

//! Background task submission.
//!
//! Every submission goes through one worker task that owns the backend, so
//! payloads are handled strictly one at a time and in the order they were
//! enqueued. The caller never waits on the network; results come back as
//! [`QueueEvent`]s on the channel returned by [`TaskQueue::spawn`].

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::CtrlLordError;
use crate::task::backend::TaskBackend;
use crate::task::model::{TaskPayload, TaskResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Completed(TaskResult),
    /// The payload is handed back untouched; resubmitting is up to the caller.
    Failed {
        error: String,
        payload: TaskPayload,
    },
    ReloadFailed {
        error: String,
    },
}

#[derive(Debug)]
enum Command {
    Submit(TaskPayload),
    Reload(Box<Config>),
    Stop,
}

/// Cheap, cloneable producer side of a [`TaskQueue`].
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl QueueSender {
    pub fn enqueue(&self, payload: TaskPayload) -> Result<(), CtrlLordError> {
        debug!(summary = %payload.summary, "enqueue task");
        self.send(Command::Submit(payload))
    }

    /// Applied by the worker after everything already queued.
    pub fn reload(&self, cfg: Config) -> Result<(), CtrlLordError> {
        self.send(Command::Reload(Box::new(cfg)))
    }

    /// Graceful drain: the worker exits once it reaches this point in the FIFO.
    pub fn stop(&self) -> Result<(), CtrlLordError> {
        self.send(Command::Stop)
    }

    fn send(&self, cmd: Command) -> Result<(), CtrlLordError> {
        self.tx.send(cmd).map_err(|_| CtrlLordError::QueueClosed)
    }
}

#[derive(Debug)]
pub struct TaskQueue {
    sender: QueueSender,
    worker: JoinHandle<()>,
}

impl TaskQueue {
    /// Starts the worker. Must be called inside a tokio runtime.
    pub fn spawn(backend: Box<dyn TaskBackend>) -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(backend, rx, events_tx));
        let queue = Self {
            sender: QueueSender { tx },
            worker,
        };
        (queue, events_rx)
    }

    #[must_use]
    pub fn sender(&self) -> QueueSender {
        self.sender.clone()
    }

    pub fn enqueue(&self, payload: TaskPayload) -> Result<(), CtrlLordError> {
        self.sender.enqueue(payload)
    }

    pub fn reload(&self, cfg: Config) -> Result<(), CtrlLordError> {
        self.sender.reload(cfg)
    }

    pub fn stop(&self) -> Result<(), CtrlLordError> {
        self.sender.stop()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Waits for the worker to exit (after [`stop`](Self::stop) or once every
    /// sender is dropped).
    pub async fn join(self) {
        let Self { sender, worker } = self;
        drop(sender);
        if let Err(e) = worker.await {
            error!("task queue worker join error: {e}");
        }
    }
}

async fn run_worker(
    mut backend: Box<dyn TaskBackend>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<QueueEvent>,
) {
    info!(backend = backend.name(), "task queue worker started");
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Submit(payload) => match backend.submit(&payload).await {
                Ok(result) => {
                    info!(key = %result.key, "task submitted");
                    emit(&events, QueueEvent::Completed(result));
                }
                Err(e) => {
                    error!(summary = %payload.summary, "background task submission failed: {e:#}");
                    emit(
                        &events,
                        QueueEvent::Failed {
                            error: format!("{e:#}"),
                            payload,
                        },
                    );
                }
            },
            Command::Reload(cfg) => {
                if let Err(e) = backend.reload(&cfg) {
                    warn!(backend = backend.name(), "backend reload failed: {e:#}");
                    emit(
                        &events,
                        QueueEvent::ReloadFailed {
                            error: format!("{e:#}"),
                        },
                    );
                }
            }
            Command::Stop => {
                info!("task queue worker received stop, exiting");
                return;
            }
        }
    }
    info!("task queue closed, worker exiting");
}

fn emit(events: &mpsc::UnboundedSender<QueueEvent>, event: QueueEvent) {
    if events.send(event).is_err() {
        debug!("queue event dropped: receiver gone");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct EchoBackend;

    #[async_trait]
    impl TaskBackend for EchoBackend {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn submit(&mut self, payload: &TaskPayload) -> anyhow::Result<TaskResult> {
            Ok(TaskResult::from_payload(
                payload,
                format!("ECHO-{}", payload.summary),
                String::new(),
            ))
        }

        fn reload(&mut self, _cfg: &Config) -> anyhow::Result<()> {
            anyhow::bail!("echo backend has nothing to reload")
        }
    }

    fn payload(summary: &str) -> TaskPayload {
        TaskPayload::new(summary, "", "Task", "").unwrap()
    }

    #[tokio::test]
    async fn commands_after_stop_are_never_processed() {
        let (queue, mut events) = TaskQueue::spawn(Box::new(EchoBackend));
        let sender = queue.sender();
        sender.enqueue(payload("a")).unwrap();
        sender.stop().unwrap();
        // Queued behind the sentinel: accepted by the channel, never handled.
        let _ = sender.enqueue(payload("b"));
        queue.join().await;

        let mut keys = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let QueueEvent::Completed(r) = ev {
                keys.push(r.key);
            }
        }
        assert_eq!(keys, vec!["ECHO-a"]);
        assert!(matches!(
            sender.enqueue(payload("c")),
            Err(CtrlLordError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn reload_failure_is_reported_and_queue_continues() {
        let (queue, mut events) = TaskQueue::spawn(Box::new(EchoBackend));
        queue.reload(Config::default()).unwrap();
        queue.enqueue(payload("after")).unwrap();
        queue.stop().unwrap();
        queue.join().await;

        assert!(matches!(
            events.recv().await,
            Some(QueueEvent::ReloadFailed { .. })
        ));
        assert!(matches!(events.recv().await, Some(QueueEvent::Completed(_))));
        assert!(events.recv().await.is_none());
    }
}
