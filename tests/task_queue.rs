use async_trait::async_trait;
use ctrllord::config::Config;
use ctrllord::task::backend::{JsonBackend, TaskBackend};
use ctrllord::task::model::{TaskPayload, TaskResult};
use ctrllord::task::queue::{QueueEvent, TaskQueue};
use ctrllord::task::storage::TaskStorage;
use tokio::sync::mpsc;

fn payload(summary: &str) -> TaskPayload {
    TaskPayload::new(summary, format!("about {summary}"), "Task", "").unwrap()
}

async fn drain(mut events: mpsc::UnboundedReceiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut out = Vec::new();
    while let Some(ev) = events.recv().await {
        out.push(ev);
    }
    out
}

/// Fails every submission whose 1-based position is in `fail_at`.
struct FlakyBackend {
    seen: usize,
    fail_at: Vec<usize>,
}

#[async_trait]
impl TaskBackend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn submit(&mut self, payload: &TaskPayload) -> anyhow::Result<TaskResult> {
        self.seen += 1;
        if self.fail_at.contains(&self.seen) {
            anyhow::bail!("tracker rejected submission {}", self.seen);
        }
        Ok(TaskResult::from_payload(
            payload,
            format!("FLAKY-{}", self.seen),
            String::new(),
        ))
    }

    fn reload(&mut self, _cfg: &Config) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn submissions_complete_in_fifo_order() {
    let td = tempfile::tempdir().unwrap();
    let backend = JsonBackend::new(TaskStorage::new(td.path().to_path_buf()));
    let (queue, events) = TaskQueue::spawn(Box::new(backend));

    let summaries: Vec<String> = (1..=10).map(|i| format!("task {i}")).collect();
    for s in &summaries {
        queue.enqueue(payload(s)).unwrap();
    }
    queue.stop().unwrap();
    queue.join().await;

    let results: Vec<TaskResult> = drain(events)
        .await
        .into_iter()
        .map(|ev| match ev {
            QueueEvent::Completed(r) => r,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(results.len(), summaries.len());
    for (i, (result, summary)) in results.iter().zip(&summaries).enumerate() {
        assert_eq!(&result.summary, summary);
        assert_eq!(result.description, format!("about {summary}"));
        assert_eq!(result.key, format!("TASK-{}", i + 1));
    }

    let stored = TaskStorage::new(td.path().to_path_buf()).today().unwrap();
    assert_eq!(stored.len(), 10);
}

#[tokio::test]
async fn one_failure_does_not_stop_the_rest() {
    let backend = FlakyBackend {
        seen: 0,
        fail_at: vec![3],
    };
    let (queue, events) = TaskQueue::spawn(Box::new(backend));
    for i in 1..=5 {
        queue.enqueue(payload(&format!("t{i}"))).unwrap();
    }
    queue.stop().unwrap();
    queue.join().await;

    let events = drain(events).await;
    assert_eq!(events.len(), 5);
    for (i, ev) in events.iter().enumerate() {
        if i == 2 {
            let QueueEvent::Failed { error, payload } = ev else {
                panic!("expected failure for t3, got {ev:?}");
            };
            assert!(error.contains("rejected submission 3"));
            assert_eq!(payload.summary, "t3");
        } else {
            assert!(matches!(ev, QueueEvent::Completed(r) if r.summary == format!("t{}", i + 1)));
        }
    }
}

#[tokio::test]
async fn enqueue_from_many_producers_is_all_delivered() {
    let backend = FlakyBackend {
        seen: 0,
        fail_at: Vec::new(),
    };
    let (queue, events) = TaskQueue::spawn(Box::new(backend));

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let sender = queue.sender();
            std::thread::spawn(move || {
                for i in 0..25 {
                    sender.enqueue(payload(&format!("p{p}-{i}"))).unwrap();
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }
    queue.stop().unwrap();
    queue.join().await;

    let events = drain(events).await;
    assert_eq!(events.len(), 100);
    // Per producer, order is preserved.
    for p in 0..4 {
        let prefix = format!("p{p}-");
        let seq: Vec<usize> = events
            .iter()
            .filter_map(|ev| match ev {
                QueueEvent::Completed(r) => r.summary.strip_prefix(&prefix)?.parse().ok(),
                _ => None,
            })
            .collect();
        assert_eq!(seq, (0..25).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn reload_applies_between_queued_submissions() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let backend = JsonBackend::new(TaskStorage::new(first.path().to_path_buf()));
    let (queue, events) = TaskQueue::spawn(Box::new(backend));

    let mut cfg = Config::default();
    cfg.task.data_dir = second.path().to_string_lossy().to_string();

    queue.enqueue(payload("before")).unwrap();
    queue.enqueue(payload("also before")).unwrap();
    queue.reload(cfg).unwrap();
    queue.enqueue(payload("after")).unwrap();
    queue.stop().unwrap();
    queue.join().await;

    let keys: Vec<String> = drain(events)
        .await
        .into_iter()
        .filter_map(|ev| match ev {
            QueueEvent::Completed(r) => Some(r.key),
            _ => None,
        })
        .collect();
    assert_eq!(keys, vec!["TASK-1", "TASK-2", "TASK-1"]);
    assert_eq!(TaskStorage::new(first.path().to_path_buf()).list().unwrap().len(), 2);
    assert_eq!(TaskStorage::new(second.path().to_path_buf()).list().unwrap().len(), 1);
}

#[tokio::test]
async fn dropping_the_queue_lets_the_worker_finish() {
    let backend = FlakyBackend {
        seen: 0,
        fail_at: Vec::new(),
    };
    let (queue, events) = TaskQueue::spawn(Box::new(backend));
    queue.enqueue(payload("last")).unwrap();
    drop(queue);

    let events = drain(events).await;
    assert!(matches!(events.as_slice(), [QueueEvent::Completed(r)] if r.summary == "last"));
}
