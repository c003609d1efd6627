//! Bounded in-memory work queue with a fixed worker pool.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::model::WorkItem;
use crate::config::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKER_COUNT};
use crate::{Error, Result};

/// Processes a single work item.
///
/// Long-running operations must honor `cancel`; it descends from the queue's
/// root token (async path) or the request (sync path).
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, cancel: &CancellationToken, item: &WorkItem) -> Result<()>;
}

struct QueueState {
    tx: Option<mpsc::Sender<WorkItem>>,
    tasks: Option<JoinSet<()>>,
    started: bool,
    shut_down: bool,
}

/// Bounded FIFO of [`WorkItem`]s consumed by a fixed set of worker tasks.
///
/// `enqueue` is offer-or-reject: at capacity it fails immediately with
/// [`Error::QueueFull`]. Workers invoke the processor and then the item's
/// cleanup handle exactly once, regardless of outcome.
pub struct Queue {
    capacity: usize,
    workers: usize,
    state: Mutex<QueueState>,
    cancel: CancellationToken,
}

impl Queue {
    /// Create a queue; non-positive capacity or worker count fall back to the
    /// defaults (128 and 4).
    pub fn new(capacity: usize, workers: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            capacity
        };
        let workers = if workers == 0 {
            DEFAULT_WORKER_COUNT
        } else {
            workers
        };
        Self {
            capacity,
            workers,
            state: Mutex::new(QueueState {
                tx: None,
                tasks: None,
                started: false,
                shut_down: false,
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// Root cancellation token observed by workers and processors.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Launch the worker tasks. Starting twice is an error.
    pub fn start(&self, processor: Arc<dyn JobProcessor>) -> Result<()> {
        let mut state = self.state.lock().expect("queue state poisoned");
        if state.started {
            return Err(Error::QueueAlreadyStarted);
        }

        let (tx, rx) = mpsc::channel::<WorkItem>(self.capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut tasks = JoinSet::new();
        for idx in 0..self.workers {
            let rx = rx.clone();
            let cancel = self.cancel.clone();
            let processor = processor.clone();
            tasks.spawn(async move {
                worker_loop(idx, rx, cancel, processor).await;
            });
        }

        state.tx = Some(tx);
        state.tasks = Some(tasks);
        state.started = true;
        info!(workers = self.workers, capacity = self.capacity, "queue started");
        Ok(())
    }

    /// Offer a work item; fails before `start` and when at capacity.
    ///
    /// On failure the item is dropped here, which releases its staged upload
    /// through the cleanup handle's drop path.
    pub fn enqueue(&self, item: WorkItem) -> Result<()> {
        let state = self.state.lock().expect("queue state poisoned");
        let tx = state.tx.as_ref().ok_or(Error::QueueNotStarted)?;
        match tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::QueueNotStarted),
        }
    }

    /// Stop intake, cancel the root token, and wait for in-flight workers up
    /// to `grace`. A zero grace waits indefinitely. Idempotent: later calls
    /// return immediately.
    pub async fn shutdown(&self, grace: Duration) {
        let tasks = {
            let mut state = self.state.lock().expect("queue state poisoned");
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            // Dropping the sender closes intake; undelivered items are dropped
            // with their cleanup handles.
            state.tx = None;
            state.tasks.take()
        };

        self.cancel.cancel();

        let Some(mut tasks) = tasks else { return };
        let join_all = async {
            while tasks.join_next().await.is_some() {}
        };

        if grace.is_zero() {
            join_all.await;
            info!("queue stopped");
            return;
        }
        if tokio::time::timeout(grace, join_all).await.is_err() {
            warn!("queue shutdown deadline reached; workers may still be running");
        } else {
            info!("queue stopped");
        }
    }
}

async fn recv_next(rx: &tokio::sync::Mutex<mpsc::Receiver<WorkItem>>) -> Option<WorkItem> {
    rx.lock().await.recv().await
}

async fn worker_loop(
    idx: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    cancel: CancellationToken,
    processor: Arc<dyn JobProcessor>,
) {
    debug!(worker = idx, "worker started");
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(worker = idx, "worker stopping due to cancellation");
                break;
            }
            item = recv_next(&rx) => match item {
                Some(item) => item,
                None => {
                    debug!(worker = idx, "queue closed, worker exiting");
                    break;
                }
            },
        };

        let mut item = item;
        let job_id = item.job.id.clone();
        info!(worker = idx, %job_id, stage = %item.job.stage, "processing job");
        let start = Instant::now();
        match processor.process(&cancel, &item).await {
            Ok(()) => {
                info!(worker = idx, %job_id, duration = ?start.elapsed(), "job processed");
            }
            Err(e) => {
                error!(worker = idx, %job_id, error = %e, duration = ?start.elapsed(), "job processing failed");
            }
        }
        // Cleanup runs exactly once regardless of outcome.
        if let Some(mut cleanup) = item.cleanup.take() {
            if let Err(e) = cleanup.cleanup() {
                warn!(worker = idx, %job_id, error = %e, "cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::Job;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProcessor {
        count: AtomicUsize,
        delay: Duration,
    }

    impl CountingProcessor {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                count: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl JobProcessor for CountingProcessor {
        async fn process(&self, cancel: &CancellationToken, _item: &WorkItem) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Canceled),
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Ignores cancellation; used to observe the shutdown join behavior.
    struct SleepingProcessor {
        count: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl JobProcessor for SleepingProcessor {
        async fn process(&self, _cancel: &CancellationToken, _item: &WorkItem) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn item(id: &str) -> WorkItem {
        WorkItem::new(Job::new(id, "/tmp/x.png", "image/png", "t"), None)
    }

    #[tokio::test]
    async fn enqueue_before_start_fails() {
        let queue = Queue::new(2, 1);
        assert!(matches!(
            queue.enqueue(item("a")),
            Err(Error::QueueNotStarted)
        ));
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let queue = Queue::new(2, 1);
        let p = CountingProcessor::new(Duration::ZERO);
        queue.start(p.clone()).unwrap();
        assert!(matches!(
            queue.start(p),
            Err(Error::QueueAlreadyStarted)
        ));
        queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn processes_enqueued_items() {
        let queue = Queue::new(4, 2);
        let p = CountingProcessor::new(Duration::ZERO);
        queue.start(p.clone()).unwrap();

        for i in 0..4 {
            queue.enqueue(item(&format!("job-{i}"))).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(p.count.load(Ordering::SeqCst), 4);
        queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn full_queue_rejects_immediately() {
        let queue = Queue::new(1, 1);
        let p = CountingProcessor::new(Duration::from_secs(5));
        queue.start(p).unwrap();

        // First item occupies the single worker, second fills the buffer.
        queue.enqueue(item("busy")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.enqueue(item("buffered")).unwrap();
        assert!(matches!(queue.enqueue(item("extra")), Err(Error::QueueFull)));

        queue.shutdown(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let queue = Queue::new(2, 1);
        let p = CountingProcessor::new(Duration::ZERO);
        queue.start(p).unwrap();
        queue.shutdown(Duration::from_secs(1)).await;
        // Second call is a no-op.
        queue.shutdown(Duration::from_secs(1)).await;
        assert!(matches!(
            queue.enqueue(item("late")),
            Err(Error::QueueNotStarted)
        ));
    }

    #[tokio::test]
    async fn shutdown_deadline_bounds_wait() {
        let queue = Queue::new(2, 1);
        let p = Arc::new(SleepingProcessor {
            count: AtomicUsize::new(0),
            delay: Duration::from_secs(10),
        });
        queue.start(p).unwrap();
        queue.enqueue(item("slow")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = Instant::now();
        queue.shutdown(Duration::from_millis(50)).await;
        let elapsed = start.elapsed();
        assert!(
            elapsed < Duration::from_millis(500),
            "shutdown took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn long_grace_lets_in_flight_job_finish() {
        let queue = Queue::new(2, 1);
        let p = Arc::new(SleepingProcessor {
            count: AtomicUsize::new(0),
            delay: Duration::from_millis(100),
        });
        queue.start(p.clone()).unwrap();
        queue.enqueue(item("inflight")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.shutdown(Duration::from_secs(5)).await;
        assert_eq!(p.count.load(Ordering::SeqCst), 1);
    }
}
