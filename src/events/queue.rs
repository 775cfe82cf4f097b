use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::events::IntegrationEvent;
use crate::sync::{DynSynchronizationApi, RetryConfig};

/// Ordered, drainable channel carrying lifecycle events to the
/// synchronization job.
///
/// `enqueue` is non-blocking and totally ordered per producer; a single
/// worker posts the next event only after the previous post has completed.
/// Post failures are retried with bounded exponential backoff and then
/// dropped with a local warning — they never surface to the producer.
pub struct EventPublishingQueue {
    tx: mpsc::UnboundedSender<IntegrationEvent>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventPublishingQueue {
    pub fn start(
        api: DynSynchronizationApi,
        job_id: impl Into<String>,
        retry: RetryConfig,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<IntegrationEvent>();
        let pending = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());

        let worker = tokio::spawn({
            let pending = pending.clone();
            let idle = idle.clone();
            let job_id = job_id.into();
            async move {
                while let Some(event) = rx.recv().await {
                    post_with_retry(&api, &job_id, &event, &retry).await;
                    if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                        idle.notify_waiters();
                    }
                }
            }
        });

        Arc::new(Self {
            tx,
            pending,
            idle,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn enqueue(&self, event: IntegrationEvent) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(send_err) = self.tx.send(event) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(event = %send_err.0.name, "event queue closed; dropping event");
        }
    }

    /// Resolves once the queue is empty and no post is in flight.
    pub async fn on_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Drains outstanding events, then stops the worker.
    pub async fn close(&self) {
        self.on_idle().await;
        if let Some(handle) = self.worker.lock().await.take() {
            handle.abort();
        }
    }
}

async fn post_with_retry(
    api: &DynSynchronizationApi,
    job_id: &str,
    event: &IntegrationEvent,
    retry: &RetryConfig,
) {
    for attempt in 0..retry.max_attempts.max(1) {
        match api.publish_event(job_id, event).await {
            Ok(()) => return,
            Err(err) if !err.is_retryable() => {
                tracing::warn!(event = %event.name, error = %err, "dropping event after non-retriable failure");
                return;
            }
            Err(err) => {
                if attempt + 1 >= retry.max_attempts.max(1) {
                    tracing::warn!(
                        event = %event.name,
                        error = %err,
                        attempts = retry.max_attempts,
                        "dropping event after exhausting retries"
                    );
                    return;
                }
                tokio::time::sleep(Duration::from_millis(retry.backoff_ms(attempt))).await;
            }
        }
    }
}
