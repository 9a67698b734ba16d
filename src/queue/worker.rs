//! The cooperative background worker.
//!
//! A single loop pulls items off the queue and executes them through the
//! extraction engine. Conversational traffic preempts it: `pause()` aborts
//! the running task and the loop idles until `resume()`. An aborted task
//! stays in the queue with its attempt count untouched.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::LlmError;
use crate::extraction::ExtractionEngine;

use super::{QueueItem, TaskQueue, TaskType};

/// Idle interval while paused.
const PAUSED_POLL: Duration = Duration::from_millis(100);
/// Idle interval while the queue is empty.
const EMPTY_POLL: Duration = Duration::from_millis(1000);

pub struct QueueWorker {
    queue: Arc<TaskQueue>,
    extraction: Arc<ExtractionEngine>,
    paused: AtomicBool,
    current: std::sync::Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl QueueWorker {
    pub fn new(queue: Arc<TaskQueue>, extraction: Arc<ExtractionEngine>) -> Self {
        Self {
            queue,
            extraction,
            paused: AtomicBool::new(false),
            current: std::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Begin the worker loop. Idempotent: a second call is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let worker = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            worker.run_loop().await;
        }));
        tracing::info!("Queue worker started");
    }

    /// Preempt: abort the running task and idle until `resume`.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.abort_current();
        tracing::debug!("Queue worker paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        tracing::debug!("Queue worker resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Abort the current task and stop the loop for good.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.abort_current();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Worker loop join error: {}", e);
            }
        }
        tracing::info!("Queue worker stopped");
    }

    fn abort_current(&self) {
        if let Ok(guard) = self.current.lock() {
            if let Some(token) = guard.as_ref() {
                token.cancel();
            }
        }
    }

    async fn idle(&self, period: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(period) => {}
        }
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if self.is_paused() {
                self.idle(PAUSED_POLL).await;
                continue;
            }

            let item = match self.queue.dequeue().await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    self.idle(EMPTY_POLL).await;
                    continue;
                }
                Err(e) => {
                    tracing::error!("Queue dequeue failed: {}", e);
                    self.idle(EMPTY_POLL).await;
                    continue;
                }
            };

            let token = self.shutdown.child_token();
            if let Ok(mut guard) = self.current.lock() {
                *guard = Some(token.clone());
            }

            let result = self.dispatch(&item, &token).await;

            if let Ok(mut guard) = self.current.lock() {
                *guard = None;
            }

            match result {
                Ok(()) => {
                    if let Err(e) = self.queue.complete(&item.id).await {
                        tracing::error!("Failed to complete item {}: {}", item.id, e);
                    }
                }
                Err(e) if is_aborted(&e) => match item.task_type {
                    TaskType::FastScan => {
                        // Aborted fast-scans drop; the staleness sweep will
                        // re-queue the messages if they still matter.
                        tracing::debug!("Fast scan {} aborted, dropping", item.id);
                        if let Err(drop_err) = self.queue.drop_item(&item.id).await {
                            tracing::error!("Failed to drop item {}: {}", item.id, drop_err);
                        }
                    }
                    _ => {
                        // Detail updates and the rest are retryable: leave
                        // the item in place, attempts untouched.
                        tracing::debug!("Task {} aborted, will retry later", item.id);
                    }
                },
                Err(e) => {
                    if let Err(fail_err) = self.queue.fail(&item.id, Some(&e.to_string())).await {
                        tracing::error!("Failed to record failure for {}: {}", item.id, fail_err);
                    }
                }
            }
        }
    }

    async fn dispatch(&self, item: &QueueItem, cancel: &CancellationToken) -> Result<()> {
        tracing::debug!("Worker executing {} item {}", item.task_type.as_str(), item.id);

        match item.task_type {
            TaskType::FastScan => {
                self.extraction
                    .run_fast_scan(item.payload_as()?, cancel)
                    .await
            }
            TaskType::DetailUpdate => {
                self.extraction
                    .run_detail_update(item.payload_as()?, cancel)
                    .await
            }
            TaskType::DescriptionRegen => {
                self.extraction
                    .run_description_regen(item.payload_as()?, cancel)
                    .await
            }
            TaskType::ExposureAnalysis => {
                self.extraction
                    .run_exposure_analysis(item.payload_as()?, cancel)
                    .await
            }
            TaskType::EiValidation => {
                // Never dequeued; the ceremony consumes these.
                tracing::warn!("Validation item {} reached the worker, skipping", item.id);
                Ok(())
            }
        }
    }
}

/// Whether an error chain bottoms out in a cooperative abort.
fn is_aborted(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|cause| matches!(cause.downcast_ref::<LlmError>(), Some(LlmError::Aborted)))
}
