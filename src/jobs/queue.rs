//! In-process task queue and periodic maintenance.
//!
//! ```text
//! enqueue(id) ──▶ mpsc ──▶ dispatcher ──▶ Semaphore(max_concurrent_jobs) ──▶ JobProcessor::process
//!                              ▲
//!                  shutdown ───┘ cancel token (in-flight jobs stop between page batches)
//! ```
//!
//! Queue state is process-local: ids enqueued but not yet dispatched when the
//! process exits stay PENDING in the store.

use crate::error::IngestError;
use crate::jobs::manager::JobManager;
use crate::jobs::worker::JobProcessor;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Hands submitted jobs to background processing.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job_id: Uuid) -> Result<(), IngestError>;
}

pub struct InProcessQueue {
    tx: mpsc::UnboundedSender<Uuid>,
    cancel: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessQueue {
    /// Spawn the dispatcher. At most `max_concurrent_jobs` jobs run at once.
    pub fn start(processor: JobProcessor, max_concurrent_jobs: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch(
            processor,
            rx,
            Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            cancel.clone(),
        ));
        Self {
            tx,
            cancel,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Token cancelled on shutdown; child tokens are handed to each job.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop accepting work, cancel in-flight jobs and wait for them to settle.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Queue dispatcher ended abnormally: {}", e);
            }
        }
        info!("Job queue shut down");
    }
}

#[async_trait]
impl JobQueue for InProcessQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<(), IngestError> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        self.tx.send(job_id).map_err(|_| IngestError::Cancelled)?;
        debug!("Job {} queued", job_id);
        Ok(())
    }
}

impl std::fmt::Debug for InProcessQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessQueue")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

async fn dispatch(
    processor: JobProcessor,
    mut rx: mpsc::UnboundedReceiver<Uuid>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let mut running = JoinSet::new();
    loop {
        let job_id = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(id) => id,
                None => break,
            },
            // Reap finished jobs so the set does not grow unbounded.
            Some(_) = running.join_next(), if !running.is_empty() => continue,
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let processor = processor.clone();
        let token = cancel.child_token();
        running.spawn(async move {
            let _permit = permit;
            if let Err(e) = processor.process(job_id, token).await {
                warn!("Job {} was not processed: {}", job_id, e);
            }
        });
    }

    rx.close();
    while running.join_next().await.is_some() {}
}

/// Periodically fail PROCESSING jobs older than `stuck_timeout`.
pub fn spawn_reclaimer(
    manager: JobManager,
    every: Duration,
    stuck_timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = manager.reclaim_stuck(stuck_timeout).await {
                        warn!("Stuck-job sweep failed: {}", e);
                    }
                }
            }
        }
        debug!("Reclaimer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::manager::STUCK_JOB_MESSAGE;
    use crate::jobs::state::{JobStatus, SubmitRequest};
    use crate::jobs::store::{JobStore, MemoryJobStore};
    use crate::notify::NotificationDispatcher;
    use crate::pipeline::input::FsDocumentStore;
    use chrono::Utc;

    async fn processing_job(manager: &JobManager, store: &MemoryJobStore, age: chrono::Duration) -> Uuid {
        let id = manager
            .submit(SubmitRequest {
                file_name: "plan.pdf".into(),
                mime_type: "application/pdf".into(),
                storage_path: "plan.pdf".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let started = manager.start(id).await.unwrap();
        let mut aged = started.clone();
        aged.started_at = Some(Utc::now() - age);
        store.compare_and_swap(aged, started.version).await.unwrap();
        id
    }

    #[tokio::test(start_paused = true)]
    async fn reclaimer_fails_stuck_jobs_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let manager = JobManager::new(
            store.clone(),
            Arc::new(FsDocumentStore::new(dir.path())),
            NotificationDispatcher::default(),
        );
        let stuck = processing_job(&manager, &store, chrono::Duration::minutes(20)).await;
        let fresh = processing_job(&manager, &store, chrono::Duration::minutes(1)).await;

        let cancel = CancellationToken::new();
        let handle = spawn_reclaimer(
            manager.clone(),
            Duration::from_secs(60),
            Duration::from_secs(15 * 60),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_secs(61)).await;

        let job = manager.get(stuck).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(STUCK_JOB_MESSAGE));
        assert_eq!(manager.get(fresh).await.unwrap().status, JobStatus::Processing);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reclaimer stops on cancel")
            .unwrap();
    }
}
