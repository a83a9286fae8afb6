//! Wiring: one value that owns the job store, lifecycle manager, processor,
//! queue and stuck-job reclaimer.
//!
//! Must be constructed inside a Tokio runtime; the queue dispatcher and the
//! reclaimer are spawned immediately.

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::jobs::{
    spawn_reclaimer, ExtractionJob, InProcessQueue, JobManager, JobProcessor, JobQueue, JobStore,
    MemoryJobStore, SubmitRequest,
};
use crate::notify::NotificationDispatcher;
use crate::pipeline::input::DocumentStore;
use crate::pipeline::llm::{LlmVisionModel, VisionExtractor, VisionModel};
use crate::pipeline::render::RenderChain;
use crate::projects::ProjectCatalog;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const RECLAIM_INTERVAL: Duration = Duration::from_secs(60);

/// Collaborators the service is assembled from.
pub struct ServiceParts {
    pub store: Arc<dyn JobStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub catalog: Arc<dyn ProjectCatalog>,
    pub notifications: NotificationDispatcher,
    pub model: Arc<dyn VisionModel>,
    pub chain: RenderChain,
}

pub struct IngestService {
    manager: JobManager,
    queue: InProcessQueue,
    reclaimer_stop: CancellationToken,
    reclaimer: Mutex<Option<JoinHandle<()>>>,
}

impl IngestService {
    pub fn new(config: IngestConfig, parts: ServiceParts) -> Self {
        let manager = JobManager::new(parts.store, parts.documents, parts.notifications);
        let extractor = VisionExtractor::new(parts.model, &config);
        let processor = JobProcessor::new(
            manager.clone(),
            parts.chain,
            extractor,
            parts.catalog,
            config.clone(),
        );
        let queue = InProcessQueue::start(processor, config.max_concurrent_jobs);

        let reclaimer_stop = CancellationToken::new();
        let reclaimer = spawn_reclaimer(
            manager.clone(),
            RECLAIM_INTERVAL.min(config.stuck_job_timeout),
            config.stuck_job_timeout,
            reclaimer_stop.clone(),
        );

        info!(
            "Ingest service started ({} concurrent job(s), {} pages per batch)",
            config.max_concurrent_jobs, config.concurrency
        );
        Self {
            manager,
            queue,
            reclaimer_stop,
            reclaimer: Mutex::new(Some(reclaimer)),
        }
    }

    /// Production wiring: in-memory job store, pdfium → poppler renderer
    /// chain and the configured LLM provider.
    pub fn from_config(
        config: IngestConfig,
        documents: Arc<dyn DocumentStore>,
        catalog: Arc<dyn ProjectCatalog>,
        notifications: NotificationDispatcher,
    ) -> Result<Self, IngestError> {
        let model = Arc::new(LlmVisionModel::from_config(&config)?);
        let chain = RenderChain::from_config(&config);
        Ok(Self::new(
            config,
            ServiceParts {
                store: Arc::new(MemoryJobStore::new()),
                documents,
                catalog,
                notifications,
                model,
                chain,
            },
        ))
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    /// Create a PENDING job and queue it. Returns without waiting for processing.
    ///
    /// A job the queue refuses is failed before the error is returned, so it
    /// never lingers in PENDING.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Uuid, IngestError> {
        let id = self.manager.submit(request).await?;
        if let Err(e) = self.queue.enqueue(id).await {
            warn!("Job {} could not be queued: {}", id, e);
            if let Err(fail) = self.manager.fail(id, &e.user_message()).await {
                warn!("Job {}: could not record queue failure: {}", id, fail);
            }
            return Err(e);
        }
        Ok(id)
    }

    pub async fn job(&self, id: Uuid) -> Result<ExtractionJob, IngestError> {
        Ok(self.manager.get(id).await?)
    }

    /// Poll until the job is COMPLETED or FAILED.
    pub async fn wait_for(&self, id: Uuid, poll: Duration) -> Result<ExtractionJob, IngestError> {
        loop {
            let job = self.manager.get(id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Cancel in-flight work, wait for it to settle and stop the reclaimer.
    ///
    /// Jobs queued but not yet started stay PENDING. Later submissions are
    /// refused.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        self.reclaimer_stop.cancel();
        if let Some(handle) = self.reclaimer.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Reclaimer ended abnormally: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for IngestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestService")
            .field("manager", &self.manager)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
