//! The job processor: drives one job from PENDING to a terminal state.
//!
//! ```text
//! start ──▶ download ──▶ dispatch by MIME type ──▶ complete
//!   │                     ├─ image/*          → single page
//!   │                     ├─ application/pdf  → every page (or first only)
//!   │                     └─ other            → unsupported
//!   └── any error or panic ────────────────────────▶ fail(user message)
//! ```
//!
//! Pipeline work runs in its own task so that a panic anywhere inside it is
//! observed as a `JoinError` and still ends the job FAILED.

use crate::config::IngestConfig;
use crate::error::{IngestError, LifecycleError};
use crate::jobs::manager::JobManager;
use crate::jobs::state::ExtractionJob;
use crate::output::ExtractionResult;
use crate::pipeline::aggregate::{extract_all, AggregateOptions};
use crate::pipeline::encode::decode_upload;
use crate::pipeline::llm::VisionExtractor;
use crate::pipeline::render::RenderChain;
use crate::progress::ProgressSink;
use crate::projects::ProjectCatalog;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const PANIC_MESSAGE: &str = "An unexpected error occurred while analyzing the document.";

/// How a document of a given MIME type is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Image,
    MultiPage,
    FirstPage,
}

impl ProcessingMode {
    pub fn for_mime(mime_type: &str, multi_page: bool) -> Result<Self, IngestError> {
        let mime = mime_type.trim().to_ascii_lowercase();
        if mime.starts_with("image/") {
            Ok(Self::Image)
        } else if mime == "application/pdf" || mime == "application/x-pdf" {
            Ok(if multi_page { Self::MultiPage } else { Self::FirstPage })
        } else {
            Err(IngestError::UnsupportedMimeType {
                mime_type: mime_type.to_string(),
            })
        }
    }
}

#[derive(Clone)]
pub struct JobProcessor {
    manager: JobManager,
    chain: RenderChain,
    extractor: VisionExtractor,
    catalog: Arc<dyn ProjectCatalog>,
    config: IngestConfig,
}

impl JobProcessor {
    pub fn new(
        manager: JobManager,
        chain: RenderChain,
        extractor: VisionExtractor,
        catalog: Arc<dyn ProjectCatalog>,
        config: IngestConfig,
    ) -> Self {
        Self {
            manager,
            chain,
            extractor,
            catalog,
            config,
        }
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    /// Process one job to completion. Never leaves it PROCESSING.
    ///
    /// Returns the job's final record, or the lifecycle error that prevented
    /// it from starting.
    pub async fn process(
        &self,
        job_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<ExtractionJob, LifecycleError> {
        let job = match self.manager.start(job_id).await {
            Ok(job) => job,
            Err(LifecycleError::FileDeleted | LifecycleError::StorageUnavailable) => {
                return self.manager.get(job_id).await
            }
            Err(e) => {
                warn!("Job {} not started: {}", job_id, e);
                return Err(e);
            }
        };

        let this = self.clone();
        let run = tokio::spawn(async move { this.run(job, cancel).await });

        let outcome = match run.await {
            Ok(Ok(result)) => self.manager.complete(job_id, result).await,
            Ok(Err(e)) => {
                error!("Job {} failed: {}", job_id, e);
                self.manager.fail(job_id, &e.user_message()).await
            }
            Err(join) => {
                error!("Job {} panicked: {}", job_id, join);
                self.manager.fail(job_id, PANIC_MESSAGE).await
            }
        };

        match outcome {
            Ok(job) => Ok(job),
            // Reclaimed while we were working.
            Err(LifecycleError::IllegalTransition { .. } | LifecycleError::Conflict(_)) => {
                warn!("Job {} changed underneath the worker", job_id);
                self.manager.get(job_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn run(
        &self,
        job: ExtractionJob,
        cancel: CancellationToken,
    ) -> Result<ExtractionResult, IngestError> {
        let mode = ProcessingMode::for_mime(&job.mime_type, self.config.multi_page)?;
        let bytes = self.manager.documents().download(&job.storage_path).await?;
        let projects = self.catalog.projects_for(job.user_id).await;
        info!(
            "Job {}: {:?} processing of '{}' ({} bytes, {} known projects)",
            job.id,
            mode,
            job.file_name,
            bytes.len(),
            projects.len()
        );

        match mode {
            ProcessingMode::Image => {
                let image = decode_upload(&bytes)?;
                let data = self.extractor.extract_page(1, &image, &projects).await?;
                Ok(ExtractionResult::single_page(1, data))
            }
            ProcessingMode::FirstPage => {
                let image = self.chain.first_page(&bytes).await?;
                let page_count = self.chain.page_count(&bytes).await.max(1);
                let data = self.extractor.extract_page(1, &image, &projects).await?;
                Ok(ExtractionResult::single_page(page_count, data))
            }
            ProcessingMode::MultiPage => {
                let (tx, forwarder) = self.progress_forwarder(job.id);
                let options = AggregateOptions::from_config(&self.config)
                    .cancel(cancel)
                    .on_progress(ProgressSink::new(move |done: usize, total: usize| {
                        let _ = tx.send((done, total));
                    }));

                let result = extract_all(&self.chain, &self.extractor, &bytes, &projects, &options).await;
                // Closing the sink lets the forwarder drain and exit before completion.
                drop(options);
                if let Err(e) = forwarder.await {
                    warn!("Job {}: progress forwarder ended abnormally: {}", job.id, e);
                }
                result
            }
        }
    }

    /// Progress events are sent synchronously from the aggregator and
    /// written to the store in order by a dedicated task.
    fn progress_forwarder(
        &self,
        job_id: Uuid,
    ) -> (mpsc::UnboundedSender<(usize, usize)>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, usize)>();
        let manager = self.manager.clone();
        let handle = tokio::spawn(async move {
            while let Some((done, total)) = rx.recv().await {
                if let Err(e) = manager.report_progress(job_id, done, total).await {
                    debug!("Job {}: progress {}/{} not written: {}", job_id, done, total, e);
                }
            }
        });
        (tx, handle)
    }
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProcessor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_dispatch() {
        assert_eq!(ProcessingMode::for_mime("image/png", true).unwrap(), ProcessingMode::Image);
        assert_eq!(ProcessingMode::for_mime("IMAGE/JPEG", false).unwrap(), ProcessingMode::Image);
        assert_eq!(
            ProcessingMode::for_mime("application/pdf", true).unwrap(),
            ProcessingMode::MultiPage
        );
        assert_eq!(
            ProcessingMode::for_mime("application/pdf", false).unwrap(),
            ProcessingMode::FirstPage
        );
        let err = ProcessingMode::for_mime("application/zip", true).unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedMimeType { .. }));
    }
}
