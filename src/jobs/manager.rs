//! Job lifecycle manager: the only writer of job status.
//!
//! Every operation reads the job, validates the requested transition, and
//! writes the new record with compare-and-swap on `version`. A rejected
//! operation leaves the stored job untouched. Each committed transition is
//! audited; COMPLETED and FAILED additionally notify the owning user.

use crate::error::LifecycleError;
use crate::jobs::state::{Actor, AuditEntry, ExtractionJob, JobStatus, SubmitRequest};
use crate::jobs::store::JobStore;
use crate::notify::{JobOutcome, NotificationDispatcher};
use crate::output::{DocumentMetadata, ExtractionResult};
use crate::pipeline::input::DocumentStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Diagnostic stored on jobs failed by [`JobManager::reclaim_stuck`].
pub const STUCK_JOB_MESSAGE: &str = "Processing exceeded the maximum processing time";

/// Default age after which a PROCESSING job is reclaimed.
pub const DEFAULT_STUCK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Progress writes lost to a concurrent writer are retried this many times.
const PROGRESS_CAS_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn JobStore>,
    documents: Arc<dyn DocumentStore>,
    notifications: NotificationDispatcher,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        documents: Arc<dyn DocumentStore>,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            store,
            documents,
            notifications,
        }
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    /// Create a PENDING job and return its id. Does not start processing.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Uuid, LifecycleError> {
        let actor = Actor::User(request.user_id);
        let job = ExtractionJob::new(request, Utc::now());
        let id = job.id;
        self.store.insert(job.clone()).await?;
        self.audit(&job, None, actor).await;
        info!("Job {} submitted for '{}'", id, job.file_name);
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<ExtractionJob, LifecycleError> {
        self.store.get(id).await?.ok_or(LifecycleError::JobNotFound(id))
    }

    pub async fn audit_trail(&self, id: Uuid) -> Result<Vec<AuditEntry>, LifecycleError> {
        self.store.audit_trail(id).await
    }

    /// PENDING → PROCESSING.
    ///
    /// If the referenced source file no longer exists the job is failed
    /// immediately and [`LifecycleError::FileDeleted`] is returned. When
    /// storage cannot answer, the job is failed with
    /// [`LifecycleError::StorageUnavailable`] instead.
    pub async fn start(&self, id: Uuid) -> Result<ExtractionJob, LifecycleError> {
        let job = self.get(id).await?;
        ensure_transition(job.status, JobStatus::Processing)?;

        if job.file_id.is_some() {
            let rejection = match self.documents.file_exists(&job.storage_path).await {
                Ok(true) => None,
                Ok(false) => {
                    warn!("Job {}: source file '{}' is gone", id, job.storage_path);
                    Some(LifecycleError::FileDeleted)
                }
                Err(e) => {
                    warn!("Job {}: storage check failed: {}", id, e);
                    Some(LifecycleError::StorageUnavailable)
                }
            };
            if let Some(rejection) = rejection {
                self.fail_as(id, &rejection.to_string(), Actor::Worker).await?;
                return Err(rejection);
            }
        }

        let mut next = job.clone();
        next.status = JobStatus::Processing;
        next.started_at = Some(Utc::now());
        let stored = self.store.compare_and_swap(next, job.version).await?;
        self.audit(&stored, Some(job.status), Actor::Worker).await;
        info!("Job {} started", id);
        Ok(stored)
    }

    /// Record pages processed so far. Only valid while PROCESSING.
    ///
    /// `processed` is clamped to `total`; the stored percentage never drops.
    pub async fn report_progress(
        &self,
        id: Uuid,
        processed: usize,
        total: usize,
    ) -> Result<ExtractionJob, LifecycleError> {
        let mut attempt = 0;
        loop {
            let job = self.get(id).await?;
            if job.status != JobStatus::Processing {
                return Err(LifecycleError::NotProcessing { status: job.status });
            }

            let mut processed = processed.max(job.processed_pages);
            if total > 0 {
                processed = processed.min(total);
            }
            let mut next = job.clone();
            next.total_pages = total;
            next.processed_pages = processed;
            next.progress = percent(processed, total).max(job.progress);

            match self.store.compare_and_swap(next, job.version).await {
                Ok(stored) => {
                    debug!("Job {} progress {}% ({}/{})", id, stored.progress, processed, total);
                    return Ok(stored);
                }
                Err(LifecycleError::Conflict(_)) if attempt + 1 < PROGRESS_CAS_ATTEMPTS => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// PROCESSING → COMPLETED with the extraction result.
    pub async fn complete(
        &self,
        id: Uuid,
        result: ExtractionResult,
    ) -> Result<ExtractionJob, LifecycleError> {
        let job = self.get(id).await?;
        ensure_transition(job.status, JobStatus::Completed)?;

        let mut next = job.clone();
        next.status = JobStatus::Completed;
        next.completed_at = Some(Utc::now());
        next.progress = 100;
        next.total_pages = result.page_count;
        next.processed_pages = result.pages.len().min(result.page_count);
        next.error = None;
        next.result = Some(result);
        let stored = self.store.compare_and_swap(next, job.version).await?;
        self.audit(&stored, Some(job.status), Actor::Worker).await;
        info!("Job {} completed ({} page(s))", id, stored.total_pages);

        self.upsert_metadata(&stored).await;
        self.notifications
            .notify(
                stored.user_id,
                JobOutcome::Completed {
                    job_id: id,
                    file_name: stored.file_name.clone(),
                    page_count: stored.total_pages,
                },
            )
            .await;
        Ok(stored)
    }

    /// Any non-terminal status → FAILED.
    pub async fn fail(&self, id: Uuid, message: &str) -> Result<ExtractionJob, LifecycleError> {
        self.fail_as(id, message, Actor::Worker).await
    }

    async fn fail_as(
        &self,
        id: Uuid,
        message: &str,
        actor: Actor,
    ) -> Result<ExtractionJob, LifecycleError> {
        let job = self.get(id).await?;
        ensure_transition(job.status, JobStatus::Failed)?;

        let mut next = job.clone();
        next.status = JobStatus::Failed;
        next.completed_at = Some(Utc::now());
        next.progress = 0;
        next.error = Some(message.to_string());
        let stored = self.store.compare_and_swap(next, job.version).await?;
        self.audit(&stored, Some(job.status), actor).await;
        info!("Job {} failed: {}", id, message);

        self.notifications
            .notify(
                stored.user_id,
                JobOutcome::Failed {
                    job_id: id,
                    file_name: stored.file_name.clone(),
                    error: message.to_string(),
                },
            )
            .await;
        Ok(stored)
    }

    /// Fail every PROCESSING job that started more than `timeout` ago.
    /// Returns the ids reclaimed by this call.
    pub async fn reclaim_stuck(&self, timeout: Duration) -> Result<Vec<Uuid>, LifecycleError> {
        self.reclaim_stuck_at(timeout, Utc::now()).await
    }

    pub async fn reclaim_stuck_at(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, LifecycleError> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| LifecycleError::Store(format!("invalid timeout: {e}")))?;
        let cutoff = now - timeout;

        let mut reclaimed = Vec::new();
        for job in self.store.list_by_status(JobStatus::Processing).await? {
            let stale = job.started_at.map_or(job.created_at < cutoff, |s| s < cutoff);
            if !stale {
                continue;
            }
            match self.fail_as(job.id, STUCK_JOB_MESSAGE, Actor::Reclaimer).await {
                Ok(_) => reclaimed.push(job.id),
                // Finished or reclaimed by someone else in the meantime.
                Err(LifecycleError::Conflict(_) | LifecycleError::IllegalTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if !reclaimed.is_empty() {
            info!("Reclaimed {} stuck job(s)", reclaimed.len());
        }
        Ok(reclaimed)
    }

    async fn upsert_metadata(&self, job: &ExtractionJob) {
        let (Some(file_id), Some(result)) = (job.file_id.as_deref(), job.result.as_ref()) else {
            return;
        };
        match self.documents.file_exists(&job.storage_path).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Job {}: file gone, skipping metadata", job.id);
                return;
            }
            Err(e) => {
                warn!("Job {}: storage check failed, skipping metadata: {}", job.id, e);
                return;
            }
        }
        let metadata = DocumentMetadata::from_result(file_id, result);
        if let Err(e) = self.store.upsert_document_metadata(metadata).await {
            warn!("Job {}: metadata upsert failed: {}", job.id, e);
        }
    }

    async fn audit(&self, job: &ExtractionJob, from: Option<JobStatus>, actor: Actor) {
        let entry = AuditEntry::for_job(job, from, actor, Utc::now());
        if let Err(e) = self.store.record_audit(entry).await {
            warn!("Job {}: audit write failed: {}", job.id, e);
        }
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("notifications", &self.notifications)
            .finish_non_exhaustive()
    }
}

fn ensure_transition(from: JobStatus, to: JobStatus) -> Result<(), LifecycleError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(LifecycleError::IllegalTransition { from, to })
    }
}

/// `round(processed / total × 100)`, 0 while the total is unknown.
pub fn percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (processed.min(total) as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::jobs::store::MemoryJobStore;
    use crate::notify::{Notification, Notifier};
    use crate::output::{DrawingInfo, ExtractedDocumentData};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Docs(Mutex<HashSet<String>>);

    impl Docs {
        fn with(paths: &[&str]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(paths.iter().map(|p| p.to_string()).collect())))
        }
        fn remove(&self, path: &str) {
            self.0.lock().unwrap().remove(path);
        }
    }

    #[async_trait]
    impl DocumentStore for Docs {
        async fn download(&self, path: &str) -> Result<Vec<u8>, IngestError> {
            Err(IngestError::DownloadFailed {
                path: path.into(),
                reason: "not used".into(),
            })
        }
        async fn file_exists(&self, path: &str) -> Result<bool, IngestError> {
            if path.starts_with("offline/") {
                return Err(IngestError::DownloadFailed {
                    path: path.into(),
                    reason: "connection refused".into(),
                });
            }
            Ok(self.0.lock().unwrap().contains(path))
        }
    }

    #[derive(Default)]
    struct Inbox(Mutex<Vec<Notification>>);

    #[async_trait]
    impl Notifier for Inbox {
        async fn send(&self, n: &Notification) -> Result<(), String> {
            self.0.lock().unwrap().push(n.clone());
            Ok(())
        }
    }

    struct Fixture {
        manager: JobManager,
        store: Arc<MemoryJobStore>,
        docs: Arc<Docs>,
        inbox: Arc<Inbox>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let docs = Docs::with(&["u/plan.pdf"]);
        let inbox = Arc::new(Inbox::default());
        let manager = JobManager::new(
            store.clone(),
            docs.clone(),
            NotificationDispatcher::default().with_notifier(inbox.clone()),
        );
        Fixture {
            manager,
            store,
            docs,
            inbox,
        }
    }

    fn request() -> SubmitRequest {
        SubmitRequest {
            user_id: Uuid::new_v4(),
            file_id: Some("file-1".into()),
            project_id: Some("proj-1".into()),
            file_name: "plan.pdf".into(),
            mime_type: "application/pdf".into(),
            storage_path: "u/plan.pdf".into(),
        }
    }

    fn result(pages: usize) -> ExtractionResult {
        let data = ExtractedDocumentData {
            drawing: Some(DrawingInfo {
                drawing_number: Some("A-101".into()),
                sheet_title: Some("Ground Floor Plan".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        ExtractionResult::single_page(pages, data)
    }

    /// Drive a fresh job into `status`.
    async fn job_in(f: &Fixture, status: JobStatus) -> Uuid {
        let id = f.manager.submit(request()).await.unwrap();
        match status {
            JobStatus::Pending => {}
            JobStatus::Processing => {
                f.manager.start(id).await.unwrap();
            }
            JobStatus::Completed => {
                f.manager.start(id).await.unwrap();
                f.manager.complete(id, result(1)).await.unwrap();
            }
            JobStatus::Failed => {
                f.manager.fail(id, "boom").await.unwrap();
            }
        }
        id
    }

    async fn request_transition(f: &Fixture, id: Uuid, to: JobStatus) -> Result<(), LifecycleError> {
        match to {
            JobStatus::Pending => Err(LifecycleError::IllegalTransition {
                from: f.manager.get(id).await?.status,
                to,
            }),
            JobStatus::Processing => f.manager.start(id).await.map(|_| ()),
            JobStatus::Completed => f.manager.complete(id, result(1)).await.map(|_| ()),
            JobStatus::Failed => f.manager.fail(id, "requested").await.map(|_| ()),
        }
    }

    #[tokio::test]
    async fn transition_table_through_manager() {
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                let f = fixture();
                let id = job_in(&f, from).await;
                let before = f.manager.get(id).await.unwrap();
                let outcome = request_transition(&f, id, to).await;
                let after = f.manager.get(id).await.unwrap();

                if from.can_transition_to(to) {
                    assert!(outcome.is_ok(), "{from} -> {to}: {outcome:?}");
                    assert_eq!(after.status, to);
                    assert_eq!(after.version, before.version + 1);
                } else {
                    assert!(outcome.is_err(), "{from} -> {to} should be rejected");
                    assert_eq!(after, before, "{from} -> {to} mutated the job");
                }
            }
        }
    }

    #[tokio::test]
    async fn timestamps_and_fields() {
        let f = fixture();
        let id = f.manager.submit(request()).await.unwrap();
        let started = f.manager.start(id).await.unwrap();
        assert!(started.started_at.is_some());
        assert!(started.completed_at.is_none());

        let done = f.manager.complete(id, result(4)).await.unwrap();
        assert_eq!(done.progress, 100);
        assert_eq!(done.total_pages, 4);
        assert!(done.processed_pages <= done.total_pages);
        assert!(done.completed_at.is_some());
        assert!(done.result.is_some());

        let f = fixture();
        let id = job_in(&f, JobStatus::Processing).await;
        f.manager.report_progress(id, 2, 4).await.unwrap();
        let failed = f.manager.fail(id, "render failed").await.unwrap();
        assert_eq!(failed.progress, 0);
        assert_eq!(failed.error.as_deref(), Some("render failed"));
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_clamped() {
        let f = fixture();
        let id = job_in(&f, JobStatus::Processing).await;

        let mut last = 0;
        for processed in [0, 1, 1, 2, 3] {
            let job = f.manager.report_progress(id, processed, 3).await.unwrap();
            assert!(job.progress >= last);
            last = job.progress;
        }
        assert_eq!(last, 100);

        let job = f.manager.report_progress(id, 9, 3).await.unwrap();
        assert_eq!(job.processed_pages, 3);
        assert_eq!(job.progress, 100);
    }

    #[tokio::test]
    async fn progress_rejected_unless_processing() {
        let f = fixture();
        let id = job_in(&f, JobStatus::Pending).await;
        let err = f.manager.report_progress(id, 1, 2).await.unwrap_err();
        assert_eq!(err, LifecycleError::NotProcessing { status: JobStatus::Pending });

        let id = job_in(&f, JobStatus::Completed).await;
        assert!(f.manager.report_progress(id, 1, 2).await.is_err());
    }

    #[test]
    fn percent_rounds() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 67);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(5, 3), 100);
    }

    #[tokio::test]
    async fn deleted_file_fails_on_start() {
        let f = fixture();
        let id = f.manager.submit(request()).await.unwrap();
        f.docs.remove("u/plan.pdf");

        let err = f.manager.start(id).await.unwrap_err();
        assert_eq!(err, LifecycleError::FileDeleted);
        let job = f.manager.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("The source file has been deleted"));
    }

    #[tokio::test]
    async fn unreachable_storage_is_not_reported_as_deleted() {
        let f = fixture();
        let id = f
            .manager
            .submit(SubmitRequest {
                storage_path: "offline/plan.pdf".into(),
                ..request()
            })
            .await
            .unwrap();

        let err = f.manager.start(id).await.unwrap_err();
        assert_eq!(err, LifecycleError::StorageUnavailable);
        let job = f.manager.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error.as_deref(),
            Some("The file could not be retrieved from storage.")
        );
    }

    #[tokio::test]
    async fn reclaim_is_idempotent() {
        let f = fixture();
        let stuck = job_in(&f, JobStatus::Processing).await;
        let done = job_in(&f, JobStatus::Completed).await;

        let later = Utc::now() + chrono::Duration::minutes(16);
        let first = f.manager.reclaim_stuck_at(DEFAULT_STUCK_TIMEOUT, later).await.unwrap();
        assert_eq!(first, vec![stuck]);
        let second = f.manager.reclaim_stuck_at(DEFAULT_STUCK_TIMEOUT, later).await.unwrap();
        assert!(second.is_empty());

        let job = f.manager.get(stuck).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(STUCK_JOB_MESSAGE));
        assert_eq!(f.manager.get(done).await.unwrap().status, JobStatus::Completed);

        let trail = f.manager.audit_trail(stuck).await.unwrap();
        assert_eq!(trail.last().unwrap().actor, Actor::Reclaimer);
    }

    #[tokio::test]
    async fn fresh_processing_jobs_are_not_reclaimed() {
        let f = fixture();
        job_in(&f, JobStatus::Processing).await;
        let reclaimed = f.manager.reclaim_stuck(DEFAULT_STUCK_TIMEOUT).await.unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn audit_trail_records_every_transition() {
        let f = fixture();
        let id = job_in(&f, JobStatus::Completed).await;
        let trail = f.manager.audit_trail(id).await.unwrap();
        let steps: Vec<_> = trail.iter().map(|e| (e.from, e.to)).collect();
        assert_eq!(
            steps,
            vec![
                (None, JobStatus::Pending),
                (Some(JobStatus::Pending), JobStatus::Processing),
                (Some(JobStatus::Processing), JobStatus::Completed),
            ]
        );
        assert!(trail.iter().all(|e| e.file_id.as_deref() == Some("file-1")));
        assert!(trail.iter().all(|e| e.project_id.as_deref() == Some("proj-1")));
    }

    #[tokio::test]
    async fn completion_upserts_metadata_and_notifies() {
        let f = fixture();
        let id = job_in(&f, JobStatus::Completed).await;

        let meta = f.store.document_metadata("file-1").await.unwrap().unwrap();
        assert_eq!(meta.drawing_number.as_deref(), Some("A-101"));
        assert_eq!(meta.title.as_deref(), Some("Ground Floor Plan"));

        let inbox = f.inbox.0.lock().unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].data["jobId"], serde_json::json!(id));
    }

    #[tokio::test]
    async fn failure_notifies_with_message() {
        let f = fixture();
        job_in(&f, JobStatus::Failed).await;
        let inbox = f.inbox.0.lock().unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(inbox[0].message.contains("boom"));
    }

    #[tokio::test]
    async fn unknown_job() {
        let f = fixture();
        let id = Uuid::new_v4();
        assert_eq!(f.manager.start(id).await.unwrap_err(), LifecycleError::JobNotFound(id));
        assert_eq!(f.manager.get(id).await.unwrap_err(), LifecycleError::JobNotFound(id));
    }
}
