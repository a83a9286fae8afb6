//! Persistence seam for jobs, audit entries and document metadata.
//!
//! Every job write goes through [`JobStore::compare_and_swap`]: the store
//! accepts the new record only if the stored `version` still equals the
//! version the writer read, then bumps it. Two workers racing to start the
//! same job therefore cannot both succeed.

use crate::error::LifecycleError;
use crate::jobs::state::{AuditEntry, ExtractionJob, JobStatus};
use crate::output::DocumentMetadata;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: ExtractionJob) -> Result<(), LifecycleError>;

    async fn get(&self, id: Uuid) -> Result<Option<ExtractionJob>, LifecycleError>;

    /// Replace the stored job if its version is still `expected_version`.
    /// Returns the stored record (version bumped).
    async fn compare_and_swap(
        &self,
        job: ExtractionJob,
        expected_version: u64,
    ) -> Result<ExtractionJob, LifecycleError>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ExtractionJob>, LifecycleError>;

    async fn record_audit(&self, entry: AuditEntry) -> Result<(), LifecycleError>;

    async fn audit_trail(&self, job_id: Uuid) -> Result<Vec<AuditEntry>, LifecycleError>;

    async fn upsert_document_metadata(&self, metadata: DocumentMetadata) -> Result<(), LifecycleError>;

    async fn document_metadata(&self, file_id: &str) -> Result<Option<DocumentMetadata>, LifecycleError>;
}

/// In-memory [`JobStore`] for tests, the CLI and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, ExtractionJob>>,
    audit: RwLock<Vec<AuditEntry>>,
    metadata: RwLock<HashMap<String, DocumentMetadata>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: ExtractionJob) -> Result<(), LifecycleError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(LifecycleError::Store(format!("duplicate job id {}", job.id)));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ExtractionJob>, LifecycleError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn compare_and_swap(
        &self,
        mut job: ExtractionJob,
        expected_version: u64,
    ) -> Result<ExtractionJob, LifecycleError> {
        let mut jobs = self.jobs.write().await;
        let current = jobs.get_mut(&job.id).ok_or(LifecycleError::JobNotFound(job.id))?;
        if current.version != expected_version {
            return Err(LifecycleError::Conflict(job.id));
        }
        job.version = expected_version + 1;
        *current = job.clone();
        Ok(job)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ExtractionJob>, LifecycleError> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<_> = jobs.values().filter(|j| j.status == status).cloned().collect();
        out.sort_by_key(|j| j.created_at);
        Ok(out)
    }

    async fn record_audit(&self, entry: AuditEntry) -> Result<(), LifecycleError> {
        self.audit.write().await.push(entry);
        Ok(())
    }

    async fn audit_trail(&self, job_id: Uuid) -> Result<Vec<AuditEntry>, LifecycleError> {
        Ok(self
            .audit
            .read()
            .await
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn upsert_document_metadata(&self, metadata: DocumentMetadata) -> Result<(), LifecycleError> {
        self.metadata
            .write()
            .await
            .insert(metadata.file_id.clone(), metadata);
        Ok(())
    }

    async fn document_metadata(&self, file_id: &str) -> Result<Option<DocumentMetadata>, LifecycleError> {
        Ok(self.metadata.read().await.get(file_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::state::SubmitRequest;
    use chrono::Utc;

    fn job() -> ExtractionJob {
        ExtractionJob::new(SubmitRequest::default(), Utc::now())
    }

    #[tokio::test]
    async fn cas_bumps_version() {
        let store = MemoryJobStore::new();
        let j = job();
        store.insert(j.clone()).await.unwrap();

        let mut next = j.clone();
        next.status = JobStatus::Processing;
        let stored = store.compare_and_swap(next, 0).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(store.get(j.id).await.unwrap().unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn stale_cas_is_conflict_and_leaves_job() {
        let store = MemoryJobStore::new();
        let j = job();
        store.insert(j.clone()).await.unwrap();

        let mut a = j.clone();
        a.status = JobStatus::Processing;
        store.compare_and_swap(a, 0).await.unwrap();

        let mut b = j.clone();
        b.status = JobStatus::Failed;
        let err = store.compare_and_swap(b, 0).await.unwrap_err();
        assert_eq!(err, LifecycleError::Conflict(j.id));
        let stored = store.get(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn cas_unknown_job() {
        let store = MemoryJobStore::new();
        let j = job();
        let err = store.compare_and_swap(j.clone(), 0).await.unwrap_err();
        assert_eq!(err, LifecycleError::JobNotFound(j.id));
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = MemoryJobStore::new();
        let j = job();
        store.insert(j.clone()).await.unwrap();
        assert!(store.insert(j).await.is_err());
    }
}
