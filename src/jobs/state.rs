//! Job records and the status state machine.
//!
//! ```text
//!            start              complete
//! PENDING ─────────▶ PROCESSING ─────────▶ COMPLETED
//!    │                   │
//!    │ fail              │ fail / reclaim
//!    └──────▶ FAILED ◀───┘
//! ```
//!
//! COMPLETED and FAILED are terminal.

use crate::output::ExtractionResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A caller's request to ingest one stored document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub user_id: Uuid,
    pub file_id: Option<String>,
    pub project_id: Option<String>,
    pub file_name: String,
    pub mime_type: String,
    pub storage_path: String,
}

/// One ingestion job, as persisted and polled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_id: Option<String>,
    pub project_id: Option<String>,
    pub file_name: String,
    pub mime_type: String,
    pub storage_path: String,
    pub status: JobStatus,
    /// 0–100.
    pub progress: u8,
    pub processed_pages: usize,
    /// 0 while unknown.
    pub total_pages: usize,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<ExtractionResult>,
    /// Bumped on every write; compare-and-swap key.
    pub version: u64,
}

impl ExtractionJob {
    pub fn new(request: SubmitRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            file_id: request.file_id,
            project_id: request.project_id,
            file_name: request.file_name,
            mime_type: request.mime_type,
            storage_path: request.storage_path,
            status: JobStatus::Pending,
            progress: 0,
            processed_pages: 0,
            total_pages: 0,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            version: 0,
        }
    }
}

/// Who caused a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "id")]
pub enum Actor {
    User(Uuid),
    Worker,
    Reclaimer,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{id}"),
            Actor::Worker => f.write_str("worker"),
            Actor::Reclaimer => f.write_str("reclaimer"),
        }
    }
}

/// One line of the job audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub job_id: Uuid,
    /// None when the job was created.
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    pub actor: Actor,
    pub file_id: Option<String>,
    pub project_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn for_job(job: &ExtractionJob, from: Option<JobStatus>, actor: Actor, at: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            from,
            to: job.status,
            actor,
            file_id: job.file_id.clone(),
            project_id: job.project_id.clone(),
            at,
        }
    }
}
