//! Error types for the sitedocs-ingest library.
//!
//! Four error types reflect four distinct failure surfaces:
//!
//! * [`IngestError`] — **Fatal for a job**: the document cannot be processed
//!   at all (not a PDF, every renderer failed, storage unreachable). The job
//!   processor turns it into a FAILED job using [`IngestError::user_message`].
//!
//! * [`ExtractionFailure`] — **Fatal for a page**: one vision-model call
//!   failed. Inside a multi-page run it becomes that page's `error` field;
//!   on the single-page path it fails the job.
//!
//! * [`LifecycleError`] — a job-state operation was rejected (illegal
//!   transition, unknown job, lost compare-and-swap). Rejections never mutate
//!   the job.
//!
//! * [`VisionModelError`] — the raw error reported by a [`crate::pipeline::llm::VisionModel`]
//!   before classification.

use crate::jobs::state::JobStatus;
use thiserror::Error;
use uuid::Uuid;

/// Fatal errors raised while processing one document.
#[derive(Debug, Error)]
pub enum IngestError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The bytes do not start with a PDF header.
    #[error("File is not a valid PDF (first bytes: {magic:?})")]
    NotAPdf { magic: Vec<u8> },

    /// The MIME type is neither a PDF nor a raster image.
    #[error("Unsupported MIME type '{mime_type}'")]
    UnsupportedMimeType { mime_type: String },

    /// An uploaded image could not be decoded.
    #[error("Image could not be decoded: {detail}")]
    ImageDecode { detail: String },

    /// Source bytes could not be fetched from storage.
    #[error("Failed to download '{path}': {reason}")]
    DownloadFailed { path: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{path}'")]
    DownloadTimeout { path: String, secs: u64 },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// Every renderer strategy failed.
    #[error("All renderers failed: {}", attempts.join("; "))]
    Unrenderable { attempts: Vec<String> },

    /// No page counter could determine how many pages the document has.
    #[error("Page count could not be determined")]
    UnknownPageCount,

    /// Rasterisation did not finish within the render timeout.
    #[error("Rendering timed out after {secs}s")]
    RenderTimeout { secs: u64 },

    // ── Vision-model errors ───────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// A page extraction failed on the single-page path.
    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionFailure),

    // ── Lifecycle ─────────────────────────────────────────────────────────
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Processing was interrupted by a shutdown.
    #[error("Processing was cancelled")]
    Cancelled,

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// Human-readable message stored on a FAILED job.
    ///
    /// Never contains stack traces or internal type names; the technical
    /// detail stays in the `Display` output, which is only logged.
    pub fn user_message(&self) -> String {
        match self {
            IngestError::NotAPdf { .. }
            | IngestError::Unrenderable { .. }
            | IngestError::UnknownPageCount
            | IngestError::ImageDecode { .. } => {
                "The file could not be processed. It may be corrupted or unsupported.".to_string()
            }
            IngestError::UnsupportedMimeType { mime_type } => {
                format!("Files of type '{mime_type}' cannot be analyzed.")
            }
            IngestError::DownloadFailed { .. } | IngestError::DownloadTimeout { .. } => {
                "The file could not be retrieved from storage.".to_string()
            }
            IngestError::RenderTimeout { .. } => {
                "The file took too long to render and could not be processed.".to_string()
            }
            IngestError::ProviderNotConfigured { .. } => {
                "Document analysis is not configured. Contact your administrator.".to_string()
            }
            IngestError::Extraction(failure) => failure.to_string(),
            IngestError::Lifecycle(
                e @ (LifecycleError::FileDeleted | LifecycleError::StorageUnavailable),
            ) => e.to_string(),
            IngestError::Cancelled => "Processing was cancelled.".to_string(),
            IngestError::Lifecycle(_)
            | IngestError::InvalidConfig(_)
            | IngestError::Internal(_) => {
                "An unexpected error occurred while analyzing the document.".to_string()
            }
        }
    }
}

/// A classified vision-model failure for a single page.
///
/// `Display` is the user-facing message for each class.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionFailure {
    #[error("Document analysis is not configured correctly (authentication failed).")]
    Auth,

    #[error("The analysis service is busy (rate limit exceeded). Please try again shortly.")]
    RateLimited,

    #[error("Could not connect to the analysis service.")]
    Connection,

    /// The call exceeded the per-call timeout; distinct from a service error.
    #[error("Analysis timed out after {secs}s.")]
    Timeout { secs: u64 },

    #[error("The analysis service rejected this page image.")]
    BadRequest,

    #[error("The analysis service had a temporary error. Please try again.")]
    Server,

    /// Unclassified failure. The raw detail is only logged.
    #[error("The page could not be analyzed.")]
    Other,
}

impl ExtractionFailure {
    /// Whether another attempt might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Server)
    }
}

/// Raw error returned by a vision model, before classification.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct VisionModelError {
    /// HTTP status when the backend reported one.
    pub status: Option<u16>,
    pub message: String,
}

impl VisionModelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

/// Rejections from the job lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Illegal transition {from} → {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    /// A progress write was attempted on a job that is not PROCESSING.
    #[error("Job is {status}, progress can only be reported while PROCESSING")]
    NotProcessing { status: JobStatus },

    #[error("The source file has been deleted")]
    FileDeleted,

    /// Storage could not say whether the source file exists.
    #[error("The file could not be retrieved from storage.")]
    StorageUnavailable,

    /// Another writer changed the job between read and write.
    #[error("Job {0} was modified concurrently")]
    Conflict(Uuid),

    #[error("Job store error: {0}")]
    Store(String),
}
