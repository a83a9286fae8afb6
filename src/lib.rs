//! # sitedocs-ingest
//!
//! Asynchronous ingestion of construction documents: drawing sets, specs and
//! site photos are rasterised, read by a Vision Language Model, and turned
//! into structured title-block data (project, drawing number, sheet title,
//! discipline, location, dates).
//!
//! ## Pipeline Overview
//!
//! ```text
//! submit ──▶ PENDING job (returned immediately)
//!              │  queue
//!              ▼
//!          PROCESSING
//!              ├─ 1. Fetch    bytes from the DocumentStore
//!              ├─ 2. Render   pdfium → pdftoppm fallback (spawn_blocking)
//!              ├─ 3. Extract  one VLM call per page, batches of 3
//!              ├─ 4. Parse    first JSON object → ExtractedDocumentData
//!              ├─ 5. Match    fuzzy project match, discipline inference
//!              └─ 6. Summary  unique drawings, titles, disciplines
//!              ▼
//!    COMPLETED (result) / FAILED (message) ──▶ notification
//! ```
//!
//! A failed page is recorded on that page and does not fail the job. A
//! document that cannot be read at all, or any panic in the pipeline, ends
//! the job FAILED with a non-technical message.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sitedocs_ingest::{
//!     FsDocumentStore, IngestConfig, IngestService, KnownProject, LogNotifier,
//!     NotificationDispatcher, StaticProjectCatalog, SubmitRequest,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = IngestConfig::from_env()?;
//!     let service = IngestService::from_config(
//!         config,
//!         Arc::new(FsDocumentStore::new("/var/lib/sitedocs")),
//!         Arc::new(StaticProjectCatalog::new(vec![
//!             KnownProject::new("p-17", "Riverside Bridge").with_address("12 Quay Street"),
//!         ])),
//!         NotificationDispatcher::default().with_notifier(Arc::new(LogNotifier)),
//!     )?;
//!
//!     let id = service
//!         .submit(SubmitRequest {
//!             file_name: "S-201.pdf".into(),
//!             mime_type: "application/pdf".into(),
//!             storage_path: "uploads/S-201.pdf".into(),
//!             ..Default::default()
//!         })
//!         .await?;
//!     let job = service.wait_for(id, Duration::from_millis(500)).await?;
//!     println!("{}", serde_json::to_string_pretty(&job)?);
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ingest` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ```toml
//! sitedocs-ingest = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod jobs;
pub mod notify;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod projects;
pub mod prompts;
pub mod rate_limit;
pub mod service;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{IngestConfig, IngestConfigBuilder};
pub use error::{ExtractionFailure, IngestError, LifecycleError, VisionModelError};
pub use jobs::{
    ExtractionJob, InProcessQueue, JobManager, JobProcessor, JobQueue, JobStatus, JobStore,
    MemoryJobStore, SubmitRequest,
};
pub use notify::{JobOutcome, LogNotifier, Notification, NotificationDispatcher, Notifier, WebhookNotifier};
pub use output::{
    DocumentMetadata, ExtractedDocumentData, ExtractionResult, ExtractionSummary, PageExtraction,
    ProjectMatch,
};
pub use pipeline::aggregate::{extract_all, AggregateOptions};
pub use pipeline::input::{DocumentStore, FsDocumentStore, HttpDocumentStore};
pub use pipeline::llm::{LlmVisionModel, VisionExtractor, VisionModel, VisionRequest};
pub use pipeline::render::RenderChain;
pub use progress::{ExtractionProgress, ProgressSink};
pub use projects::{KnownProject, ProjectCatalog, StaticProjectCatalog};
pub use rate_limit::{RateLimitDecision, RateLimitKey, RateLimitRule, RateLimiter};
pub use service::{IngestService, ServiceParts};
