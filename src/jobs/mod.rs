//! Job lifecycle: records, persistence, state transitions and background
//! processing.
//!
//! * [`state`]   — `ExtractionJob`, `JobStatus` and the transition table
//! * [`store`]   — `JobStore` persistence seam with compare-and-swap writes
//! * [`manager`] — `JobManager`, the only writer of job status
//! * [`worker`]  — `JobProcessor`, drives one job to a terminal state
//! * [`queue`]   — `InProcessQueue` and the stuck-job reclaimer

pub mod manager;
pub mod queue;
pub mod state;
pub mod store;
pub mod worker;

pub use manager::{JobManager, DEFAULT_STUCK_TIMEOUT, STUCK_JOB_MESSAGE};
pub use queue::{spawn_reclaimer, InProcessQueue, JobQueue};
pub use state::{Actor, AuditEntry, ExtractionJob, JobStatus, SubmitRequest};
pub use store::{JobStore, MemoryJobStore};
pub use worker::{JobProcessor, ProcessingMode};
