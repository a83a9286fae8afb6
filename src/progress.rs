//! Progress reporting for multi-page extraction.
//!
//! The aggregator calls [`ProgressSink::report`] once per finished batch with
//! `(pages_processed, pages_total)`. The job worker forwards it into
//! [`crate::jobs::JobManager::report_progress`]; the CLI drives an indicatif bar.
//!
//! # Example
//!
//! ```rust
//! use sitedocs_ingest::ProgressSink;
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! let done = Arc::new(AtomicUsize::new(0));
//! let seen = done.clone();
//! let sink = ProgressSink::new(move |processed, _total| {
//!     seen.store(processed, Ordering::SeqCst);
//! });
//! sink.report(3, 10);
//! assert_eq!(done.load(Ordering::SeqCst), 3);
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Receives batch-level progress events.
///
/// Implementations must be `Send + Sync`; the aggregator may live on any
/// runtime worker thread.
pub trait ExtractionProgress: Send + Sync {
    fn on_batch_complete(&self, processed: usize, total: usize);
}

impl<F> ExtractionProgress for F
where
    F: Fn(usize, usize) + Send + Sync,
{
    fn on_batch_complete(&self, processed: usize, total: usize) {
        self(processed, total)
    }
}

/// Cloneable handle to an [`ExtractionProgress`] observer.
///
/// A panicking observer is logged and otherwise ignored: progress is
/// advisory and must never abort the extraction it observes.
#[derive(Clone)]
pub struct ProgressSink(Arc<dyn ExtractionProgress>);

impl ProgressSink {
    pub fn new(observer: impl ExtractionProgress + 'static) -> Self {
        Self(Arc::new(observer))
    }

    pub fn from_arc(observer: Arc<dyn ExtractionProgress>) -> Self {
        Self(observer)
    }

    pub fn report(&self, processed: usize, total: usize) {
        let observer = &self.0;
        let outcome = catch_unwind(AssertUnwindSafe(|| observer.on_batch_complete(processed, total)));
        if outcome.is_err() {
            warn!("Progress observer panicked at {}/{}; continuing", processed, total);
        }
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressSink")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<(usize, usize)>>);

    impl ExtractionProgress for Recorder {
        fn on_batch_complete(&self, processed: usize, total: usize) {
            self.0.lock().unwrap().push((processed, total));
        }
    }

    #[test]
    fn forwards_to_trait_object() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let sink = ProgressSink::from_arc(recorder.clone());
        sink.report(1, 4);
        sink.clone().report(4, 4);
        assert_eq!(*recorder.0.lock().unwrap(), vec![(1, 4), (4, 4)]);
    }

    #[test]
    fn panic_is_contained() {
        let sink = ProgressSink::new(|_: usize, _: usize| panic!("boom"));
        sink.report(1, 1);
    }
}
