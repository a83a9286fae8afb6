//! Multi-page extraction: fixed-size concurrent batches over every page.
//!
//! ```text
//! page_count ─▶ render (≤ max_pages) ─▶ [p1 p2 p3] ─pause─▶ [p4 p5 p6] ─pause─▶ …
//!                                          │  progress(3, N)     │  progress(6, N)
//! ```
//!
//! A page that fails (timeout, model error, unparseable reply) keeps its slot
//! in the result with `error` set; the other pages are unaffected. Only
//! document-level problems (unreadable PDF, cancellation) return `Err`.

use crate::error::IngestError;
use crate::output::{ExtractedDocumentData, ExtractionResult, ExtractionSummary, PageExtraction, ProjectMatch};
use crate::pipeline::llm::VisionExtractor;
use crate::pipeline::render::RenderChain;
use crate::progress::ProgressSink;
use crate::projects::KnownProject;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Knobs for one multi-page run.
#[derive(Clone, Default)]
pub struct AggregateOptions {
    /// Pages beyond this are not analysed.
    pub max_pages: usize,
    /// Pages per batch.
    pub concurrency: usize,
    /// Pause between consecutive batches.
    pub batch_pause: Duration,
    pub on_progress: Option<ProgressSink>,
    /// Checked between batches.
    pub cancel: Option<CancellationToken>,
}

impl AggregateOptions {
    pub fn from_config(config: &crate::config::IngestConfig) -> Self {
        Self {
            max_pages: config.max_pages,
            concurrency: config.concurrency,
            batch_pause: config.batch_pause,
            on_progress: None,
            cancel: None,
        }
    }

    pub fn on_progress(mut self, sink: ProgressSink) -> Self {
        self.on_progress = Some(sink);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Extract every page (up to `max_pages`) of a PDF.
pub async fn extract_all(
    chain: &RenderChain,
    extractor: &VisionExtractor,
    pdf: &[u8],
    projects: &[KnownProject],
    options: &AggregateOptions,
) -> Result<ExtractionResult, IngestError> {
    crate::pipeline::render::ensure_pdf(pdf)?;

    let page_count = chain.page_count(pdf).await;
    if page_count == 0 {
        return Err(IngestError::UnknownPageCount);
    }

    let cap = options.max_pages.max(1).min(page_count);
    if cap < page_count {
        info!("Analysing first {} of {} pages", cap, page_count);
    }

    let images = chain.render(pdf, Some(cap)).await?;
    let to_process = images.len().min(cap);
    let batch_size = options.concurrency.max(1);

    let mut pages = Vec::with_capacity(to_process);
    for (batch_idx, batch) in images[..to_process].chunks(batch_size).enumerate() {
        if batch_idx > 0 {
            if is_cancelled(options) {
                return Err(IngestError::Cancelled);
            }
            if !options.batch_pause.is_zero() {
                tokio::time::sleep(options.batch_pause).await;
            }
        }
        if is_cancelled(options) {
            return Err(IngestError::Cancelled);
        }

        let first_page = batch_idx * batch_size + 1;
        let futures = batch.iter().enumerate().map(|(offset, image)| {
            let page_number = first_page + offset;
            async move {
                let data = match extractor.extract_page(page_number, image, projects).await {
                    Ok(data) => data,
                    Err(failure) => ExtractedDocumentData::from_error(failure.to_string()),
                };
                PageExtraction { page_number, data }
            }
        });
        pages.extend(futures::future::join_all(futures).await);

        debug!("Batch {} done: {}/{} pages", batch_idx + 1, pages.len(), to_process);
        if let Some(ref sink) = options.on_progress {
            sink.report(pages.len(), to_process);
        }
    }

    let summary = summarize(&pages);
    let failed = pages.iter().filter(|p| p.data.error.is_some()).count();
    info!(
        "Extracted {} page(s) ({} with errors), {} unique drawing(s)",
        pages.len(),
        failed,
        summary.unique_drawings.len()
    );

    Ok(ExtractionResult {
        page_count,
        pages,
        summary: Some(summary),
        error: None,
    })
}

fn is_cancelled(options: &AggregateOptions) -> bool {
    options
        .cancel
        .as_ref()
        .is_some_and(CancellationToken::is_cancelled)
}

/// Roll page data up into a document summary.
///
/// Drawing numbers, sheet titles and disciplines are set unions (sorted for
/// stable output); the project match is the single highest-confidence match.
pub fn summarize(pages: &[PageExtraction]) -> ExtractionSummary {
    let mut drawings = BTreeSet::new();
    let mut titles = BTreeSet::new();
    let mut disciplines = BTreeSet::new();
    let mut best: Option<&ProjectMatch> = None;

    for page in pages {
        let data = &page.data;
        if let Some(n) = non_blank(data.drawing_number()) {
            drawings.insert(n.to_string());
        }
        if let Some(t) = non_blank(data.sheet_title()) {
            titles.insert(t.to_string());
        }
        if let Some(d) = non_blank(data.discipline()) {
            disciplines.insert(d.to_string());
        }
        if let Some(m) = data.project_match.as_ref() {
            if best.map_or(true, |b| m.confidence > b.confidence) {
                best = Some(m);
            }
        }
    }

    ExtractionSummary {
        project_match: best.cloned(),
        unique_drawings: drawings.into_iter().collect(),
        sheet_titles: titles.into_iter().collect(),
        disciplines: disciplines.into_iter().collect(),
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}
