//! PDF rasterisation: an ordered chain of renderer strategies.
//!
//! ## Strategies
//!
//! ```text
//! render:      PdfiumBackend ──fail──▶ PopplerRenderer ──fail──▶ Unrenderable { attempts }
//! page count:  PdfiumBackend ──fail/0──▶ LopdfCounter ──fail/0──▶ 0 (unknown)
//! ```
//!
//! pdfium is fast and handles the vast majority of drawing sets. Malformed
//! files it rejects are retried with poppler's `pdftoppm`, which is slower
//! but ships its own font stack. Counting pages falls back to lopdf, a
//! structure-only parser that never rasterises and tolerates broken xref
//! tables and encrypted files.
//!
//! ## Why spawn_blocking?
//!
//! Both pdfium and the poppler subprocess block for seconds on large sheets.
//! The whole chain runs inside `tokio::task::spawn_blocking`, wrapped in
//! `tokio::time::timeout` so a hung renderer becomes a typed failure.

use crate::config::IngestConfig;
use crate::error::IngestError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// PDFs may carry junk before the header; readers accept it within 1 KiB.
const HEADER_SEARCH_WINDOW: usize = 1024;

/// Nominal PDF resolution: one point per pixel.
const NOMINAL_DPI: f32 = 72.0;

/// Rasterises PDF bytes into one image per page.
pub trait PageRenderer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Render up to `max_pages` pages (all when `None`), in page order.
    fn render(&self, pdf: &[u8], max_pages: Option<usize>) -> Result<Vec<DynamicImage>, String>;
}

/// Reports how many pages a PDF has without rendering it.
pub trait PageCounter: Send + Sync {
    fn name(&self) -> &'static str;

    fn count(&self, pdf: &[u8]) -> Result<usize, String>;
}

/// Reject bytes that cannot be a PDF before any renderer sees them.
pub fn ensure_pdf(bytes: &[u8]) -> Result<(), IngestError> {
    let window = &bytes[..bytes.len().min(HEADER_SEARCH_WINDOW)];
    if window.windows(5).any(|w| w == b"%PDF-") {
        Ok(())
    } else {
        Err(IngestError::NotAPdf {
            magic: bytes.iter().take(4).copied().collect(),
        })
    }
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// Primary renderer and page counter backed by the pdfium library.
///
/// Binds to the library in the `PDFIUM_LIB_PATH` directory when set,
/// otherwise to the system library, then to one in the working directory.
#[derive(Debug, Clone)]
pub struct PdfiumBackend {
    scale: f32,
}

impl PdfiumBackend {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }

    fn bind() -> Result<Pdfium, String> {
        let bindings = match std::env::var("PDFIUM_LIB_PATH") {
            Ok(dir) if !dir.is_empty() => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&dir))
            }
            _ => Pdfium::bind_to_system_library().or_else(|_| {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            }),
        }
        .map_err(|e| format!("failed to bind pdfium: {e:?}"))?;
        Ok(Pdfium::new(bindings))
    }
}

impl PageRenderer for PdfiumBackend {
    fn name(&self) -> &'static str {
        "pdfium"
    }

    fn render(&self, pdf: &[u8], max_pages: Option<usize>) -> Result<Vec<DynamicImage>, String> {
        let pdfium = Self::bind()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(|e| format!("{e:?}"))?;

        let pages = document.pages();
        let total = pages.len() as usize;
        let limit = max_pages.map_or(total, |m| m.min(total));
        let render_config = PdfRenderConfig::new().scale_page_by_factor(self.scale);

        let mut images = Vec::with_capacity(limit);
        for idx in 0..limit {
            let page = pages
                .get(idx as u16)
                .map_err(|e| format!("page {}: {e:?}", idx + 1))?;
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| format!("page {}: {e:?}", idx + 1))?;
            let image = bitmap.as_image();
            debug!("pdfium rendered page {} → {}x{} px", idx + 1, image.width(), image.height());
            images.push(image);
        }
        Ok(images)
    }
}

impl PageCounter for PdfiumBackend {
    fn name(&self) -> &'static str {
        "pdfium"
    }

    fn count(&self, pdf: &[u8]) -> Result<usize, String> {
        let pdfium = Self::bind()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(|e| format!("{e:?}"))?;
        Ok(document.pages().len() as usize)
    }
}

// ── poppler ──────────────────────────────────────────────────────────────

/// Fallback renderer shelling out to poppler's `pdftoppm`.
#[derive(Debug, Clone)]
pub struct PopplerRenderer {
    dpi: u32,
}

impl PopplerRenderer {
    pub fn new(scale: f32) -> Self {
        Self {
            dpi: (NOMINAL_DPI * scale).round() as u32,
        }
    }
}

impl PageRenderer for PopplerRenderer {
    fn name(&self) -> &'static str {
        "poppler"
    }

    fn render(&self, pdf: &[u8], max_pages: Option<usize>) -> Result<Vec<DynamicImage>, String> {
        let dir = tempfile::tempdir().map_err(|e| format!("tempdir: {e}"))?;
        let input = dir.path().join("input.pdf");
        std::fs::write(&input, pdf).map_err(|e| format!("write temp PDF: {e}"))?;
        let prefix = dir.path().join("page");

        let mut cmd = Command::new("pdftoppm");
        cmd.arg("-png").arg("-r").arg(self.dpi.to_string());
        if let Some(n) = max_pages {
            cmd.arg("-f").arg("1").arg("-l").arg(n.to_string());
        }
        let output = cmd
            .arg(&input)
            .arg(&prefix)
            .output()
            .map_err(|e| format!("failed to run pdftoppm: {e}"))?;

        if !output.status.success() {
            return Err(format!(
                "pdftoppm failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let mut files = rendered_pages(dir.path())?;
        files.sort_by_key(|(n, _)| *n);
        files
            .into_iter()
            .map(|(n, path)| image::open(&path).map_err(|e| format!("page {n}: {e}")))
            .collect()
    }
}

/// `page-1.png`, `page-01.png`, … → (page number, path).
fn rendered_pages(dir: &Path) -> Result<Vec<(usize, std::path::PathBuf)>, String> {
    let entries = std::fs::read_dir(dir).map_err(|e| format!("read output dir: {e}"))?;
    let mut pages = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let number = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("page-"))
            .and_then(|n| n.parse::<usize>().ok());
        if let (Some(n), Some("png")) = (number, path.extension().and_then(|e| e.to_str())) {
            pages.push((n, path));
        }
    }
    Ok(pages)
}

// ── lopdf ────────────────────────────────────────────────────────────────

/// Structure-only page counter; never rasterises.
#[derive(Debug, Clone, Default)]
pub struct LopdfCounter;

impl PageCounter for LopdfCounter {
    fn name(&self) -> &'static str {
        "lopdf"
    }

    fn count(&self, pdf: &[u8]) -> Result<usize, String> {
        let doc = lopdf::Document::load_mem(pdf).map_err(|e| e.to_string())?;
        Ok(doc.get_pages().len())
    }
}

// ── Chain ────────────────────────────────────────────────────────────────

/// Ordered renderer and counter strategies; first success wins.
#[derive(Clone)]
pub struct RenderChain {
    renderers: Vec<Arc<dyn PageRenderer>>,
    counters: Vec<Arc<dyn PageCounter>>,
    timeout: Duration,
}

impl RenderChain {
    pub fn new(
        renderers: Vec<Arc<dyn PageRenderer>>,
        counters: Vec<Arc<dyn PageCounter>>,
        timeout: Duration,
    ) -> Self {
        Self {
            renderers,
            counters,
            timeout,
        }
    }

    /// pdfium → poppler for rendering, pdfium → lopdf for counting.
    pub fn from_config(config: &IngestConfig) -> Self {
        let pdfium = Arc::new(PdfiumBackend::new(config.render_scale));
        Self::new(
            vec![
                pdfium.clone() as Arc<dyn PageRenderer>,
                Arc::new(PopplerRenderer::new(config.render_scale)),
            ],
            vec![pdfium as Arc<dyn PageCounter>, Arc::new(LopdfCounter)],
            config.render_timeout,
        )
    }

    /// Render up to `max_pages` pages with the first strategy that succeeds.
    pub async fn render(
        &self,
        pdf: &[u8],
        max_pages: Option<usize>,
    ) -> Result<Vec<DynamicImage>, IngestError> {
        ensure_pdf(pdf)?;
        let data: Arc<[u8]> = Arc::from(pdf);
        let renderers = self.renderers.clone();

        let task = tokio::task::spawn_blocking(move || render_blocking(&renderers, &data, max_pages));
        let images = tokio::time::timeout(self.timeout, task)
            .await
            .map_err(|_| IngestError::RenderTimeout {
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| IngestError::Internal(format!("Render task panicked: {e}")))??;

        info!("Rendered {} page image(s)", images.len());
        Ok(images)
    }

    /// Render only the first page.
    pub async fn first_page(&self, pdf: &[u8]) -> Result<DynamicImage, IngestError> {
        self.render(pdf, Some(1))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| IngestError::Unrenderable {
                attempts: vec!["no pages rendered".to_string()],
            })
    }

    /// Page count from the first counter reporting a non-zero value.
    ///
    /// Returns 0 when every counter fails; callers treat 0 as unknown.
    pub async fn page_count(&self, pdf: &[u8]) -> usize {
        let data: Arc<[u8]> = Arc::from(pdf);
        let counters = self.counters.clone();
        let task = tokio::task::spawn_blocking(move || count_blocking(&counters, &data));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                warn!("Page-count task panicked: {}", e);
                0
            }
            Err(_) => {
                warn!("Page count timed out after {:?}", self.timeout);
                0
            }
        }
    }
}

fn render_blocking(
    renderers: &[Arc<dyn PageRenderer>],
    pdf: &[u8],
    max_pages: Option<usize>,
) -> Result<Vec<DynamicImage>, IngestError> {
    let mut attempts = Vec::with_capacity(renderers.len());
    for renderer in renderers {
        match renderer.render(pdf, max_pages) {
            Ok(images) if !images.is_empty() => {
                debug!("{} rendered {} page(s)", renderer.name(), images.len());
                return Ok(images);
            }
            Ok(_) => attempts.push(format!("{}: produced no pages", renderer.name())),
            Err(e) => {
                warn!("Renderer {} failed: {}", renderer.name(), e);
                attempts.push(format!("{}: {}", renderer.name(), e));
            }
        }
    }
    Err(IngestError::Unrenderable { attempts })
}

fn count_blocking(counters: &[Arc<dyn PageCounter>], pdf: &[u8]) -> usize {
    for counter in counters {
        match counter.count(pdf) {
            Ok(n) if n > 0 => return n,
            Ok(_) => debug!("{} reported zero pages", counter.name()),
            Err(e) => debug!("{} could not count pages: {}", counter.name(), e),
        }
    }
    0
}
