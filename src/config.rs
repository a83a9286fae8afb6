//! Configuration for the ingestion pipeline.
//!
//! All pipeline behaviour is controlled through [`IngestConfig`], built via
//! its [`IngestConfigBuilder`] or loaded from the environment with
//! [`IngestConfig::from_env`]. One struct is shared by the renderer, the
//! vision client, the aggregator and the job processor, so a deployment can
//! log a single value to explain how a job was run.

use crate::error::IngestError;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for document ingestion.
///
/// # Example
/// ```rust
/// use sitedocs_ingest::IngestConfig;
/// use std::time::Duration;
///
/// let config = IngestConfig::builder()
///     .max_pages(20)
///     .concurrency(2)
///     .api_timeout(Duration::from_secs(45))
///     .build()
///     .unwrap();
/// assert_eq!(config.max_pages, 20);
/// ```
#[derive(Clone)]
pub struct IngestConfig {
    /// Upscaling factor applied when rasterising pages. Default: 2.0.
    ///
    /// Title-block text on drawing sets is often 6–8 pt; doubling the
    /// nominal resolution keeps it legible to the vision model.
    pub render_scale: f32,

    /// Maximum pages analysed per document. Default: 50.
    ///
    /// Pages beyond the cap are not analysed and do not appear in the result.
    pub max_pages: usize,

    /// Pages analysed concurrently within one batch. Default: 3.
    ///
    /// Bounded to respect the vision API's rate limits, not for CPU use.
    pub concurrency: usize,

    /// Pause between page batches. Default: 500 ms.
    pub batch_pause: Duration,

    /// Per-call vision-model timeout. Default: 30 s.
    pub api_timeout: Duration,

    /// Timeout for rasterising a whole document. Default: 120 s.
    pub render_timeout: Duration,

    /// Age after which a PROCESSING job is considered abandoned. Default: 15 min.
    pub stuck_job_timeout: Duration,

    /// Jobs processed concurrently by the in-process queue. Default: 2.
    pub max_concurrent_jobs: usize,

    /// Analyse every page of a PDF (true) or only the first (false). Default: true.
    pub multi_page: bool,

    /// LLM model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 2048.
    pub max_tokens: usize,

    /// Retries for transient model failures (rate limit, 5xx). Default: 2.
    pub max_retries: u32,

    /// Initial retry delay, doubled per attempt. Default: 500 ms.
    pub retry_backoff: Duration,

    /// Timeout for fetching source bytes from storage. Default: 120 s.
    pub download_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            render_scale: 2.0,
            max_pages: 50,
            concurrency: 3,
            batch_pause: Duration::from_millis(500),
            api_timeout: Duration::from_secs(30),
            render_timeout: Duration::from_secs(120),
            stuck_job_timeout: Duration::from_secs(15 * 60),
            max_concurrent_jobs: 2,
            multi_page: true,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 2048,
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            download_timeout: Duration::from_secs(120),
        }
    }
}

impl fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestConfig")
            .field("render_scale", &self.render_scale)
            .field("max_pages", &self.max_pages)
            .field("concurrency", &self.concurrency)
            .field("batch_pause", &self.batch_pause)
            .field("api_timeout", &self.api_timeout)
            .field("render_timeout", &self.render_timeout)
            .field("stuck_job_timeout", &self.stuck_job_timeout)
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .field("multi_page", &self.multi_page)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("download_timeout", &self.download_timeout)
            .finish()
    }
}

impl IngestConfig {
    /// Create a new builder for `IngestConfig`.
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load configuration from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `INGEST_MAX_PAGES` | `50` | Page cap per document |
    /// | `INGEST_CONCURRENCY` | `3` | Pages per batch |
    /// | `INGEST_BATCH_PAUSE_MS` | `500` | Pause between batches |
    /// | `INGEST_API_TIMEOUT_SECS` | `30` | Per-call model timeout |
    /// | `INGEST_RENDER_TIMEOUT_SECS` | `120` | Rasterisation timeout |
    /// | `INGEST_STUCK_TIMEOUT_SECS` | `900` | Stuck-job threshold |
    /// | `INGEST_MAX_CONCURRENT_JOBS` | `2` | Jobs processed at once |
    /// | `INGEST_MULTI_PAGE` | `true` | Analyse all pages |
    /// | `INGEST_DOWNLOAD_TIMEOUT_SECS` | `120` | Storage fetch timeout |
    /// | `EDGEQUAKE_LLM_PROVIDER` | — | Provider name |
    /// | `EDGEQUAKE_MODEL` | — | Model id |
    pub fn from_env() -> Result<Self, IngestError> {
        let mut b = Self::builder();
        if let Some(v) = env_parse::<usize>("INGEST_MAX_PAGES") {
            b = b.max_pages(v);
        }
        if let Some(v) = env_parse::<usize>("INGEST_CONCURRENCY") {
            b = b.concurrency(v);
        }
        if let Some(v) = env_parse::<u64>("INGEST_BATCH_PAUSE_MS") {
            b = b.batch_pause(Duration::from_millis(v));
        }
        if let Some(v) = env_parse::<u64>("INGEST_API_TIMEOUT_SECS") {
            b = b.api_timeout(Duration::from_secs(v));
        }
        if let Some(v) = env_parse::<u64>("INGEST_RENDER_TIMEOUT_SECS") {
            b = b.render_timeout(Duration::from_secs(v));
        }
        if let Some(v) = env_parse::<u64>("INGEST_STUCK_TIMEOUT_SECS") {
            b = b.stuck_job_timeout(Duration::from_secs(v));
        }
        if let Some(v) = env_parse::<usize>("INGEST_MAX_CONCURRENT_JOBS") {
            b = b.max_concurrent_jobs(v);
        }
        if let Some(v) = env_parse::<u64>("INGEST_DOWNLOAD_TIMEOUT_SECS") {
            b = b.download_timeout(Duration::from_secs(v));
        }
        if let Ok(v) = std::env::var("INGEST_MULTI_PAGE") {
            b = b.multi_page(v != "false" && v != "0");
        }
        if let Ok(v) = std::env::var("EDGEQUAKE_LLM_PROVIDER") {
            if !v.is_empty() {
                b = b.provider_name(v);
            }
        }
        if let Ok(v) = std::env::var("EDGEQUAKE_MODEL") {
            if !v.is_empty() {
                b = b.model(v);
            }
        }
        b.build()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Builder for [`IngestConfig`].
#[derive(Debug)]
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl IngestConfigBuilder {
    pub fn render_scale(mut self, scale: f32) -> Self {
        self.config.render_scale = scale.clamp(0.5, 4.0);
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = n.max(1);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn batch_pause(mut self, pause: Duration) -> Self {
        self.config.batch_pause = pause;
        self
    }

    pub fn api_timeout(mut self, timeout: Duration) -> Self {
        self.config.api_timeout = timeout;
        self
    }

    pub fn render_timeout(mut self, timeout: Duration) -> Self {
        self.config.render_timeout = timeout;
        self
    }

    pub fn stuck_job_timeout(mut self, timeout: Duration) -> Self {
        self.config.stuck_job_timeout = timeout;
        self
    }

    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.config.max_concurrent_jobs = n.max(1);
        self
    }

    pub fn multi_page(mut self, v: bool) -> Self {
        self.config.multi_page = v;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.config.download_timeout = timeout;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<IngestConfig, IngestError> {
        let c = &self.config;
        if c.api_timeout.is_zero() {
            return Err(IngestError::InvalidConfig(
                "API timeout must be greater than zero".into(),
            ));
        }
        if c.download_timeout.is_zero() {
            return Err(IngestError::InvalidConfig(
                "Download timeout must be greater than zero".into(),
            ));
        }
        if c.render_timeout.is_zero() {
            return Err(IngestError::InvalidConfig(
                "Render timeout must be greater than zero".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(IngestError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        Ok(self.config)
    }
}
