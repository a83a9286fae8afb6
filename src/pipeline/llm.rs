//! Vision-model interaction: one page image in, typed page data out.
//!
//! [`VisionModel`] is the seam to the external multimodal API; the
//! production implementation [`LlmVisionModel`] wraps an
//! `edgequake_llm::LLMProvider`. [`VisionExtractor`] owns everything around
//! the call: prompt construction, the per-call timeout, failure
//! classification, retry of transient failures, response parsing and
//! post-processing.
//!
//! ## Retry Strategy
//!
//! Only rate-limit and 5xx failures are retried, with exponential backoff
//! (`retry_backoff * 2^attempt`). A timeout is never retried: the page has
//! already consumed its time budget and the batch is waiting on it.

use crate::config::IngestConfig;
use crate::error::{ExtractionFailure, IngestError, VisionModelError};
use crate::output::ExtractedDocumentData;
use crate::pipeline::{encode, matching, parse};
use crate::projects::KnownProject;
use crate::prompts::extraction_prompt;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

/// One page-analysis request.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    /// 1-indexed
    pub page_number: usize,
    pub prompt: String,
    pub image: ImageData,
}

/// An external multimodal model that reads a page image.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Return the model's raw text reply.
    async fn analyze(&self, request: VisionRequest) -> Result<String, VisionModelError>;
}

/// [`VisionModel`] backed by an edgequake-llm provider.
pub struct LlmVisionModel {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl LlmVisionModel {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &IngestConfig) -> Self {
        Self {
            provider,
            options: CompletionOptions {
                temperature: Some(config.temperature),
                max_tokens: Some(config.max_tokens),
                ..Default::default()
            },
        }
    }

    /// Resolve the provider from `config` and the environment.
    pub fn from_config(config: &IngestConfig) -> Result<Self, IngestError> {
        Ok(Self::new(resolve_provider(config)?, config))
    }
}

#[async_trait]
impl VisionModel for LlmVisionModel {
    async fn analyze(&self, request: VisionRequest) -> Result<String, VisionModelError> {
        // The prompt carries all instructions; the user turn carries the page.
        let messages = vec![
            ChatMessage::system(request.prompt.as_str()),
            ChatMessage::user_with_images("", vec![request.image]),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| VisionModelError::new(e.to_string()))?;

        debug!(
            "Page {}: {} input tokens, {} output tokens",
            request.page_number, response.prompt_tokens, response.completion_tokens
        );
        Ok(response.content)
    }
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. pre-built provider (`config.provider`)
/// 2. named provider + model (`config.provider_name`, `config.model`)
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`
/// 4. `OPENAI_API_KEY` present → OpenAI
/// 5. `ProviderFactory::from_env` auto-detection
pub fn resolve_provider(config: &IngestConfig) -> Result<Arc<dyn LLMProvider>, IngestError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-mini");
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or("gpt-4.1-mini");
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| IngestError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {e}"
            ),
        })?;

    Ok(llm_provider)
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, IngestError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        IngestError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

// ── Failure classification ───────────────────────────────────────────────

static RE_HTTP_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([45]\d\d)\b").unwrap());

const AUTH_HINTS: &[&str] = &[
    "api key",
    "api_key",
    "apikey",
    "unauthorized",
    "authentication",
    "permission denied",
    "forbidden",
];
const RATE_LIMIT_HINTS: &[&str] = &["rate limit", "rate_limit", "too many requests", "quota"];
const CONNECTION_HINTS: &[&str] = &[
    "timed out",
    "timeout",
    "connection",
    "connect",
    "dns",
    "network",
    "unreachable",
];
const BAD_REQUEST_HINTS: &[&str] = &[
    "bad request",
    "invalid_request",
    "invalid image",
    "unsupported image",
    "could not process image",
];
const SERVER_HINTS: &[&str] = &[
    "overloaded",
    "internal server error",
    "service unavailable",
    "bad gateway",
    "server error",
];

/// Map a raw model error onto one of the fixed user-facing failure classes.
pub fn classify_failure(err: &VisionModelError) -> ExtractionFailure {
    let status = err.status.or_else(|| {
        RE_HTTP_STATUS
            .captures(&err.message)
            .and_then(|c| c[1].parse().ok())
    });

    if let Some(code) = status {
        match code {
            401 | 403 => return ExtractionFailure::Auth,
            429 => return ExtractionFailure::RateLimited,
            408 => return ExtractionFailure::Connection,
            400 | 413 | 415 | 422 => return ExtractionFailure::BadRequest,
            500..=599 => return ExtractionFailure::Server,
            _ => {}
        }
    }

    let msg = err.message.to_lowercase();
    let has = |hints: &[&str]| hints.iter().any(|h| msg.contains(h));

    if has(AUTH_HINTS) {
        ExtractionFailure::Auth
    } else if has(RATE_LIMIT_HINTS) {
        ExtractionFailure::RateLimited
    } else if has(SERVER_HINTS) {
        ExtractionFailure::Server
    } else if has(CONNECTION_HINTS) {
        ExtractionFailure::Connection
    } else if has(BAD_REQUEST_HINTS) {
        ExtractionFailure::BadRequest
    } else {
        ExtractionFailure::Other
    }
}

// ── Extractor ────────────────────────────────────────────────────────────

/// Drives one vision call per page with timeout, retry and parsing.
#[derive(Clone)]
pub struct VisionExtractor {
    model: Arc<dyn VisionModel>,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl VisionExtractor {
    pub fn new(model: Arc<dyn VisionModel>, config: &IngestConfig) -> Self {
        Self {
            model,
            timeout: config.api_timeout,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
        }
    }

    /// Extract one page's title-block data.
    ///
    /// Returns `Err` only when the model call itself failed. An unparseable
    /// reply or a model-declared "not a construction document" is an `Ok`
    /// value with `error` set.
    pub async fn extract_page(
        &self,
        page_number: usize,
        image: &DynamicImage,
        projects: &[KnownProject],
    ) -> Result<ExtractedDocumentData, ExtractionFailure> {
        let start = Instant::now();
        let image_data = encode::encode_page(image).map_err(|e| {
            warn!("Page {}: image encoding failed: {}", page_number, e);
            ExtractionFailure::Other
        })?;
        let prompt = extraction_prompt(projects);

        let mut attempt = 0u32;
        let reply = loop {
            let request = VisionRequest {
                page_number,
                prompt: prompt.clone(),
                image: image_data.clone(),
            };

            let failure = match tokio::time::timeout(self.timeout, self.model.analyze(request)).await
            {
                Ok(Ok(text)) => break text,
                Ok(Err(e)) => {
                    let failure = classify_failure(&e);
                    warn!("Page {}: attempt {} failed — {} ({})", page_number, attempt + 1, failure, e);
                    failure
                }
                Err(_) => {
                    warn!("Page {}: timed out after {:?}", page_number, self.timeout);
                    return Err(ExtractionFailure::Timeout {
                        secs: self.timeout.as_secs(),
                    });
                }
            };

            if !failure.is_transient() || attempt >= self.max_retries {
                return Err(failure);
            }
            let backoff = self.retry_backoff * 2u32.pow(attempt);
            attempt += 1;
            warn!(
                "Page {}: retry {}/{} after {:?}",
                page_number, attempt, self.max_retries, backoff
            );
            sleep(backoff).await;
        };

        let data = matching::post_process(parse::parse_extraction(&reply), projects);
        debug!("Page {}: extracted in {:?}", page_number, start.elapsed());
        Ok(data)
    }
}
