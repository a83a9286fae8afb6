//! Best-effort notifications when a job reaches a terminal state.
//!
//! Delivery failures are logged and swallowed: a notification can never
//! revert or retry the job that triggered it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Error,
}

/// A user-facing notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub category: String,
    pub action_url: Option<String>,
    pub data: serde_json::Value,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        job_id: Uuid,
        file_name: String,
        page_count: usize,
    },
    Failed {
        job_id: Uuid,
        file_name: String,
        error: String,
    },
}

impl JobOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobOutcome::Completed { job_id, .. } | JobOutcome::Failed { job_id, .. } => *job_id,
        }
    }

    fn into_notification(self, user_id: Uuid) -> Notification {
        match self {
            JobOutcome::Completed {
                job_id,
                file_name,
                page_count,
            } => Notification {
                user_id,
                title: "Document analysis complete".into(),
                message: format!(
                    "{file_name} was analyzed ({page_count} page{}).",
                    if page_count == 1 { "" } else { "s" }
                ),
                severity: Severity::Success,
                category: "document-analysis".into(),
                action_url: Some(format!("/ocr/jobs/{job_id}")),
                data: serde_json::json!({ "jobId": job_id, "pageCount": page_count }),
            },
            JobOutcome::Failed {
                job_id,
                file_name,
                error,
            } => Notification {
                user_id,
                title: "Document analysis failed".into(),
                message: format!("{file_name} could not be analyzed: {error}"),
                severity: Severity::Error,
                category: "document-analysis".into(),
                action_url: Some(format!("/ocr/jobs/{job_id}")),
                data: serde_json::json!({ "jobId": job_id, "error": error }),
            },
        }
    }
}

/// A delivery channel (push gateway, email, webhook, …).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), String>;
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, n: &Notification) -> Result<(), String> {
        info!(user = %n.user_id, severity = ?n.severity, "{}: {}", n.title, n.message);
        Ok(())
    }
}

/// POSTs each notification as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, n: &Notification) -> Result<(), String> {
        let resp = self
            .client
            .post(&self.url)
            .json(n)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook returned HTTP {}", resp.status()))
        }
    }
}

/// Fans a job outcome out to every configured notifier.
#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotificationDispatcher {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Deliver to every notifier. Never fails.
    pub async fn notify(&self, user_id: Uuid, outcome: JobOutcome) {
        let job_id = outcome.job_id();
        let notification = outcome.into_notification(user_id);
        for notifier in &self.notifiers {
            match notifier.send(&notification).await {
                Ok(()) => debug!("Notified user {} about job {}", user_id, job_id),
                Err(e) => warn!("Notification for job {} not delivered: {}", job_id, e),
            }
        }
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("notifiers", &self.notifiers.len())
            .finish()
    }
}
