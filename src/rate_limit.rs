//! Fixed-window rate limiting for the expensive endpoints.
//!
//! Each key gets a counter that resets when its window ends. Counters live
//! behind the [`RateLimitStore`] trait; the bundled [`MemoryRateLimitStore`]
//! is per-process, so limits are enforced per instance when several
//! instances serve the same users.
//!
//! A store failure never rejects a request: the limiter fails open and logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// `limit` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitRule {
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    /// General API traffic: 100 per minute.
    pub const fn standard() -> Self {
        Self::new(100, Duration::from_secs(60))
    }

    /// Sensitive endpoints: 20 per minute.
    pub const fn strict() -> Self {
        Self::new(20, Duration::from_secs(60))
    }

    /// Login and password reset: 5 per 15 minutes.
    pub const fn auth() -> Self {
        Self::new(5, Duration::from_secs(15 * 60))
    }

    /// File uploads: 10 per minute.
    pub const fn upload() -> Self {
        Self::new(10, Duration::from_secs(60))
    }

    /// Document analysis submissions: 5 per minute.
    pub const fn analysis() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

/// Who is being limited, and where.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub ip: String,
    pub user_id: Option<String>,
    pub path: String,
}

impl RateLimitKey {
    pub fn new(ip: impl Into<String>, user_id: Option<String>, path: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_id,
            path: path.into(),
        }
    }

    /// Client IP, plus the user id when authenticated, plus the path.
    pub fn storage_key(&self) -> String {
        match &self.user_id {
            Some(user) => format!("ip:{}:user:{}:{}", self.ip, user, self.path),
            None => format!("ip:{}:{}", self.ip, self.path),
        }
    }
}

/// Counter state for one key after a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one request against `key`, opening a new window if the current
    /// one has ended.
    async fn hit(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<WindowCount, String>;

    /// Drop every window that ended before `now`. Returns how many went.
    async fn purge_expired(&self, now: DateTime<Utc>) -> usize;

    async fn len(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    windows: Mutex<HashMap<String, WindowCount>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<WindowCount, String> {
        let mut windows = self.windows.lock().map_err(|e| e.to_string())?;
        let entry = windows.entry(key.to_string()).or_insert(WindowCount {
            count: 0,
            reset_at: now,
        });
        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + to_chrono(window);
        }
        entry.count = entry.count.saturating_add(1);
        Ok(*entry)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let Ok(mut windows) = self.windows.lock() else {
            return 0;
        };
        let before = windows.len();
        windows.retain(|_, w| w.reset_at > now);
        before - windows.len()
    }

    async fn len(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Set only when the request was rejected.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// Standard response headers for this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ];
        if let Some(retry) = self.retry_after {
            // Round up so clients never retry a moment too early.
            let secs = retry.as_secs() + u64::from(retry.subsec_nanos() > 0);
            headers.push(("Retry-After", secs.to_string()));
        }
        headers
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRateLimitStore::new()))
    }

    pub async fn check(&self, key: &RateLimitKey, rule: RateLimitRule) -> RateLimitDecision {
        self.check_at(key, rule, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        key: &RateLimitKey,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let storage_key = key.storage_key();
        let window = match self.store.hit(&storage_key, rule.window, now).await {
            Ok(w) => w,
            Err(e) => {
                warn!("Rate-limit store error for {}: {} (allowing)", storage_key, e);
                return RateLimitDecision {
                    allowed: true,
                    limit: rule.limit,
                    remaining: rule.limit,
                    reset_at: now + to_chrono(rule.window),
                    retry_after: None,
                };
            }
        };

        let allowed = window.count <= rule.limit;
        let retry_after = if allowed {
            None
        } else {
            debug!("Rate limit hit for {} ({}/{})", storage_key, window.count, rule.limit);
            Some((window.reset_at - now).to_std().unwrap_or(Duration::ZERO))
        };

        RateLimitDecision {
            allowed,
            limit: rule.limit,
            remaining: rule.limit.saturating_sub(window.count),
            reset_at: window.reset_at,
            retry_after,
        }
    }

    pub async fn purge_expired(&self) -> usize {
        self.store.purge_expired(Utc::now()).await
    }

    pub async fn tracked_keys(&self) -> usize {
        self.store.len().await
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RateLimiter")
    }
}

/// Purge expired windows every `every`. Abort the handle to stop it.
pub fn spawn_purge_task(limiter: RateLimiter, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let purged = limiter.purge_expired().await;
            if purged > 0 {
                debug!("Purged {} expired rate-limit window(s)", purged);
            }
        }
    })
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX / 1_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ip: &str) -> RateLimitKey {
        RateLimitKey::new(ip, None, "/api/ocr/analyze")
    }

    #[tokio::test]
    async fn five_per_minute() {
        let limiter = RateLimiter::in_memory();
        let rule = RateLimitRule::analysis();
        let t0 = Utc::now();

        for i in 0..5 {
            let d = limiter.check_at(&key("1.2.3.4"), rule, t0).await;
            assert!(d.allowed, "request {} should pass", i + 1);
            assert_eq!(d.remaining, 4 - i);
        }

        let sixth = limiter.check_at(&key("1.2.3.4"), rule, t0 + chrono::Duration::seconds(10)).await;
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
        let retry = sixth.retry_after.unwrap();
        assert!(retry <= Duration::from_secs(60) && retry > Duration::ZERO);
        assert_eq!(retry, Duration::from_secs(50));

        let after = limiter.check_at(&key("1.2.3.4"), rule, t0 + chrono::Duration::seconds(60)).await;
        assert!(after.allowed);
        assert_eq!(after.remaining, 4);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::in_memory();
        let rule = RateLimitRule::new(1, Duration::from_secs(60));
        let now = Utc::now();
        assert!(limiter.check_at(&key("a"), rule, now).await.allowed);
        assert!(!limiter.check_at(&key("a"), rule, now).await.allowed);
        assert!(limiter.check_at(&key("b"), rule, now).await.allowed);

        let user = RateLimitKey::new("a", Some("u1".into()), "/api/ocr/analyze");
        assert!(limiter.check_at(&user, rule, now).await.allowed);
        assert!(!limiter.check_at(&user, rule, now).await.allowed);

        // Same user from a second address gets its own window.
        let elsewhere = RateLimitKey::new("b", Some("u1".into()), "/api/ocr/analyze");
        assert!(limiter.check_at(&elsewhere, rule, now).await.allowed);
        assert_ne!(user.storage_key(), elsewhere.storage_key());
    }

    #[tokio::test]
    async fn purge_drops_ended_windows() {
        let store = Arc::new(MemoryRateLimitStore::new());
        let limiter = RateLimiter::new(store.clone());
        let now = Utc::now();
        limiter.check_at(&key("a"), RateLimitRule::standard(), now).await;
        limiter.check_at(&key("b"), RateLimitRule::auth(), now).await;
        assert_eq!(limiter.tracked_keys().await, 2);

        let purged = store.purge_expired(now + chrono::Duration::minutes(2)).await;
        assert_eq!(purged, 1);
        assert_eq!(store.len().await, 1);
    }

    struct Broken;

    #[async_trait]
    impl RateLimitStore for Broken {
        async fn hit(&self, _: &str, _: Duration, _: DateTime<Utc>) -> Result<WindowCount, String> {
            Err("connection refused".into())
        }
        async fn purge_expired(&self, _: DateTime<Utc>) -> usize {
            0
        }
        async fn len(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let limiter = RateLimiter::new(Arc::new(Broken));
        let d = limiter.check(&key("a"), RateLimitRule::strict()).await;
        assert!(d.allowed);
        assert_eq!(d.limit, 20);
    }

    #[test]
    fn presets() {
        assert_eq!(RateLimitRule::standard(), RateLimitRule::new(100, Duration::from_secs(60)));
        assert_eq!(RateLimitRule::strict().limit, 20);
        assert_eq!(RateLimitRule::auth().window, Duration::from_secs(900));
        assert_eq!(RateLimitRule::upload().limit, 10);
    }

    #[test]
    fn retry_after_header_rounds_up() {
        let d = RateLimitDecision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at: Utc::now(),
            retry_after: Some(Duration::from_millis(1500)),
        };
        let headers = d.headers();
        assert!(headers.contains(&("Retry-After", "2".to_string())));
        assert!(headers.contains(&("X-RateLimit-Remaining", "0".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_task_runs_on_its_interval() {
        let limiter = RateLimiter::in_memory();
        let now = Utc::now();
        limiter
            .check_at(&key("a"), RateLimitRule::standard(), now - chrono::Duration::minutes(5))
            .await;
        limiter.check_at(&key("b"), RateLimitRule::auth(), now).await;
        assert_eq!(limiter.tracked_keys().await, 2);

        let task = spawn_purge_task(limiter.clone(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(limiter.tracked_keys().await, 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
