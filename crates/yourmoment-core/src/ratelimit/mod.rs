//! Rate limiting for API traffic and outbound scraping.
//!
//! Two cooperating pieces:
//!
//! - [`RateLimiter`]: token-bucket plus sliding-window limiter keyed by
//!   `rule_name:identifier`. A request is admitted only when both the window
//!   (at most `requests` hits in `window` seconds) and the bucket (at least
//!   one token) permit it. Tokens refill continuously at `requests/window`
//!   per second, capped at `burst`.
//! - [`ScrapingRateLimiter`]: wraps a `RateLimiter` with per-domain minimum
//!   gaps so outbound scraping stays polite.
//!
//! State is in-memory and mutex-guarded; buckets idle for more than an hour
//! are evicted during periodic cleanup passes.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Configuration for a rate limiting rule.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRule {
    /// Number of requests allowed per window.
    pub requests: u32,
    /// Window length in seconds.
    pub window: u64,
    /// Bucket capacity (defaults to `requests`).
    pub burst: u32,
}

impl RateLimitRule {
    /// Create a rule with `burst == requests`.
    pub fn new(requests: u32, window: u64) -> Self {
        Self {
            requests,
            window,
            burst: requests,
        }
    }

    /// Create a rule with an explicit burst capacity.
    pub fn with_burst(requests: u32, window: u64, burst: u32) -> Self {
        Self {
            requests,
            window,
            burst,
        }
    }
}

/// Outcome details for a rate limit check.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    /// The rule that was applied.
    pub rule: String,
    /// Requests allowed per window.
    pub limit: u32,
    /// Window length in seconds.
    pub window: u64,
    /// Seconds to wait before retrying, set when denied.
    pub retry_after: Option<u64>,
    /// Requests remaining in the current window.
    pub requests_remaining: u32,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    requests: VecDeque<Instant>,
}

#[derive(Debug)]
struct LimiterState {
    buckets: HashMap<String, Bucket>,
    last_cleanup: Instant,
}

/// Token-bucket based rate limiter with sliding window support.
#[derive(Debug)]
pub struct RateLimiter {
    rules: Mutex<HashMap<String, RateLimitRule>>,
    state: Mutex<LimiterState>,
}

/// How often idle buckets are swept.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Buckets idle for longer than this are evicted.
const BUCKET_IDLE_CUTOFF: Duration = Duration::from_secs(3600);

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Create a limiter preloaded with the default rule presets.
    pub fn new() -> Self {
        let mut rules = HashMap::new();
        rules.insert("api_general".to_string(), RateLimitRule::new(100, 60));
        rules.insert("api_auth".to_string(), RateLimitRule::new(5, 60));
        rules.insert("api_scraping".to_string(), RateLimitRule::new(10, 60));
        rules.insert(
            "scraping_platform".to_string(),
            RateLimitRule::with_burst(20, 60, 3),
        );
        rules.insert(
            "scraping_general".to_string(),
            RateLimitRule::with_burst(30, 60, 5),
        );

        Self {
            rules: Mutex::new(rules),
            state: Mutex::new(LimiterState {
                buckets: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Add or replace a rule.
    pub fn add_rule(&self, name: &str, rule: RateLimitRule) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.insert(name.to_string(), rule);
            tracing::info!(
                rule = name,
                requests = rule.requests,
                window = rule.window,
                "rate limit rule configured"
            );
        }
    }

    /// Bucket key for an identifier under a rule.
    fn bucket_key(identifier: &str, rule_name: &str) -> String {
        format!("{rule_name}:{identifier}")
    }

    /// Check whether a request is allowed, consuming a token on admission.
    ///
    /// Unknown rule names allow the request (with a warning) so that a
    /// misconfigured preset never blocks traffic.
    pub fn is_allowed(&self, identifier: &str, rule_name: &str) -> (bool, Option<RateLimitDecision>) {
        self.is_allowed_at(identifier, rule_name, Instant::now())
    }

    fn is_allowed_at(
        &self,
        identifier: &str,
        rule_name: &str,
        now: Instant,
    ) -> (bool, Option<RateLimitDecision>) {
        // A poisoned lock means a sibling task panicked mid-update; fail
        // open rather than propagating the panic into every caller.
        let rule = {
            let Ok(rules) = self.rules.lock() else {
                return (true, None);
            };
            match rules.get(rule_name) {
                Some(rule) => *rule,
                None => {
                    tracing::warn!(rule = rule_name, "rate limit rule not found, allowing request");
                    return (true, None);
                }
            }
        };

        let Ok(mut state) = self.state.lock() else {
            return (true, None);
        };

        if now.duration_since(state.last_cleanup) >= CLEANUP_INTERVAL {
            Self::cleanup_idle(&mut state, now);
        }

        let key = Self::bucket_key(identifier, rule_name);
        let bucket = state.buckets.entry(key).or_insert_with(|| Bucket {
            tokens: f64::from(rule.burst),
            last_refill: now,
            requests: VecDeque::new(),
        });

        // Continuous refill at requests/window, capped at burst.
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        let refill = elapsed / rule.window as f64 * f64::from(rule.requests);
        bucket.tokens = (bucket.tokens + refill).min(f64::from(rule.burst));
        bucket.last_refill = now;

        // Sliding window: drop requests older than the window.
        let window = Duration::from_secs(rule.window);
        while let Some(front) = bucket.requests.front() {
            if now.duration_since(*front) >= window {
                bucket.requests.pop_front();
            } else {
                break;
            }
        }

        if bucket.requests.len() as u32 >= rule.requests {
            let retry_after = bucket
                .requests
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)).as_secs())
                .unwrap_or(rule.window);
            return (
                false,
                Some(RateLimitDecision {
                    rule: rule_name.to_string(),
                    limit: rule.requests,
                    window: rule.window,
                    retry_after: Some(retry_after),
                    requests_remaining: 0,
                }),
            );
        }

        if bucket.tokens < 1.0 {
            let time_until_token = rule.window as f64 / f64::from(rule.requests);
            return (
                false,
                Some(RateLimitDecision {
                    rule: rule_name.to_string(),
                    limit: rule.requests,
                    window: rule.window,
                    retry_after: Some(time_until_token as u64),
                    requests_remaining: 0,
                }),
            );
        }

        bucket.tokens -= 1.0;
        bucket.requests.push_back(now);

        let remaining_window = rule.requests.saturating_sub(bucket.requests.len() as u32);
        let remaining_tokens = bucket.tokens as u32;
        (
            true,
            Some(RateLimitDecision {
                rule: rule_name.to_string(),
                limit: rule.requests,
                window: rule.window,
                retry_after: None,
                requests_remaining: remaining_window.min(remaining_tokens),
            }),
        )
    }

    fn cleanup_idle(state: &mut LimiterState, now: Instant) {
        let before = state.buckets.len();
        state
            .buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < BUCKET_IDLE_CUTOFF);
        let evicted = before - state.buckets.len();
        if evicted > 0 {
            tracing::info!(evicted, "cleaned up idle rate limit buckets");
        }
        state.last_cleanup = now;
    }

    /// Evict idle buckets immediately (used by the scheduler job).
    pub fn cleanup(&self) {
        if let Ok(mut state) = self.state.lock() {
            Self::cleanup_idle(&mut state, Instant::now());
        }
    }

    /// Number of live buckets (for status reporting).
    pub fn active_buckets(&self) -> usize {
        self.state.lock().map(|state| state.buckets.len()).unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct ScrapingState {
    last_request_times: HashMap<String, Instant>,
}

/// Rate limiter for outbound scraping with per-domain minimum gaps.
#[derive(Debug)]
pub struct ScrapingRateLimiter {
    limiter: RateLimiter,
    platform_domains: Vec<String>,
    platform_delay: Duration,
    default_delay: Duration,
    state: Mutex<ScrapingState>,
}

impl ScrapingRateLimiter {
    /// Create a scraping limiter.
    ///
    /// `platform_base_url` determines which domain gets the (longer)
    /// platform delay; every other domain gets the default delay.
    pub fn new(platform_base_url: &str, platform_delay: Duration, default_delay: Duration) -> Self {
        let platform_domains = url::Url::parse(platform_base_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| vec![h.to_lowercase()]))
            .unwrap_or_default();

        Self {
            limiter: RateLimiter::new(),
            platform_domains,
            platform_delay,
            default_delay,
            state: Mutex::new(ScrapingState::default()),
        }
    }

    fn domain_of(url: &str) -> String {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn delay_for(&self, domain: &str) -> Duration {
        if self.platform_domains.iter().any(|d| d == domain) {
            self.platform_delay
        } else {
            self.default_delay
        }
    }

    /// Sleep as long as needed to respect the per-domain minimum gap, then
    /// record the request. Returns the time waited.
    pub async fn wait_if_needed(&self, url: &str) -> Duration {
        let domain = Self::domain_of(url);
        let delay = self.delay_for(&domain);

        let wait = {
            match self.state.lock() {
                Ok(state) => match state.last_request_times.get(&domain) {
                    Some(last) => delay.saturating_sub(last.elapsed()),
                    None => Duration::ZERO,
                },
                // Poisoned state: skip the gap rather than panic the stage.
                Err(_) => Duration::ZERO,
            }
        };

        if !wait.is_zero() {
            tracing::debug!(
                domain = %domain,
                wait_ms = wait.as_millis() as u64,
                "rate limiting outbound request"
            );
            tokio::time::sleep(wait).await;
        }

        self.record_request(url);
        wait
    }

    /// Record that a request was made to a URL's domain.
    pub fn record_request(&self, url: &str) {
        let domain = Self::domain_of(url);
        if let Ok(mut state) = self.state.lock() {
            state.last_request_times.insert(domain, Instant::now());
        }
    }

    /// Check the window/bucket limits for a scraping session without waiting.
    pub fn is_scraping_allowed(&self, url: &str, session_id: &str) -> bool {
        let domain = Self::domain_of(url);
        let rule_name = if self.platform_domains.iter().any(|d| *d == domain) {
            "scraping_platform"
        } else {
            "scraping_general"
        };
        let identifier = format!("scraping:{session_id}:{domain}");
        self.limiter.is_allowed(&identifier, rule_name).0
    }

    /// Access the inner rule-based limiter (for cleanup scheduling).
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_rule_allows() {
        let limiter = RateLimiter::new();
        let (allowed, decision) = limiter.is_allowed("user:1", "no_such_rule");
        assert!(allowed);
        assert!(decision.is_none());
    }

    #[test]
    fn burst_limit_enforced() {
        let limiter = RateLimiter::new();
        limiter.add_rule("test_burst", RateLimitRule::with_burst(100, 60, 3));

        let now = Instant::now();
        for i in 0..3 {
            let (allowed, _) = limiter.is_allowed_at("user:1", "test_burst", now);
            assert!(allowed, "request {i} should be admitted");
        }
        // Bucket is drained; the window (100/min) still has room.
        let (allowed, decision) = limiter.is_allowed_at("user:1", "test_burst", now);
        assert!(!allowed);
        let decision = decision.unwrap();
        assert_eq!(decision.requests_remaining, 0);
        assert!(decision.retry_after.is_some());
    }

    #[test]
    fn sliding_window_enforced() {
        let limiter = RateLimiter::new();
        limiter.add_rule("test_window", RateLimitRule::with_burst(2, 60, 10));

        let now = Instant::now();
        assert!(limiter.is_allowed_at("ip:1.2.3.4", "test_window", now).0);
        assert!(limiter.is_allowed_at("ip:1.2.3.4", "test_window", now).0);
        let (allowed, decision) = limiter.is_allowed_at("ip:1.2.3.4", "test_window", now);
        assert!(!allowed);
        assert_eq!(decision.unwrap().limit, 2);
    }

    #[test]
    fn window_slides_forward() {
        let limiter = RateLimiter::new();
        limiter.add_rule("test_slide", RateLimitRule::with_burst(2, 1, 10));

        let now = Instant::now();
        assert!(limiter.is_allowed_at("u", "test_slide", now).0);
        assert!(limiter.is_allowed_at("u", "test_slide", now).0);
        assert!(!limiter.is_allowed_at("u", "test_slide", now).0);

        // After the window passes, requests are admitted again.
        let later = now + Duration::from_secs(2);
        assert!(limiter.is_allowed_at("u", "test_slide", later).0);
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new();
        // 60 requests/minute, burst 1: one token refills per second.
        limiter.add_rule("test_refill", RateLimitRule::with_burst(60, 60, 1));

        let now = Instant::now();
        assert!(limiter.is_allowed_at("u", "test_refill", now).0);
        assert!(!limiter.is_allowed_at("u", "test_refill", now).0);

        let later = now + Duration::from_millis(1100);
        assert!(limiter.is_allowed_at("u", "test_refill", later).0);
    }

    #[test]
    fn identifiers_are_isolated() {
        let limiter = RateLimiter::new();
        limiter.add_rule("test_iso", RateLimitRule::with_burst(1, 60, 1));

        let now = Instant::now();
        assert!(limiter.is_allowed_at("user:1", "test_iso", now).0);
        assert!(!limiter.is_allowed_at("user:1", "test_iso", now).0);
        assert!(limiter.is_allowed_at("user:2", "test_iso", now).0);
    }

    #[test]
    fn default_presets_exist() {
        let limiter = RateLimiter::new();
        for rule in [
            "api_general",
            "api_auth",
            "api_scraping",
            "scraping_platform",
            "scraping_general",
        ] {
            let (allowed, decision) = limiter.is_allowed("preset-check", rule);
            assert!(allowed, "preset {rule} should admit the first request");
            assert!(decision.is_some());
        }
    }

    #[test]
    fn cleanup_evicts_idle_buckets() {
        let limiter = RateLimiter::new();
        limiter.add_rule("test_evict", RateLimitRule::new(10, 60));

        let old = Instant::now() - Duration::from_secs(7200);
        let _ = limiter.is_allowed_at("stale", "test_evict", old);
        assert_eq!(limiter.active_buckets(), 1);

        limiter.cleanup();
        assert_eq!(limiter.active_buckets(), 0);
    }

    #[tokio::test]
    async fn wait_if_needed_spaces_requests() {
        let limiter = ScrapingRateLimiter::new(
            "https://platform.example",
            Duration::from_millis(50),
            Duration::from_millis(10),
        );

        let first = limiter.wait_if_needed("https://platform.example/articles/").await;
        assert_eq!(first, Duration::ZERO);

        let second = limiter.wait_if_needed("https://platform.example/articles/").await;
        assert!(second > Duration::ZERO, "second request should have waited");
    }

    #[tokio::test]
    async fn other_domains_use_default_delay() {
        let limiter = ScrapingRateLimiter::new(
            "https://platform.example",
            Duration::from_secs(60),
            Duration::ZERO,
        );

        limiter.record_request("https://elsewhere.example/page");
        let waited = limiter.wait_if_needed("https://elsewhere.example/page").await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[test]
    fn scraping_allowed_uses_platform_rule() {
        let limiter = ScrapingRateLimiter::new(
            "https://platform.example",
            Duration::from_secs(2),
            Duration::from_secs(1),
        );

        // Platform burst is 3; the fourth immediate request is denied.
        for _ in 0..3 {
            assert!(limiter.is_scraping_allowed("https://platform.example/a", "s1"));
        }
        assert!(!limiter.is_scraping_allowed("https://platform.example/a", "s1"));

        // Other domains use the larger general burst.
        assert!(limiter.is_scraping_allowed("https://other.example/a", "s1"));
    }
}
