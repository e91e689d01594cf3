use axum::http::HeaderMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uia_core::config::RateLimitConfig;

/// In-memory windowed rate limiter, one per UIA endpoint, keyed by remote
/// address.
pub struct RateLimiter {
    max: u64,
    window: Duration,
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max: config.max,
            window: Duration::from_millis(config.window_ms),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request for `key`; false when the window budget is spent.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(_) => return true, // Poisoned mutex, allow through
        };
        let entry = counters.entry(key.to_string()).or_insert((0, now));
        if now.duration_since(entry.1) >= self.window {
            entry.0 = 0;
            entry.1 = now;
        }
        entry.0 += 1;
        entry.0 <= self.max
    }
}

/// Bearer token from the Authorization header, or the `access_token`
/// query parameter. The header wins.
pub fn access_token<'a>(
    headers: &'a HeaderMap,
    query: &'a HashMap<String, String>,
) -> Option<String> {
    let from_header = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim().to_string())
        });
    from_header.or_else(|| query.get("access_token").cloned())
}

/// Decode a raw query string. A parameter supplied multiple times keeps
/// its last value.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── RateLimiter ──────────────────────────────────────────────

    #[test]
    fn allows_up_to_max_within_window() {
        let limiter = RateLimiter::new(&RateLimitConfig { window_ms: 60_000, max: 3 });
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(!limiter.check("1.2.3.4"));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(&RateLimitConfig { window_ms: 60_000, max: 1 });
        assert!(limiter.check("1.2.3.4"));
        assert!(!limiter.check("1.2.3.4"));
        assert!(limiter.check("5.6.7.8"));
    }

    #[test]
    fn window_resets_the_budget() {
        let limiter = RateLimiter::new(&RateLimitConfig { window_ms: 30, max: 1 });
        assert!(limiter.check("ip"));
        assert!(!limiter.check("ip"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.check("ip"));
    }

    // ── access_token ─────────────────────────────────────────────

    #[test]
    fn bearer_header_is_preferred() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Bearer from-header".parse().unwrap());
        let query = [("access_token".to_string(), "from-query".to_string())]
            .into_iter()
            .collect();
        assert_eq!(access_token(&headers, &query).as_deref(), Some("from-header"));
    }

    #[test]
    fn query_parameter_is_fallback() {
        let query = [("access_token".to_string(), "from-query".to_string())]
            .into_iter()
            .collect();
        assert_eq!(access_token(&HeaderMap::new(), &query).as_deref(), Some("from-query"));
    }

    #[test]
    fn non_bearer_scheme_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert_eq!(access_token(&headers, &HashMap::new()), None);
    }

    #[test]
    fn missing_everywhere_is_none() {
        assert_eq!(access_token(&HeaderMap::new(), &HashMap::new()), None);
    }

    // ── parse_query ──────────────────────────────────────────────

    #[test]
    fn repeated_parameter_keeps_last_value() {
        let parsed = parse_query("state=first&state=second");
        assert_eq!(parsed.get("state").map(String::as_str), Some("second"));
    }

    #[test]
    fn decodes_percent_encoding() {
        let parsed = parse_query("redirectUrl=http%3A%2F%2Fclient%2Fpath");
        assert_eq!(
            parsed.get("redirectUrl").map(String::as_str),
            Some("http://client/path")
        );
    }
}
