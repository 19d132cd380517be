use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use dashmap::DashMap;
use tokio::time::interval;
use tracing::{debug, info};

use crate::metrics::RATE_LIMIT_KEYS;

// Time source, injectable so windows can be tested without sleeping
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// Rate limit record - tracks requests per client key
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRecord {
    pub count: u32,
    pub window_reset_at: Instant,
}

impl RateLimitRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.window_reset_at
    }
}

/// Fixed-window admission control, one window per client key.
///
/// State is process-local: it is lost on restart and not shared between
/// instances.
pub struct AdmissionController {
    records: DashMap<String, RateLimitRecord>,
    limit: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self::with_clock(limit, window, Arc::new(SystemClock))
    }

    pub fn with_clock(limit: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            limit,
            window,
            clock,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }

    // true = admit, false = reject
    pub fn admit(&self, key: &str) -> bool {
        let now = self.clock.now();

        // the entry guard holds the shard lock, so check-then-increment is atomic per key
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert(RateLimitRecord {
                count: 0,
                window_reset_at: now + self.window,
            });

        // window expired..? start a new one
        if record.is_expired(now) {
            record.count = 1;
            record.window_reset_at = now + self.window;
            return true;
        }

        if record.count < self.limit {
            record.count += 1;
            return true;
        }

        false
    }

    // Drop records whose window has passed; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());
        RATE_LIMIT_KEYS.set(self.records.len() as f64);
        removed
    }

    pub fn record(&self, key: &str) -> Option<RateLimitRecord> {
        self.records.get(key).map(|r| *r)
    }
}

// Client key: first X-Forwarded-For hop, else the peer address
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match (forwarded, peer) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

// Expired-record sweeper - runs every `every`
pub async fn sweeper(admission: Arc<AdmissionController>, every: Duration) {
    let mut interval = interval(every);

    info!("Rate limit sweeper started (interval: {:?})", every);

    loop {
        interval.tick().await;

        let removed = admission.sweep();
        if removed > 0 {
            debug!(
                removed,
                remaining = admission.tracked_keys(),
                "Swept expired rate limit records"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use parking_lot::Mutex;

    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Instant::now()),
            })
        }

        fn advance(&self, by: Duration) {
            *self.now.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }
    }

    fn controller(clock: &Arc<ManualClock>) -> AdmissionController {
        AdmissionController::with_clock(10, Duration::from_millis(60_000), clock.clone())
    }

    #[test]
    fn test_eleventh_request_in_window_is_rejected() {
        let clock = ManualClock::new();
        let admission = controller(&clock);

        for i in 0..10 {
            assert!(admission.admit("1.2.3.4"), "request {} should pass", i + 1);
            clock.advance(Duration::from_millis(100));
        }
        assert!(!admission.admit("1.2.3.4"));
        assert!(!admission.admit("1.2.3.4"));
        assert_eq!(admission.record("1.2.3.4").unwrap().count, 10);
    }

    #[test]
    fn test_new_window_admits_regardless_of_prior_count() {
        let clock = ManualClock::new();
        let admission = controller(&clock);

        for _ in 0..12 {
            admission.admit("client");
        }
        assert!(!admission.admit("client"));

        clock.advance(Duration::from_millis(60_000));
        assert!(admission.admit("client"));
        assert_eq!(admission.record("client").unwrap().count, 1);
    }

    #[test]
    fn test_window_is_fixed_not_sliding() {
        let clock = ManualClock::new();
        let admission = AdmissionController::with_clock(2, Duration::from_secs(10), clock.clone());

        assert!(admission.admit("k"));
        clock.advance(Duration::from_secs(9));
        assert!(admission.admit("k"));
        assert!(!admission.admit("k"));
        // one second later the window that began at t=0 is over
        clock.advance(Duration::from_secs(1));
        assert!(admission.admit("k"));
    }

    #[test]
    fn test_keys_are_independent() {
        let clock = ManualClock::new();
        let admission = AdmissionController::with_clock(1, Duration::from_secs(60), clock.clone());

        assert!(admission.admit("a"));
        assert!(!admission.admit("a"));
        assert!(admission.admit("b"));
    }

    #[test]
    fn test_sweep_removes_only_expired_records() {
        let clock = ManualClock::new();
        let admission = controller(&clock);

        admission.admit("old");
        clock.advance(Duration::from_secs(30));
        admission.admit("young");
        clock.advance(Duration::from_secs(30));

        assert_eq!(admission.sweep(), 1);
        assert!(admission.record("old").is_none());
        assert!(admission.record("young").is_some());
        assert_eq!(admission.tracked_keys(), 1);
    }

    #[test]
    fn test_client_key_derivation() {
        let peer: SocketAddr = "10.0.0.7:51234".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers, Some(peer)), "10.0.0.7");
        assert_eq!(client_key(&headers, None), "unknown");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 70.41.3.18, 150.172.238.178"),
        );
        assert_eq!(client_key(&headers, Some(peer)), "203.0.113.9");

        headers.insert("x-forwarded-for", HeaderValue::from_static("  "));
        assert_eq!(client_key(&headers, Some(peer)), "10.0.0.7");
    }
}
