use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use beacon_core::trace::Capture;
use tracing::debug;

/// Default time a fingerprint is remembered before a repeat capture is
/// treated as new again.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// How often (in accesses) the cache opportunistically sweeps expired
/// entries, piggybacking on an in-flight `is_duplicate` call rather than
/// running its own timer.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Header subset whose values participate in the request fingerprint.
/// Everything else (Date, User-Agent, trace ids, ...) is deliberately
/// excluded so that cosmetic per-request variance doesn't defeat de-dup.
const FINGERPRINT_HEADERS: &[&str] = &["Content-Type", "Accept", "Authorization"];

struct Inner {
    seen: HashMap<u64, Instant>,
    last_cleanup: Instant,
}

/// TTL-bounded seen-set over a deterministic fingerprint of the dedup-relevant
/// fields of a capture. One mutex guards both the map and the opportunistic
/// cleanup sweep, matching the single coarse lock the cache is specified to
/// use (no mutation of the set happens outside it).
pub struct DedupCache {
    ttl: Duration,
    cleanup_interval: Duration,
    inner: Mutex<Inner>,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Returns `true` iff a capture with an identical fingerprint was
    /// recorded within the last TTL. Otherwise records this fingerprint as
    /// first-seen now and returns `false`.
    pub fn is_duplicate(&self, capture: &Capture) -> bool {
        let fp = fingerprint(capture);
        let now = Instant::now();

        let mut inner = self.inner.lock().expect("dedup cache mutex poisoned");

        if now.duration_since(inner.last_cleanup) > self.cleanup_interval {
            self.sweep(&mut inner, now);
        }

        if let Some(seen_at) = inner.seen.get(&fp).copied() {
            if now.duration_since(seen_at) < self.ttl {
                debug!(fingerprint = fp, "duplicate capture suppressed");
                return true;
            }
        }

        inner.seen.insert(fp, now);
        false
    }

    fn sweep(&self, inner: &mut Inner, now: Instant) {
        let ttl = self.ttl;
        let before = inner.seen.len();
        inner.seen.retain(|_, seen_at| now.duration_since(*seen_at) < ttl);
        inner.last_cleanup = now;
        let removed = before - inner.seen.len();
        if removed > 0 {
            debug!(removed, "swept expired dedup entries");
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("dedup cache mutex poisoned");
        inner.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("dedup cache mutex poisoned").seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

fn fingerprint(capture: &Capture) -> u64 {
    let mut hasher = DefaultHasher::new();
    capture.service.hash(&mut hasher);
    capture.method.to_string().hash(&mut hasher);
    capture.endpoint.hash(&mut hasher);
    capture.status_code.hash(&mut hasher);
    capture.kind.to_string().hash(&mut hasher);

    if capture.is_request() {
        let mut relevant: Vec<(&str, &str)> = capture
            .request_headers
            .iter()
            .filter(|(k, _)| FINGERPRINT_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(k)))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        relevant.sort_unstable();
        relevant.hash(&mut hasher);
    }

    hasher.finish()
}
