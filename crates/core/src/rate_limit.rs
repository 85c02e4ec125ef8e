//! Per-client sliding-window rate limiting.

use crate::limits::{RATE_LIMIT_REQUESTS, RATE_LIMIT_WINDOW};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window rate limiter keyed by client identity.
///
/// Each identity keeps the instants of its recently admitted requests, oldest
/// first. A request is admitted when fewer than `max_requests` of those fall
/// inside the half-open interval `(now - window, now]`. The map is shared by
/// every session, and the check-then-record step runs under the entry's shard
/// lock, so two sessions behind the same address cannot both take the last
/// slot.
pub struct RateLimiter<K = IpAddr>
where
    K: Eq + Hash,
{
    windows: DashMap<K, VecDeque<Instant>>,
    max_requests: usize,
    window: Duration,
}

impl<K> RateLimiter<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
        }
    }

    /// Returns `true` and records the request if `key` is under its quota.
    pub fn admit(&self, key: &K) -> bool {
        self.admit_at(key, Instant::now())
    }

    /// Same as [`admit`](Self::admit) with an explicit clock reading.
    pub fn admit_at(&self, key: &K, now: Instant) -> bool {
        let mut entry = self.windows.entry(key.clone()).or_default();
        let timestamps = entry.value_mut();
        purge(timestamps, now, self.window);

        if timestamps.len() >= self.max_requests {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    /// Drops identities whose windows hold no live requests.
    ///
    /// Returns the number of identities removed.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, timestamps| {
            purge(timestamps, now, self.window);
            !timestamps.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

impl<K> Default for RateLimiter<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new(RATE_LIMIT_REQUESTS, RATE_LIMIT_WINDOW)
    }
}

/// Trims the expired prefix. An entry exactly `window` old is expired.
fn purge(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = timestamps.front() {
        if now.saturating_duration_since(oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(60);

    fn limiter() -> RateLimiter<&'static str> {
        RateLimiter::new(10, WINDOW)
    }

    #[test]
    fn eleventh_request_in_window_is_rejected() {
        let rl = limiter();
        let start = Instant::now();
        for i in 0..10 {
            assert!(rl.admit_at(&"client", start + Duration::from_secs(i)));
        }
        assert!(!rl.admit_at(&"client", start + Duration::from_secs(30)));
    }

    #[test]
    fn rejected_requests_are_not_recorded() {
        let rl = RateLimiter::new(2, WINDOW);
        let start = Instant::now();
        assert!(rl.admit_at(&"c", start));
        assert!(rl.admit_at(&"c", start + Duration::from_secs(10)));
        for s in 11..59 {
            assert!(!rl.admit_at(&"c", start + Duration::from_secs(s)));
        }
        // Only the first admitted entry has aged out; rejections never took a slot.
        assert!(rl.admit_at(&"c", start + Duration::from_secs(60)));
        assert!(!rl.admit_at(&"c", start + Duration::from_secs(61)));
    }

    #[test]
    fn entry_exactly_one_window_old_is_expired() {
        let rl = limiter();
        let start = Instant::now();
        for _ in 0..10 {
            assert!(rl.admit_at(&"client", start));
        }
        assert!(!rl.admit_at(&"client", start + WINDOW - Duration::from_millis(1)));
        assert!(rl.admit_at(&"client", start + WINDOW));
    }

    #[test]
    fn admission_resumes_one_slot_at_a_time() {
        let rl = limiter();
        let start = Instant::now();
        for i in 0..10 {
            assert!(rl.admit_at(&"client", start + Duration::from_secs(i)));
        }
        // At t=60 only the entry from t=0 has expired.
        assert!(rl.admit_at(&"client", start + Duration::from_secs(60)));
        assert!(!rl.admit_at(&"client", start + Duration::from_millis(60_500)));
        assert!(rl.admit_at(&"client", start + Duration::from_secs(61)));
    }

    #[test]
    fn identities_are_independent() {
        let rl = RateLimiter::new(1, WINDOW);
        let now = Instant::now();
        assert!(rl.admit_at(&"a", now));
        assert!(!rl.admit_at(&"a", now));
        assert!(rl.admit_at(&"b", now));
    }

    #[test]
    fn eviction_drops_only_empty_windows() {
        let rl = limiter();
        let start = Instant::now();
        assert!(rl.admit_at(&"idle", start));
        assert!(rl.admit_at(&"active", start + Duration::from_secs(30)));
        assert_eq!(rl.tracked(), 2);

        assert_eq!(rl.evict_idle_at(start + Duration::from_secs(45)), 0);
        assert_eq!(rl.evict_idle_at(start + WINDOW), 1);
        assert_eq!(rl.tracked(), 1);

        // The surviving identity still counts its live request.
        let rl_one = RateLimiter::new(1, WINDOW);
        assert!(rl_one.admit_at(&"x", start));
        assert_eq!(rl_one.evict_idle_at(start + Duration::from_secs(1)), 0);
        assert!(!rl_one.admit_at(&"x", start + Duration::from_secs(2)));
    }

    #[test]
    fn concurrent_admits_never_exceed_quota() {
        let rl = Arc::new(RateLimiter::<IpAddr>::new(10, WINDOW));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let rl = rl.clone();
                std::thread::spawn(move || rl.admit(&ip))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 10);
    }
}
