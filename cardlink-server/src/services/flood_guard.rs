//! Per-peer handshake-failure tracking.
//!
//! A peer IP that accumulates too many failed PSK handshakes inside the
//! observation window gets one `psk_mismatch_flood` warning and is then
//! refused before TLS for the ban duration. State is process-wide,
//! created at server start, and guarded by one mutex; the hot path is a
//! map lookup per accepted connection.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Decision for a freshly accepted TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Proceed to the TLS handshake.
    Allow,
    /// Refuse with RST before TLS.
    Reject,
}

#[derive(Debug, Default)]
struct PeerBucket {
    failures: VecDeque<Instant>,
    banned_until: Option<Instant>,
}

/// Tracks handshake failures per peer IP.
pub(crate) struct FloodGuard {
    buckets: Mutex<HashMap<IpAddr, PeerBucket>>,
    threshold: u32,
    window: Duration,
    ban: Duration,
}

impl FloodGuard {
    pub(crate) fn new(threshold: u32, window: Duration, ban: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            threshold,
            window,
            ban,
        }
    }

    /// Checks whether `peer` may start a handshake at `now`.
    pub(crate) fn admit(&self, peer: IpAddr, now: Instant) -> Admission {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(&peer) else {
            return Admission::Allow;
        };
        match bucket.banned_until {
            Some(until) if now < until => Admission::Reject,
            Some(_) => {
                // ban expired, the peer starts with a clean slate
                buckets.remove(&peer);
                Admission::Allow
            }
            None => Admission::Allow,
        }
    }

    /// Records a handshake failure for `peer`.
    ///
    /// Returns the failure count when the threshold is crossed, exactly
    /// once per flood; the caller emits the event.
    pub(crate) fn record_failure(&self, peer: IpAddr, now: Instant) -> Option<u32> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(peer).or_default();
        if bucket.banned_until.is_some() {
            return None;
        }
        bucket.failures.push_back(now);
        while let Some(first) = bucket.failures.front() {
            if now.duration_since(*first) > self.window {
                bucket.failures.pop_front();
            } else {
                break;
            }
        }
        let count = bucket.failures.len() as u32;
        if count >= self.threshold {
            bucket.banned_until = Some(now + self.ban);
            Some(count)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 7));

    fn guard() -> FloodGuard {
        FloodGuard::new(5, Duration::from_secs(60), Duration::from_secs(60))
    }

    #[test]
    fn five_failures_trigger_one_flood_and_a_ban() {
        let guard = guard();
        let t0 = Instant::now();
        for i in 0..4 {
            assert_eq!(guard.record_failure(PEER, t0 + Duration::from_secs(i)), None);
        }
        assert_eq!(
            guard.record_failure(PEER, t0 + Duration::from_secs(4)),
            Some(5)
        );
        // once banned nothing further is reported
        assert_eq!(
            guard.record_failure(PEER, t0 + Duration::from_secs(5)),
            None
        );
        assert_eq!(guard.admit(PEER, t0 + Duration::from_secs(10)), Admission::Reject);
    }

    #[test]
    fn ban_expires_and_resets_the_bucket() {
        let guard = guard();
        let t0 = Instant::now();
        for i in 0..5 {
            guard.record_failure(PEER, t0 + Duration::from_secs(i));
        }
        assert_eq!(guard.admit(PEER, t0 + Duration::from_secs(30)), Admission::Reject);
        let after_ban = t0 + Duration::from_secs(4 + 61);
        assert_eq!(guard.admit(PEER, after_ban), Admission::Allow);
        // slate is clean again
        assert_eq!(guard.record_failure(PEER, after_ban), None);
    }

    #[test]
    fn failures_outside_the_window_age_out() {
        let guard = guard();
        let t0 = Instant::now();
        for i in 0..4 {
            guard.record_failure(PEER, t0 + Duration::from_secs(i));
        }
        // 70s later the first four are stale; this is failure 1 of a new window
        assert_eq!(
            guard.record_failure(PEER, t0 + Duration::from_secs(70)),
            None
        );
        assert_eq!(guard.admit(PEER, t0 + Duration::from_secs(71)), Admission::Allow);
    }

    #[test]
    fn unrelated_peers_are_untouched() {
        let guard = guard();
        let other = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 8));
        let t0 = Instant::now();
        for i in 0..5 {
            guard.record_failure(PEER, t0 + Duration::from_secs(i));
        }
        assert_eq!(guard.admit(other, t0 + Duration::from_secs(6)), Admission::Allow);
    }
}
