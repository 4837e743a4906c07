//! Idle-timeout policy.
//!
//! The last-activity instant is stored as nanoseconds since the policy was
//! created and only ever moves forward (`fetch_max`), so concurrent reports
//! from several command threads can never regress it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Idle timeout used when none is configured (3 hours).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);

#[derive(Debug)]
pub struct IdleTimeout {
    timeout: Option<Duration>,
    origin: Instant,
    last_activity: AtomicU64,
}

impl IdleTimeout {
    /// `None` or a zero duration disables idle shutdown.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self::starting_at(timeout, Instant::now())
    }

    pub fn starting_at(timeout: Option<Duration>, origin: Instant) -> Self {
        Self {
            timeout: timeout.filter(|t| !t.is_zero()),
            origin,
            last_activity: AtomicU64::new(0),
        }
    }

    /// Interpret a millisecond setting: unset → default, zero or negative →
    /// disabled.
    pub fn from_millis_setting(setting: Option<i64>) -> Self {
        Self::new(duration_from_setting(setting))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_enabled(&self) -> bool {
        self.timeout.is_some()
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    /// Record activity at `at`. Instants older than the current value are
    /// ignored.
    pub fn touch_at(&self, at: Instant) {
        let offset = self.offset_of(at);
        self.last_activity.fetch_max(offset, Ordering::SeqCst);
    }

    pub fn last_activity(&self) -> Instant {
        self.origin + Duration::from_nanos(self.last_activity.load(Ordering::SeqCst))
    }

    /// Time since the last activity, as seen at `now`.
    pub fn idle_for_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        match self.timeout {
            Some(timeout) => self.idle_for_at(now) >= timeout,
            None => false,
        }
    }

    /// Time left before expiry, `None` when disabled.
    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        self.timeout
            .map(|timeout| timeout.saturating_sub(self.idle_for_at(now)))
    }

    fn offset_of(&self, at: Instant) -> u64 {
        let nanos = at.saturating_duration_since(self.origin).as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}

/// Map a raw millisecond setting onto an optional timeout.
pub fn duration_from_setting(setting: Option<i64>) -> Option<Duration> {
    match setting {
        None => Some(DEFAULT_IDLE_TIMEOUT),
        Some(ms) if ms <= 0 => None,
        Some(ms) => Some(Duration::from_millis(ms.unsigned_abs())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const D: Duration = Duration::from_millis(500);

    #[test]
    fn not_expired_before_duration() {
        let start = Instant::now();
        let idle = IdleTimeout::starting_at(Some(D), start);
        assert!(!idle.is_expired_at(start));
        assert!(!idle.is_expired_at(start + D - Duration::from_millis(1)));
        assert!(idle.is_expired_at(start + D));
    }

    #[test]
    fn activity_resets_measurement() {
        let start = Instant::now();
        let idle = IdleTimeout::starting_at(Some(D), start);
        idle.touch_at(start + Duration::from_millis(400));
        assert!(!idle.is_expired_at(start + D));
        assert!(!idle.is_expired_at(start + Duration::from_millis(899)));
        assert!(idle.is_expired_at(start + Duration::from_millis(900)));
    }

    #[test]
    fn last_activity_never_moves_backwards() {
        let start = Instant::now();
        let idle = IdleTimeout::starting_at(Some(D), start);
        idle.touch_at(start + Duration::from_millis(300));
        idle.touch_at(start + Duration::from_millis(100));
        assert_eq!(idle.last_activity(), start + Duration::from_millis(300));
    }

    #[test]
    fn concurrent_touches_keep_the_latest() {
        let start = Instant::now();
        let idle = std::sync::Arc::new(IdleTimeout::starting_at(Some(D), start));
        let handles: Vec<_> = (1..=8u64)
            .map(|i| {
                let idle = idle.clone();
                std::thread::spawn(move || idle.touch_at(start + Duration::from_millis(i * 10)))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(idle.last_activity(), start + Duration::from_millis(80));
    }

    #[test]
    fn disabled_never_expires() {
        let start = Instant::now();
        let idle = IdleTimeout::starting_at(Some(Duration::ZERO), start);
        assert!(!idle.is_enabled());
        assert!(!idle.is_expired_at(start + Duration::from_secs(365 * 24 * 3600)));
        assert_eq!(idle.remaining_at(start), None);
    }

    #[rstest]
    #[case(None, Some(DEFAULT_IDLE_TIMEOUT))]
    #[case(Some(0), None)]
    #[case(Some(-5), None)]
    #[case(Some(1500), Some(Duration::from_millis(1500)))]
    fn millisecond_settings(#[case] setting: Option<i64>, #[case] expected: Option<Duration>) {
        assert_eq!(duration_from_setting(setting), expected);
        assert_eq!(IdleTimeout::from_millis_setting(setting).timeout(), expected);
    }
}
