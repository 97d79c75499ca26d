//! Per-session paint rate limiting.
//!
//! A sliding window of size one: only the most recent accepted action
//! matters. This is deliberately not a token bucket — the domain rule is
//! "one paint per cooldown window", not sustained throughput shaping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    cooldown: Duration,
    last_accepted: HashMap<u64, Instant>,
}

impl RateLimiter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_accepted: HashMap::new(),
        }
    }

    /// Accepts iff the session has no prior record or at least a full
    /// cooldown has elapsed since its last accepted action. Acceptance
    /// records `now`; rejection returns the remaining wait and leaves the
    /// record untouched, so a burst of rejected attempts does not extend
    /// the window.
    pub fn try_accept(&mut self, session_id: u64, now: Instant) -> Result<(), Duration> {
        if let Some(&last) = self.last_accepted.get(&session_id) {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.cooldown {
                return Err(self.cooldown - elapsed);
            }
        }
        self.last_accepted.insert(session_id, now);
        Ok(())
    }

    /// Drops a session's record. Called on disconnect, and to undo an
    /// acceptance whose mutation was aborted before taking effect.
    pub fn forget(&mut self, session_id: u64) {
        self.last_accepted.remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Duration::from_millis(500))
    }

    #[test]
    fn test_first_attempt_accepted() {
        let mut limiter = limiter();
        assert_eq!(limiter.try_accept(1, Instant::now()), Ok(()));
    }

    #[test]
    fn test_attempt_within_window_rejected() {
        let mut limiter = limiter();
        let start = Instant::now();

        assert_eq!(limiter.try_accept(1, start), Ok(()));
        let remaining = limiter
            .try_accept(1, start + Duration::from_millis(100))
            .unwrap_err();
        assert_eq!(remaining, Duration::from_millis(400));
    }

    #[test]
    fn test_attempt_after_window_accepted() {
        let mut limiter = limiter();
        let start = Instant::now();

        assert_eq!(limiter.try_accept(1, start), Ok(()));
        assert!(limiter
            .try_accept(1, start + Duration::from_millis(100))
            .is_err());
        assert_eq!(
            limiter.try_accept(1, start + Duration::from_millis(600)),
            Ok(())
        );
    }

    #[test]
    fn test_exact_window_boundary_accepted() {
        let mut limiter = limiter();
        let start = Instant::now();

        assert_eq!(limiter.try_accept(1, start), Ok(()));
        assert_eq!(
            limiter.try_accept(1, start + Duration::from_millis(500)),
            Ok(())
        );
    }

    #[test]
    fn test_rejections_do_not_extend_window() {
        let mut limiter = limiter();
        let start = Instant::now();

        assert_eq!(limiter.try_accept(1, start), Ok(()));
        // Hammering during the window keeps the original deadline
        for ms in [50u64, 150, 250, 350, 450] {
            assert!(limiter
                .try_accept(1, start + Duration::from_millis(ms))
                .is_err());
        }
        assert_eq!(
            limiter.try_accept(1, start + Duration::from_millis(501)),
            Ok(())
        );
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut limiter = limiter();
        let start = Instant::now();

        assert_eq!(limiter.try_accept(1, start), Ok(()));
        assert_eq!(limiter.try_accept(2, start), Ok(()));
        assert!(limiter
            .try_accept(1, start + Duration::from_millis(10))
            .is_err());
        assert!(limiter
            .try_accept(2, start + Duration::from_millis(10))
            .is_err());
    }

    #[test]
    fn test_forget_resets_session() {
        let mut limiter = limiter();
        let start = Instant::now();

        assert_eq!(limiter.try_accept(1, start), Ok(()));
        limiter.forget(1);
        assert_eq!(
            limiter.try_accept(1, start + Duration::from_millis(1)),
            Ok(())
        );
    }
}
