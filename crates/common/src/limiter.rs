//! Accept limiter: token bucket over connection attempts plus a cap on
//! concurrently active sessions.
//!
//! The exporter consults this before handing an accepted socket to a
//! session. A refused socket is dropped immediately; the cheap refusal is
//! what keeps a connection flood from exhausting worker threads or device
//! handles.

use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Outcome of an admission check.
#[derive(Debug, PartialEq, Eq)]
pub enum AcceptDecision {
    /// Session admitted; drop the [`SessionPermit`] when the session ends.
    Admitted(SessionPermit),
    /// Accept rate exceeded; drop the socket.
    RateLimited,
    /// Active-session cap reached; drop the socket.
    TooManySessions,
}

/// Token bucket state. Refilled lazily on each admission check.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_second: f64, burst: f64) -> Self {
        Self {
            tokens: burst,
            max_tokens: burst,
            refill_rate: per_second,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + self.refill_rate * elapsed).min(self.max_tokens);
            self.last_refill = now;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct Shared {
    bucket: Mutex<TokenBucket>,
    active: Mutex<usize>,
    max_sessions: usize,
}

/// Admission control for the exporter's accept loop.
#[derive(Debug, Clone)]
pub struct AcceptLimiter {
    shared: Arc<Shared>,
}

impl AcceptLimiter {
    /// `accepts_per_second` bounds the steady accept rate (with an equal
    /// burst allowance); `max_sessions` bounds concurrently live sessions.
    pub fn new(accepts_per_second: u32, max_sessions: usize) -> Self {
        let rate = f64::from(accepts_per_second.max(1));
        Self {
            shared: Arc::new(Shared {
                bucket: Mutex::new(TokenBucket::new(rate, rate)),
                active: Mutex::new(0),
                max_sessions,
            }),
        }
    }

    /// Decide whether a freshly accepted socket may become a session.
    pub fn admit(&self) -> AcceptDecision {
        if !self.shared.bucket.lock().unwrap().try_consume() {
            return AcceptDecision::RateLimited;
        }

        let mut active = self.shared.active.lock().unwrap();
        if *active >= self.shared.max_sessions {
            return AcceptDecision::TooManySessions;
        }
        *active += 1;
        AcceptDecision::Admitted(SessionPermit {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Number of currently admitted sessions.
    pub fn active_sessions(&self) -> usize {
        *self.shared.active.lock().unwrap()
    }
}

/// RAII guard for one admitted session.
#[derive(Debug)]
pub struct SessionPermit {
    shared: Arc<Shared>,
}

impl PartialEq for SessionPermit {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for SessionPermit {}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        let mut active = self.shared.active.lock().unwrap();
        *active = active.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_within_limits() {
        let limiter = AcceptLimiter::new(100, 4);
        let permit = limiter.admit();
        assert!(matches!(permit, AcceptDecision::Admitted(_)));
        assert_eq!(limiter.active_sessions(), 1);

        drop(permit);
        assert_eq!(limiter.active_sessions(), 0);
    }

    #[test]
    fn test_session_cap() {
        let limiter = AcceptLimiter::new(1000, 2);
        let a = limiter.admit();
        let b = limiter.admit();
        assert!(matches!(a, AcceptDecision::Admitted(_)));
        assert!(matches!(b, AcceptDecision::Admitted(_)));

        assert_eq!(limiter.admit(), AcceptDecision::TooManySessions);

        drop(a);
        assert!(matches!(limiter.admit(), AcceptDecision::Admitted(_)));
        drop(b);
    }

    #[test]
    fn test_rate_limit_kicks_in() {
        // Burst of 2, negligible refill within the test's runtime.
        let limiter = AcceptLimiter::new(2, 100);
        let _a = limiter.admit();
        let _b = limiter.admit();
        assert_eq!(limiter.admit(), AcceptDecision::RateLimited);
    }

    #[test]
    fn test_permit_drop_is_idempotent_under_churn() {
        let limiter = AcceptLimiter::new(1000, 8);
        for _ in 0..20 {
            if let AcceptDecision::Admitted(permit) = limiter.admit() {
                drop(permit);
            }
        }
        assert_eq!(limiter.active_sessions(), 0);
    }
}
