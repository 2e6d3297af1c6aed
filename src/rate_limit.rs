use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::AppError;

/// Fixed-window admission control keyed by (scope, client address). Bounds
/// concurrency pressure on the core; not a fairness mechanism.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_seconds),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, scope: &str, client: &str) -> Result<(), AppError> {
        let key = format!("{scope}:{client}");
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let entry = windows.entry(key).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.max_requests {
            return Err(AppError::RateLimited);
        }
        entry.1 += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_within_budget_pass() {
        let limiter = RateLimiter::new(3, 60);
        for _ in 0..3 {
            assert!(limiter.check("chat", "1.2.3.4").is_ok());
        }
        assert!(matches!(limiter.check("chat", "1.2.3.4"), Err(AppError::RateLimited)));
    }

    #[test]
    fn scopes_and_clients_are_independent() {
        let limiter = RateLimiter::new(1, 60);
        assert!(limiter.check("chat", "1.2.3.4").is_ok());
        assert!(limiter.check("image-generate", "1.2.3.4").is_ok());
        assert!(limiter.check("chat", "5.6.7.8").is_ok());
        assert!(limiter.check("chat", "1.2.3.4").is_err());
    }
}
