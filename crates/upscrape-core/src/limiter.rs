use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::Duration;

use rand::Rng;
use tokio::time::{self, Instant};

use crate::config::RateLimit;
use crate::error::{Error, Result};

/// Sliding window limiter: at most `max_requests` admissions within any
/// trailing `window`.
///
/// Unlike a token bucket there is no burst credit, a slot only frees up once
/// the admission that took it leaves the window. State is per instance and
/// not shared between tasks.
///
/// An optional jitter adds a random pause to every admission, spreading the
/// requests of a window out instead of sending them back to back.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: NonZeroUsize,
    window: Duration,
    jitter: Option<(Duration, Duration)>,
    admitted: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: NonZeroUsize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            jitter: None,
            admitted: VecDeque::with_capacity(max_requests.get()),
        }
    }

    /// Pauses each admission for a random duration within `min..=max`
    pub fn with_jitter(mut self, min: Duration, max: Duration) -> Self {
        self.jitter = Some((min, max.max(min)));
        self
    }

    pub fn from_config(conf: &RateLimit) -> Result<Self> {
        conf.validate()?;
        let max_requests = conf
            .max_requests()
            .ok_or_else(|| Error::Config("rateLimit.maxRequests must be at least 1".into()))?;
        let limiter = Self::new(max_requests, conf.window());
        Ok(match conf.jitter() {
            Some((min, max)) => limiter.with_jitter(min, max),
            None => limiter,
        })
    }

    /// Waits until a slot is available in the window then takes it
    pub async fn admit(&mut self) {
        self.evict(Instant::now());

        if self.admitted.len() >= self.max_requests.get() {
            if let Some(&oldest) = self.admitted.front() {
                let until = oldest + self.window;
                log::debug!(
                    "Rate limit reached ({} in {:?}), waiting {:?}",
                    self.admitted.len(),
                    self.window,
                    until.saturating_duration_since(Instant::now())
                );
                time::sleep_until(until).await;
            }
            self.evict(Instant::now());
        }

        // slept before recording, a dropped call takes no slot
        if let Some(delay) = self.jitter_delay() {
            log::debug!("Pausing {delay:?} before admission");
            time::sleep(delay).await;
        }

        self.admitted.push_back(Instant::now());
    }

    fn jitter_delay(&self) -> Option<Duration> {
        let (min, max) = self.jitter?;
        if max.is_zero() {
            return None;
        }
        let secs = rand::rng().random_range(min.as_secs_f64()..=max.as_secs_f64());
        Some(Duration::from_secs_f64(secs))
    }

    /// Number of admissions still inside the window
    pub fn in_window(&mut self) -> usize {
        self.evict(Instant::now());
        self.admitted.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(n: usize, secs: u64) -> RateLimiter {
        RateLimiter::new(NonZeroUsize::new(n).unwrap(), Duration::from_secs(secs))
    }

    #[tokio::test(start_paused = true)]
    async fn first_admissions_do_not_wait() {
        let mut limiter = limiter(10, 60);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.admit().await;
        }
        assert_eq!(Duration::ZERO, start.elapsed());
        assert_eq!(10, limiter.in_window());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_admissions_free_their_slot() {
        let mut limiter = limiter(2, 10);
        limiter.admit().await;
        time::advance(Duration::from_secs(6)).await;
        limiter.admit().await;
        time::advance(Duration::from_secs(5)).await;

        let before = Instant::now();
        limiter.admit().await;
        assert_eq!(Duration::ZERO, before.elapsed());
        assert_eq!(2, limiter.in_window());
    }

    #[test]
    fn zero_requests_rejected() {
        let conf = RateLimit {
            max_requests: 0,
            ..Default::default()
        };
        assert!(RateLimiter::from_config(&conf).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_pauses_each_admission() {
        let mut limiter =
            limiter(10, 60).with_jitter(Duration::from_millis(500), Duration::from_millis(1500));

        let mut last = Instant::now();
        for _ in 0..5 {
            limiter.admit().await;
            let gap = last.elapsed();
            assert!(gap >= Duration::from_millis(500), "{gap:?}");
            assert!(gap <= Duration::from_millis(1510), "{gap:?}");
            last = Instant::now();
        }
        assert_eq!(5, limiter.in_window());
    }

    #[tokio::test(start_paused = true)]
    async fn config_jitter_applies() {
        let mut limiter = RateLimiter::from_config(&RateLimit::default()).unwrap();
        let start = Instant::now();
        limiter.admit().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() <= Duration::from_millis(1510));

        let disabled = RateLimit {
            jitter_min_secs: 0.0,
            jitter_max_secs: 0.0,
            ..Default::default()
        };
        let mut limiter = RateLimiter::from_config(&disabled).unwrap();
        let start = Instant::now();
        limiter.admit().await;
        assert_eq!(Duration::ZERO, start.elapsed());
    }
}
