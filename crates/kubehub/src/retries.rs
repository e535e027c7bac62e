//! Retries of transient API failures with exponential backoff and equal jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::{ClientError, ClientResult};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self { attempts: 1, ..Self::default() }
    }

    /// Delay before retry number `attempt` (0-based): `first × factor^attempt`,
    /// capped at `max`, then half of it randomized.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        if !self.jitter || base.is_zero() {
            return base;
        }
        let half = base / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=half)
    }
}

pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, what: &str, mut call: F) -> ClientResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < policy.attempts => {
                let delay = policy.delay(attempt);
                warn!(error = %e, attempt, delay_ms = %delay.as_millis(), call = what, "transient api failure; retrying");
                metrics::counter!("kubehub_retries_total", 1u64);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Shorthand for errors raised outside of kube-rs (e.g. malformed bookmarks).
pub(crate) fn transport(msg: impl std::fmt::Display) -> ClientError {
    ClientError::Transport(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_and_cap_without_jitter() {
        let p = RetryPolicy { attempts: 10, first: Duration::from_millis(100), max: Duration::from_secs(1), factor: 2.0, jitter: false };
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(400));
        assert_eq!(p.delay(10), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let p = RetryPolicy { jitter: true, ..RetryPolicy::default() };
        for attempt in 0..5 {
            let d = p.delay(attempt);
            let base = RetryPolicy { jitter: false, ..p }.delay(attempt);
            assert!(d >= base / 2 && d <= base, "attempt {attempt}: {d:?} vs {base:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_then_given_up() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy { attempts: 3, jitter: false, ..RetryPolicy::default() };
        let res: ClientResult<()> = with_retries(&p, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::Api { code: 503, message: "busy".into() }) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_propagate_immediately() {
        let calls = AtomicU32::new(0);
        let res: ClientResult<()> = with_retries(&RetryPolicy::default(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::Api { code: 403, message: "forbidden".into() }) }
        })
        .await;
        assert!(matches!(res, Err(ClientError::Api { code: 403, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
