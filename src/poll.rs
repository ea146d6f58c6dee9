//! Bounded polling primitive
//!
//! Every wait in the engine (receipt confirmation, network-switch checks,
//! manual switch windows, retry backoff) is expressed as a [`PollPolicy`]
//! consumed by [`poll_until`], rather than an ad hoc sleep loop.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Delay between attempts
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Backoff {
    /// Delay after the given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let secs = initial.as_secs_f64() * multiplier.powi(attempt as i32);
                Duration::from_secs_f64(secs.min(max.as_secs_f64()))
            }
        }
    }
}

/// Attempt budget, backoff and overall deadline for a wait
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Overall deadline across all attempts
    pub timeout: Option<Duration>,
}

impl PollPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(interval),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Receipt wait: poll every 2s for at most 60s
    pub fn transaction_confirmation(timeout: Duration) -> Self {
        let interval = Duration::from_secs(2);
        let attempts = (timeout.as_millis() / interval.as_millis()).max(1) as u32 + 1;
        Self::fixed(attempts, interval).with_timeout(timeout)
    }
}

/// Why a poll gave up
#[derive(Debug, Error, PartialEq)]
pub enum PollError<E> {
    #[error("condition not met after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("condition not met within {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Failed(E),
}

/// Run `probe` until it yields `Some`, an error, or the policy runs out.
///
/// `probe` receives the 0-indexed attempt number. Errors from the probe end
/// the poll immediately; callers that want to tolerate transient probe errors
/// map them to `Ok(None)`.
pub async fn poll_until<T, E, F, Fut>(policy: &PollPolicy, mut probe: F) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let attempts = policy.max_attempts.max(1);

    let run = async {
        for attempt in 0..attempts {
            if let Some(value) = probe(attempt).await.map_err(PollError::Failed)? {
                return Ok(value);
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(policy.backoff.delay_for_attempt(attempt)).await;
            }
        }
        Err(PollError::Exhausted { attempts })
    };

    match policy.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(PollError::TimedOut(started.elapsed())),
        },
        None => run.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_secs(2),
            multiplier: 2.0,
            max: Duration::from_secs(60),
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(32));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(60));
    }

    #[test]
    fn test_transaction_confirmation_policy() {
        let policy = PollPolicy::transaction_confirmation(Duration::from_secs(60));
        assert_eq!(policy.max_attempts, 31);
        assert_eq!(policy.timeout, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_poll_until_returns_first_some() {
        let calls = AtomicU32::new(0);
        let policy = PollPolicy::fixed(5, Duration::from_millis(1));
        let result: Result<u32, PollError<()>> = poll_until(&policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(if attempt == 2 { Some(attempt) } else { None }) }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_exhausts() {
        let policy = PollPolicy::fixed(3, Duration::from_millis(1));
        let result: Result<(), PollError<()>> =
            poll_until(&policy, |_| async { Ok(None) }).await;
        assert_eq!(result, Err(PollError::Exhausted { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_poll_until_stops_on_error() {
        let policy = PollPolicy::fixed(10, Duration::from_millis(1));
        let result: Result<(), PollError<&str>> =
            poll_until(&policy, |_| async { Err("boom") }).await;
        assert_eq!(result, Err(PollError::Failed("boom")));
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let policy =
            PollPolicy::fixed(1_000, Duration::from_millis(20)).with_timeout(Duration::from_millis(50));
        let result: Result<(), PollError<()>> =
            poll_until(&policy, |_| async { Ok(None) }).await;
        assert!(matches!(result, Err(PollError::TimedOut(_))));
    }
}
