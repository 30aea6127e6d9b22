//! Polling with exponential backoff until a probe reports ready.

use std::{future::Future, time::Duration};

use rand::random;

/// Upper bound for a single wait, however many attempts have gone by.
const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay after the first failed probe; doubled after every further one.
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Delay to wait after `attempt` (1-based) failed, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .interval
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(MAX_DELAY);
        exp + rand_jitter(self.interval)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError<E> {
    #[error("not ready after {attempts} attempts")]
    NotReady { attempts: u32 },

    #[error("not ready after {attempts} attempts, last error: {last}")]
    Failed { attempts: u32, last: E },
}

/// Call `probe` until `ready` accepts its output, sleeping with backoff in
/// between. Probe errors count as not ready. Gives up after
/// `backoff.max_attempts` probes and reports the last error if there was one.
pub async fn wait_until<T, E, F, Fut, P>(
    backoff: Backoff,
    mut probe: F,
    ready: P,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
    E: std::fmt::Display,
{
    let mut last_error = None;
    let attempts = backoff.max_attempts.max(1);

    for attempt in 1..=attempts {
        match probe().await {
            Ok(value) if ready(&value) => {
                log::debug!("ready after {attempt} attempt(s)");
                return Ok(value);
            }
            Ok(_) => {
                log::info!("not ready yet (attempt {attempt}/{attempts})");
                last_error = None;
            }
            Err(err) => {
                log::info!("probe failed (attempt {attempt}/{attempts}): {err}");
                last_error = Some(err);
            }
        }

        if attempt < attempts {
            tokio::time::sleep(backoff.delay(attempt)).await;
        }
    }

    Err(match last_error {
        Some(last) => WaitError::Failed { attempts, last },
        None => WaitError::NotReady { attempts },
    })
}

fn rand_jitter(interval: Duration) -> Duration {
    let max = (interval.as_millis() as u64 / 2).max(1);
    Duration::from_millis(random::<u64>() % max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> Backoff {
        Backoff::new(Duration::from_millis(1), 5)
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), 10);
        assert!(backoff.delay(1) >= Duration::from_millis(100));
        assert!(backoff.delay(1) < Duration::from_millis(150));
        assert!(backoff.delay(3) >= Duration::from_millis(400));
        assert!(backoff.delay(40) <= MAX_DELAY + Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_stops_at_first_ready_probe() {
        let calls = Cell::new(0);
        let result: Result<u32, WaitError<String>> = wait_until(
            fast(),
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { Ok(n) }
            },
            |n| *n == 3,
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_with_last_error() {
        let calls = Cell::new(0);
        let result: Result<(), WaitError<String>> = wait_until(
            fast(),
            || {
                calls.set(calls.get() + 1);
                async { Err("connection refused".to_string()) }
            },
            |_| true,
        )
        .await;

        assert_eq!(calls.get(), 5);
        match result {
            Err(WaitError::Failed { attempts, last }) => {
                assert_eq!(attempts, 5);
                assert_eq!(last, "connection refused");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_not_ready_without_errors() {
        let result: Result<bool, WaitError<String>> =
            wait_until(Backoff::new(Duration::from_millis(1), 2), || async { Ok(false) }, |ok| *ok)
                .await;

        assert!(matches!(result, Err(WaitError::NotReady { attempts: 2 })));
    }
}
