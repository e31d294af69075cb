//! Exponential backoff for retrying connects.

use log::debug;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound of a single delay, jitter excluded.
    pub max: Duration,
    /// Give up once this much time passed since the first attempt.
    pub max_elapsed: Duration,
    /// Random extra delay of up to this percentage of the delay.
    pub jitter_percent: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60),
            jitter_percent: 10,
        }
    }
}

impl ExponentialBackoff {
    pub const fn new(initial: Duration, max: Duration, max_elapsed: Duration) -> Self {
        ExponentialBackoff {
            initial,
            max,
            max_elapsed,
            jitter_percent: 10,
        }
    }

    pub fn with_jitter(mut self, jitter_percent: u32) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    /// Returns the delay before retry number `attempt`, counting from zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .initial
            .saturating_mul(2u32.saturating_pow(attempt.min(20)));
        let capped = exponential.min(self.max);

        if self.jitter_percent == 0 {
            return capped;
        }
        let spread = capped.as_millis() as u64 * u64::from(self.jitter_percent) / 100;
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// Runs `op` until it succeeds, the error is permanent or time runs out.
///
/// # Arguments
///
/// * `backoff` - Delays between attempts and the default time budget.
/// * `cancel` - Stops retrying, the last error is returned.
/// * `op` - The operation, called once per attempt.
/// * `policy` - Decides if an error is worth another attempt. Returns the
///   time budget for retrying it, or `None` for permanent errors.
///
/// # Returns
///
/// The first success or the last error.
pub async fn retry<T, E, Op, Fut, P>(
    backoff: &ExponentialBackoff,
    cancel: &CancellationToken,
    mut op: Op,
    mut policy: P,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> Option<Duration>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let Some(budget) = policy(&err) else {
            return Err(err);
        };

        let delay = backoff.delay(attempt);
        if started.elapsed() + delay > budget {
            return Err(err);
        }

        debug!("Attempt {} failed, retrying in {delay:?}: {err}", attempt + 1);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(err),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
