//! Randomized delays for polling and reconnects.
use std::{future::Future, time::Duration};

use rand::{thread_rng, Rng};

use crate::Result;

/// Apply randomized `jitter` to `interval`.
pub(crate) fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

/// Delay before reconnect attempt `attempt` (starting at 1): exponential growth from `base`,
/// capped at `max`, with up to half of the delay randomized away.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1 << exponent).min(max);
    jitter(delay, delay / 2)
}

/// Run `operation` until it succeeds, it fails with a non-retriable error, or `max_retries`
/// retries are exhausted. Returns the last error.
pub(crate) async fn with_retries<T, F, Fut>(
    max_retries: u32,
    base_delay: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retriable() || attempt >= max_retries => return Err(err),
            Err(err) => {
                attempt += 1;
                let delay = backoff_delay(attempt, base_delay, base_delay.saturating_mul(8));
                log::debug!(target: "ff", attempt, delay_ms = delay.as_millis() as u64; "retrying after error: {err}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
