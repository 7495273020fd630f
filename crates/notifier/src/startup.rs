//! Startup helpers for the worker binary.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Call `connect` until it succeeds, at most `attempts` times, sleeping `interval`
/// between tries. The last error is returned when every attempt fails.
pub async fn wait_for<T, E, F, Fut>(
    what: &str,
    attempts: u32,
    interval: Duration,
    mut connect: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match connect().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(what, attempt, "Dependency is available");
                }
                return Ok(value);
            }
            Err(e) if attempt >= attempts => {
                tracing::error!(what, attempts, error = %e, "Dependency still unavailable, giving up");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    what,
                    attempt,
                    attempts,
                    retry_in_ms = interval.as_millis() as u64,
                    error = %e,
                    "Dependency not ready yet"
                );
                attempt += 1;
                tokio::time::sleep(interval).await;
            }
        }
    }
}
