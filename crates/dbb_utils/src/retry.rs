use std::{future::Future, time::Duration};

/// Runs `operation` until it succeeds or `max_attempts` attempts have failed, sleeping `delay`
/// between attempts. Errors `should_retry` rejects are returned immediately. The attempt number
/// passed to `operation` starts at 1.
pub async fn async_retry_n_if<O, R, E, F, P>(
    max_attempts: usize,
    delay: Duration,
    operation: O,
    should_retry: P,
) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
    O: Fn(usize) -> F,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_attempts || !should_retry(&e) {
                    return Err(e);
                }
                tracing::debug!(attempt, max_attempts, "retrying after failed attempt");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
