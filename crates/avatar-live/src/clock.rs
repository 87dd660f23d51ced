//! Cancellable waits shared by every engine.
//!
//! All suspension points (transition steps, crossfade steps, interruption
//! timers) go through [`sleep_or_cancel`] so `reset()`/`stop()` interrupt
//! them promptly. Uses `tokio::time`, so tests can drive the virtual clock
//! with `#[tokio::test(start_paused = true)]`.

use crate::error::{LiveError, LiveResult};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless `cancel` fires first.
///
/// Returns `Err(LiveError::Cancelled)` when cancelled; `what` names the
/// interrupted wait in the error.
pub async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
    what: &str,
) -> LiveResult<()> {
    if cancel.is_cancelled() {
        return Err(LiveError::Cancelled(what.to_string()));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LiveError::Cancelled(what.to_string())),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_on_virtual_clock() {
        let token = CancellationToken::new();
        let start = tokio::time::Instant::now();
        sleep_or_cancel(millis(250), &token, "test").await.unwrap();
        assert!(start.elapsed() >= millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let err = sleep_or_cancel(millis(1000), &token, "step").await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_wait() {
        let token = CancellationToken::new();
        let child = token.clone();
        let waiter = tokio::spawn(async move { sleep_or_cancel(millis(10_000), &child, "wait").await });
        tokio::time::sleep(millis(10)).await;
        token.cancel();
        let result = waiter.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }
}
