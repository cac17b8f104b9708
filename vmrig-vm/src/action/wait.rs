//! Bounded polling
//!
//! Every wait has an attempt budget derived from its timeout and the poll
//! interval, and re-checks the interruption flag on every iteration. An
//! interrupted wait is not an error: the caller decides, and the pipeline
//! raises `Interrupted` at the next step boundary.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::trace;

use vmrig_core::error::VmrigResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    Interrupted,
    TimedOut,
}

impl<T> WaitOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready(_))
    }
}

/// Number of polls that fit in `timeout`, at least one
pub fn attempts(timeout: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 1;
    }
    let attempts = timeout.as_millis() / interval.as_millis().max(1);
    u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
}

/// Poll `probe` until it yields a value, the budget runs out, or the run is
/// interrupted. Probe errors end the wait immediately.
pub async fn poll_until<T, F, Fut>(
    interrupted: &AtomicBool,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> VmrigResult<WaitOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = VmrigResult<Option<T>>>,
{
    let budget = attempts(timeout, interval);
    for attempt in 1..=budget {
        if interrupted.load(Ordering::SeqCst) {
            return Ok(WaitOutcome::Interrupted);
        }
        if let Some(value) = probe().await? {
            return Ok(WaitOutcome::Ready(value));
        }
        trace!("Poll {}/{} not ready", attempt, budget);
        if attempt < budget {
            tokio::time::sleep(interval).await;
        }
    }
    if interrupted.load(Ordering::SeqCst) {
        return Ok(WaitOutcome::Interrupted);
    }
    Ok(WaitOutcome::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    const TICK: Duration = Duration::from_millis(1);

    #[test]
    fn test_attempts() {
        assert_eq!(attempts(Duration::from_secs(300), Duration::from_secs(2)), 150);
        assert_eq!(attempts(Duration::from_secs(1), Duration::from_secs(2)), 1);
        assert_eq!(attempts(Duration::from_secs(1), Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn test_ready_after_some_polls() {
        let calls = AtomicU32::new(0);
        let outcome = poll_until(&AtomicBool::new(false), TICK * 10, TICK, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok((n == 3).then_some(n)) }
        })
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Ready(3));
    }

    #[tokio::test]
    async fn test_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let outcome: WaitOutcome<()> = poll_until(&AtomicBool::new(false), TICK * 5, TICK, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_interruption_ends_wait_without_error() {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();
        let outcome: WaitOutcome<()> = poll_until(&interrupted, TICK * 1000, TICK, || {
            flag.store(true, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Interrupted);
    }
}
