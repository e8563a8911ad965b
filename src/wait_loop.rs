//! `WaitLoop` (C8): generic condition-wait with a timeout budget and a
//! bounded sleep slice, in both blocking and async flavors.

use std::time::Duration;

/// Deadlines are computed against a monotonic clock, never wall time.
pub struct WaitLoop;

impl WaitLoop {
    /// Poll `condition` until it returns `Some`, sleeping at most
    /// `sleep_cap` between attempts, until `timeout` elapses. Returns
    /// `None` on exhaustion. Async/cooperative variant.
    pub async fn wait_for<T>(
        timeout: Duration,
        sleep_cap: Duration,
        mut condition: impl FnMut() -> Option<T>,
    ) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(v) = condition() {
                return Some(v);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep((deadline - now).min(sleep_cap)).await;
        }
    }

    /// Poll `condition` forever, sleeping `sleep_cap` between attempts.
    /// Used by the dispatcher's `awaitStop`, which has no caller-supplied
    /// deadline (spec §4.8). Async/cooperative variant.
    pub async fn poll_until<T>(sleep_cap: Duration, mut condition: impl FnMut() -> Option<T>) -> T {
        loop {
            if let Some(v) = condition() {
                return v;
            }
            tokio::time::sleep(sleep_cap).await;
        }
    }

    /// Blocking counterpart of [`wait_for`](Self::wait_for), for the
    /// synchronous `waitFor`/`destroy` call paths.
    pub fn wait_for_blocking<T>(
        timeout: Duration,
        sleep_cap: Duration,
        mut condition: impl FnMut() -> Option<T>,
    ) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(v) = condition() {
                return Some(v);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep((deadline - now).min(sleep_cap));
        }
    }

    /// Blocking counterpart of [`poll_until`](Self::poll_until).
    pub fn poll_until_blocking<T>(sleep_cap: Duration, mut condition: impl FnMut() -> Option<T>) -> T {
        loop {
            if let Some(v) = condition() {
                return v;
            }
            std::thread::sleep(sleep_cap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn wait_for_blocking_returns_once_condition_is_met() {
        let counter = AtomicU32::new(0);
        let result = WaitLoop::wait_for_blocking(Duration::from_millis(200), Duration::from_millis(5), || {
            let v = counter.fetch_add(1, Ordering::SeqCst);
            if v >= 3 { Some(v) } else { None }
        });
        assert!(result.is_some());
    }

    #[test]
    fn wait_for_blocking_times_out() {
        let result: Option<()> =
            WaitLoop::wait_for_blocking(Duration::from_millis(20), Duration::from_millis(5), || None);
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn wait_for_async_returns_once_condition_is_met() {
        let counter = AtomicU32::new(0);
        let result = WaitLoop::wait_for(Duration::from_millis(200), Duration::from_millis(5), || {
            let v = counter.fetch_add(1, Ordering::SeqCst);
            if v >= 3 { Some(v) } else { None }
        })
        .await;
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn wait_for_async_times_out() {
        let result: Option<()> =
            WaitLoop::wait_for(Duration::from_millis(20), Duration::from_millis(5), || None).await;
        assert!(result.is_none());
    }
}
