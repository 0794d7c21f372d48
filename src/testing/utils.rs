use std::future::Future;
use std::time::{Duration, Instant};

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F>(condition: F, timeout: Duration, interval: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Run `action` until its output satisfies `predicate`, returning that output.
pub async fn wait_for_result<F, Fut, T, P>(mut action: F, predicate: P, timeout: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(20);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(interval).await;
    }
    None
}

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
#[cfg(test)]
pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_for_result_returns_first_match() {
        let calls = AtomicUsize::new(0);
        let found = wait_for_result(
            || async { calls.fetch_add(1, Ordering::SeqCst) + 1 },
            |n| *n >= 3,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(found, Some(3));
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        assert!(!wait_for(|| false, Duration::from_millis(50), Duration::from_millis(10)).await);
        assert!(wait_for(|| true, Duration::from_millis(50), Duration::from_millis(10)).await);
    }
}
