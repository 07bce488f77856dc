//! Shared helpers for the integration suite.

use std::future::Future;
use std::time::{Duration, Instant};

/// Poll `check` until it returns true or `deadline` elapses.
pub async fn wait_until<F, Fut>(deadline: Duration, check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
