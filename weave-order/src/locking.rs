use std::future::Future;
use std::time::Duration;
use tracing::warn;
use weave_core::lock::{LockKey, Locker};

use crate::error::OrderResult;

/// Runs `f` while holding `key`. The lease is released whatever `f` returns.
pub(crate) async fn with_lock<T, F, Fut>(locker: &dyn Locker, key: LockKey, ttl: Duration, f: F) -> OrderResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = OrderResult<T>>,
{
    let lease = locker.acquire(key, ttl).await?;
    let result = f().await;
    if let Err(e) = locker.release(lease).await {
        warn!(lock = %key, "Failed to release lock: {}", e);
    }
    result
}
