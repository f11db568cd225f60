use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;
use weave_core::lock::{Lease, LockKey, Locker};
use weave_core::{CoreError, CoreResult};

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

/// Advisory locks shared by every API instance.
///
/// A lease is a `SET NX PX` key holding a random token, so an expired holder
/// can never delete a lock that has since been taken by someone else.
#[derive(Clone)]
pub struct RedisLocker {
    client: redis::Client,
    wait: Duration,
    retry_interval: Duration,
}

impl RedisLocker {
    pub fn new(connection_string: &str, wait: Duration, retry_interval: Duration) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client, wait, retry_interval })
    }

    async fn try_set(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // SET NX: only the first caller gets the key
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }
}

#[async_trait]
impl Locker for RedisLocker {
    async fn acquire(&self, key: LockKey, ttl: Duration) -> CoreResult<Lease> {
        let rendered = key.to_string();
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.wait;

        loop {
            let acquired = self
                .try_set(&rendered, &token, ttl)
                .await
                .map_err(|e| CoreError::LockError(e.to_string()))?;
            if acquired {
                debug!("Lock acquired: {}", rendered);
                return Ok(Lease { key, token, ttl });
            }
            if Instant::now() + self.retry_interval > deadline {
                warn!("Gave up waiting for lock {}", rendered);
                return Err(CoreError::LockUnavailable(rendered));
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    async fn release(&self, lease: Lease) -> CoreResult<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CoreError::LockError(e.to_string()))?;
        let rendered = lease.key.to_string();

        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&rendered)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoreError::LockError(e.to_string()))?;

        if deleted == 0 {
            warn!("Lock {} expired before release", rendered);
        }
        Ok(())
    }
}
