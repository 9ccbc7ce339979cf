//! Redis distributed locks for claim serialization.
//!
//! SET NX PX with a random token; release runs a compare-and-delete script
//! so an expired holder can never delete a successor's lock. Lock TTLs make
//! a crashed holder harmless.

use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use uuid::Uuid;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

pub struct RedisLock {
    conn: ConnectionManager,
    key: String,
    token: String,
}

impl RedisLock {
    /// Try to acquire `key` for `hold`, polling until `wait` runs out.
    /// Returns `None` when the lock stayed contended past the deadline.
    pub async fn acquire(
        conn: &ConnectionManager,
        key: &str,
        hold: Duration,
        wait: Duration,
    ) -> Result<Option<RedisLock>, redis::RedisError> {
        let mut conn = conn.clone();
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(hold.as_millis() as u64)
                .query_async(&mut conn)
                .await?;

            if acquired.is_some() {
                return Ok(Some(RedisLock {
                    conn,
                    key: key.to_string(),
                    token,
                }));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Release the lock if we still hold it. Best-effort: a failed release
    /// just leaves the key to its TTL.
    pub async fn release(mut self) {
        let script = redis::Script::new(RELEASE_SCRIPT);
        let result: Result<i64, _> = script
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut self.conn)
            .await;
        if let Err(e) = result {
            tracing::debug!(key = %self.key, "lock release failed, TTL will clean up: {e}");
        }
    }
}
