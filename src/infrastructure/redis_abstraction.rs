use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client as NativeRedisClient, RedisError, Script, Value as RedisValue};
use std::sync::Arc;
use std::time::Duration;

/// Deletes KEYS[1] only while it still holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Resets the TTL of KEYS[1] to ARGV[2] ms only while it still holds ARGV[1].
const COMPARE_AND_PEXPIRE: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// The coordination-store commands the lock manager depends on.
///
/// Every compare-and-act operation must be atomic on the server side; the
/// real client runs them as Lua scripts.
#[async_trait]
pub trait RedisLockCommands: Send + Sync {
    /// `SET key value NX PX ttl`. Returns true if the key was set.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, RedisError>;

    /// Deletes `key` only if its value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, RedisError>;

    /// Resets the TTL of `key` only if its value equals `expected`.
    async fn compare_and_pexpire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, RedisError>;

    async fn get(&self, key: &str) -> Result<Option<String>, RedisError>;
}

/// `RedisLockCommands` over a multiplexed, auto-reconnecting connection.
#[derive(Clone)]
pub struct RealRedisClient {
    conn: ConnectionManager,
    compare_and_delete: Arc<Script>,
    compare_and_pexpire: Arc<Script>,
}

impl RealRedisClient {
    pub async fn connect(redis_url: &str) -> Result<Arc<dyn RedisLockCommands>, RedisError> {
        let client = NativeRedisClient::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Arc::new(Self {
            conn,
            compare_and_delete: Arc::new(Script::new(COMPARE_AND_DELETE)),
            compare_and_pexpire: Arc::new(Script::new(COMPARE_AND_PEXPIRE)),
        }))
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl RedisLockCommands for RealRedisClient {
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, RedisError> {
        let mut conn = self.conn.clone();
        let result: RedisValue = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(matches!(result, RedisValue::Okay))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, RedisError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn compare_and_pexpire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, RedisError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .compare_and_pexpire
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RedisError> {
        let mut conn = self.conn.clone();
        redis::AsyncCommands::get(&mut conn, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_never_rounds_to_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }

    #[tokio::test]
    #[ignore]
    async fn compare_and_delete_against_live_redis() {
        let client = RealRedisClient::connect("redis://localhost:6379")
            .await
            .unwrap();
        let key = format!("lock:test:{}", uuid::Uuid::new_v4());
        assert!(client.set_nx_px(&key, "a", Duration::from_secs(5)).await.unwrap());
        assert!(!client.set_nx_px(&key, "b", Duration::from_secs(5)).await.unwrap());
        assert!(!client.compare_and_delete(&key, "b").await.unwrap());
        assert!(client
            .compare_and_pexpire(&key, "a", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(client.compare_and_delete(&key, "a").await.unwrap());
        assert_eq!(client.get(&key).await.unwrap(), None);
    }
}
