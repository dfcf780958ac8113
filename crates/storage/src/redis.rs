use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::instrument;

use sitekb_common::{KbError, Result};

fn map_redis_err(err: redis::RedisError) -> KbError {
    use redis::ErrorKind;
    match err.kind() {
        ErrorKind::IoError | ErrorKind::TryAgain | ErrorKind::BusyLoadingError => {
            KbError::Transient(err.to_string())
        }
        _ => KbError::Backend(err.to_string()),
    }
}

/// Shared distributed cache client. The connection manager multiplexes and
/// reconnects on its own, so the handle is cheap to clone.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(map_redis_err)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(map_redis_err)?;
        Ok(Self { manager })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(map_redis_err)
    }

    #[instrument(skip(self, value), fields(key, ttl_secs))]
    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(map_redis_err)
    }

    pub async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(keys).await.map_err(map_redis_err)
    }

    /// Register `member` under a tag set so the whole scope can be
    /// invalidated later. The set outlives its members slightly (ttl + slack)
    /// so invalidation always sees every live key.
    pub async fn tag_member(&self, tag: &str, member: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.sadd::<_, _, ()>(tag, member)
            .await
            .map_err(map_redis_err)?;
        conn.expire::<_, ()>(tag, (ttl_secs + 60) as i64)
            .await
            .map_err(map_redis_err)
    }

    pub async fn tag_members(&self, tag: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        conn.smembers(tag).await.map_err(map_redis_err)
    }

    pub async fn drop_tag(&self, tag: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(tag).await.map_err(map_redis_err)
    }
}
