use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::store::{MessageStream, Store};

/// Redis-backed store. Commands go through a shared `ConnectionManager`;
/// every subscription opens its own dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, redis })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.redis.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(hash, field, value).await?;
        Ok(())
    }

    async fn hget(&self, hash: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.redis.clone();
        Ok(conn.hget(hash, field).await?)
    }

    async fn hexists(&self, hash: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        Ok(conn.hexists(hash, field).await?)
    }

    async fn hdel(&self, hash: &str, field: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.hdel::<_, _, ()>(hash, field).await?;
        Ok(())
    }

    async fn hgetall(&self, hash: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.redis.clone();
        Ok(conn.hgetall(hash).await?)
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn rpush(&self, list: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(list, value).await?;
        Ok(())
    }

    async fn ltrim(&self, list: &str, start: isize, stop: isize) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.ltrim::<_, ()>(list, start, stop).await?;
        Ok(())
    }

    async fn lrange(&self, list: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut conn = self.redis.clone();
        Ok(conn.lrange(list, start, stop).await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!(%channel, receivers, "published to redis channel");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some((channel, payload)),
                Err(err) => {
                    warn!(%channel, error = %err, "dropping undecodable pub/sub payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
