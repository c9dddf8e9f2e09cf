//! Redis-backed `PeerChannel`, wired in when `REDIS_URL` is configured.
//! Compiled only with the `peer-fanout` feature so the core can be built
//! (and tested) with no Redis dependency at all.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;

use crate::log_hub::PeerChannel;

pub struct RedisPeerChannel {
    manager: ConnectionManager,
    client: redis::Client,
}

impl RedisPeerChannel {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager, client })
    }
}

#[async_trait]
impl PeerChannel for RedisPeerChannel {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<BoxStream<'static, Vec<u8>>> {
        let pubsub_conn = self.client.get_async_pubsub().await?;
        let mut pubsub_conn = pubsub_conn;
        pubsub_conn.subscribe(channel).await?;

        let stream = pubsub_conn
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(Box::pin(stream))
    }
}
