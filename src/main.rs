use std::sync::Arc;

use anyhow::Result;
use visual_stream_server::config::Config;
use visual_stream_server::log_hub::{LogHub, PeerChannel};
use visual_stream_server::logging;
use visual_stream_server::server::{AppState, VisualStreamServer};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = Config::from_env();

    let peer: Option<Arc<dyn PeerChannel>> = build_peer_channel(&config).await;
    let log_hub = LogHub::new(peer);
    logging::init_logging(log_hub.clone());

    tracing::info!(host = %config.host, port = config.port, "starting visual stream server");

    let state = AppState::new(config.clone(), log_hub);
    let server = VisualStreamServer::new(state);
    server.start(&config.host, config.port).await
}

#[cfg(feature = "peer-fanout")]
async fn build_peer_channel(config: &Config) -> Option<Arc<dyn PeerChannel>> {
    let redis_url = config.redis_url.as_ref()?;
    match visual_stream_server::peer_redis::RedisPeerChannel::connect(redis_url).await {
        Ok(channel) => Some(Arc::new(channel)),
        Err(err) => {
            tracing::warn!(error = %err, "failed to connect to peer channel; falling back to local-only log fan-out");
            None
        }
    }
}

#[cfg(not(feature = "peer-fanout"))]
async fn build_peer_channel(config: &Config) -> Option<Arc<dyn PeerChannel>> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL is set but the peer-fanout feature is not compiled in");
    }
    None
}
