pub mod config;
pub mod control;
pub mod error;
pub mod execution;
pub mod log_hub;
pub mod logging;
pub mod models;
#[cfg(feature = "peer-fanout")]
pub mod peer_redis;
pub mod profile;
pub mod queue;
pub mod recorder;
pub mod routes;
pub mod run_events_hub;
pub mod server;
pub mod session_streamer;
pub mod streamer_manager;
pub mod ws;
