use std::sync::Arc;

use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use anyhow::Result;

use crate::config::Config;
use crate::control::PageControllerRegistry;
use crate::execution::{ExecutionRecordSink, NoopExecutionRecordSink};
use crate::log_hub::LogHub;
use crate::profile::ProfileManager;
use crate::routes;
use crate::run_events_hub::RunEventsHub;
use crate::streamer_manager::StreamerManager;
use crate::ws;

/// Everything a request handler needs, shared behind `web::Data` the way the
/// teacher's `A2AServer` shares its executor and config.
pub struct AppState {
    pub streamer_manager: Arc<StreamerManager>,
    pub log_hub: Arc<LogHub>,
    pub run_hub: Arc<RunEventsHub>,
    pub profile_manager: Arc<ProfileManager>,
    pub page_controllers: Arc<PageControllerRegistry>,
    pub execution_sink: Arc<dyn ExecutionRecordSink>,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config, log_hub: Arc<LogHub>) -> Arc<Self> {
        let profile_manager = Arc::new(ProfileManager::new(config.profile_base_dir.clone()));
        profile_manager.clone().spawn_sweeper(None);
        Arc::new(Self {
            streamer_manager: StreamerManager::new(),
            log_hub,
            run_hub: RunEventsHub::new(),
            profile_manager,
            page_controllers: PageControllerRegistry::new(),
            execution_sink: Arc::new(NoopExecutionRecordSink),
            config,
        })
    }
}

/// Binds and serves the HTTP/WebSocket surface described in spec §6.2.
pub struct VisualStreamServer {
    state: Arc<AppState>,
}

impl VisualStreamServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn start(&self, host: &str, port: u16) -> Result<()> {
        let state = self.state.clone();
        HttpServer::new(move || {
            App::new()
                .wrap(Logger::default())
                .wrap(Cors::permissive())
                .app_data(web::Data::new(state.clone()))
                .configure(routes::configure)
                .configure(ws::configure)
        })
        .bind((host, port))?
        .run()
        .await?;
        Ok(())
    }
}
