//! Plain HTTP surface: status, the debug viewer page, session listing,
//! termination, and the ambient health probe.

use std::sync::Arc;

use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;

use crate::execution::{ExecutionStatus, ExecutionUpdate};
use crate::models::{normalize_session_id, TerminationMode, TerminationRequest, TerminationResponse};
use crate::server::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/workflows/visual/{session_id}/status").route(web::get().to(get_status)),
    )
    .service(
        web::resource("/workflows/visual/{session_id}/viewer").route(web::get().to(get_viewer)),
    )
    .service(
        web::resource("/workflows/visual/{session_id}/terminate")
            .route(web::post().to(terminate_session)),
    )
    .service(web::resource("/workflows/visual/sessions").route(web::get().to(list_sessions)))
    .service(web::resource("/health").route(web::get().to(health)));
}

#[derive(Serialize)]
struct StatusEnvelope {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<crate::session_streamer::StreamerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn get_status(state: web::Data<Arc<AppState>>, path: web::Path<String>) -> HttpResponse {
    let raw = path.into_inner();
    let Some(session_id) = normalize_session_id(&raw) else {
        return HttpResponse::BadRequest().json(StatusEnvelope {
            success: false,
            status: None,
            error: Some(format!("invalid session id: {raw}")),
        });
    };
    match state.streamer_manager.get_streamer(&session_id) {
        Some(streamer) => HttpResponse::Ok().json(StatusEnvelope {
            success: true,
            status: Some(streamer.status()),
            error: None,
        }),
        None => HttpResponse::Ok().json(StatusEnvelope {
            success: false,
            status: None,
            error: Some(format!("session not found: {session_id}")),
        }),
    }
}

async fn get_viewer(path: web::Path<String>) -> HttpResponse {
    let session_id = path.into_inner();
    let html = format!(
        "<!doctype html><html><head><title>visual stream</title></head><body>\
         <p>session {session_id}</p>\
         <script>const ws = new WebSocket((location.protocol === 'https:' ? 'wss://' : 'ws://') + location.host + '/workflows/visual/{session_id}/stream');\
         ws.onmessage = (e) => console.log(e.data);</script>\
         </body></html>"
    );
    HttpResponse::Ok().content_type("text/html; charset=utf-8").body(html)
}

async fn list_sessions(state: web::Data<Arc<AppState>>) -> HttpResponse {
    let sessions = state.streamer_manager.list_sessions();
    HttpResponse::Ok().json(json!({
        "success": true,
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

async fn terminate_session(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    body: web::Json<TerminationRequest>,
) -> HttpResponse {
    let raw = path.into_inner();
    let Some(session_id) = normalize_session_id(&raw) else {
        return HttpResponse::BadRequest().json(json!({
            "success": false,
            "error": format!("invalid session id: {raw}"),
        }));
    };
    let Some(streamer) = state.streamer_manager.get_streamer(&session_id) else {
        return HttpResponse::Ok().json(json!({
            "success": false,
            "error": format!("session not found: {session_id}"),
        }));
    };

    streamer.transition_to_cleanup();
    match body.mode {
        TerminationMode::StopThenKill => {
            let timeout = std::time::Duration::from_millis(body.timeout_ms);
            let _ = tokio::time::timeout(timeout, streamer.graceful_shutdown()).await;
        }
        TerminationMode::Kill => {
            // Immediate: no terminal control frame, no grace period.
            streamer.stop_streaming();
        }
    }
    streamer.final_cleanup();

    let _ = state
        .execution_sink
        .record_update(ExecutionUpdate {
            execution_id: session_id.clone(),
            session_id: Some(session_id.clone()),
            status: ExecutionStatus::Cancelled,
            visual_events_captured: None,
            visual_stream_duration: None,
            error: None,
        })
        .await;

    state.streamer_manager.remove_streamer(&session_id).await;
    if let Err(err) = state.profile_manager.teardown(&session_id).await {
        tracing::warn!(session_id = %session_id, error = %err, "session directory cleanup failed");
    }
    state.page_controllers.unregister(&session_id);

    HttpResponse::Ok().json(TerminationResponse {
        success: true,
        session_id,
        mode: body.mode,
    })
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_hub::LogHub;

    fn test_state() -> web::Data<Arc<AppState>> {
        web::Data::new(AppState::new(crate::config::Config::default(), LogHub::new(None)))
    }

    #[actix_rt::test]
    async fn health_reports_ok() {
        let response = health().await;
        assert_eq!(response.status(), actix_web::http::StatusCode::OK);
    }

    #[actix_rt::test]
    async fn status_of_unknown_session_is_not_an_error_response() {
        let state = test_state();
        let path = web::Path::from("visual-00000000-0000-0000-0000-000000000099".to_string());
        let response = get_status(state, path).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::OK);
    }

    #[actix_rt::test]
    async fn status_rejects_malformed_session_id() {
        let state = test_state();
        let path = web::Path::from("not-a-uuid".to_string());
        let response = get_status(state, path).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }

    #[actix_rt::test]
    async fn list_sessions_starts_empty() {
        let state = test_state();
        let response = list_sessions(state).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::OK);
    }

    #[actix_rt::test]
    async fn terminate_unknown_session_reports_failure_without_erroring() {
        let state = test_state();
        let path = web::Path::from("visual-00000000-0000-0000-0000-000000000099".to_string());
        let body = web::Json(TerminationRequest {
            mode: TerminationMode::Kill,
            timeout_ms: 1_000,
        });
        let response = terminate_session(state, path, body).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::OK);
    }
}
