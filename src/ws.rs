//! C6: the three (plus one) WebSocket endpoints, all sharing the same
//! structural pattern: accept, subscribe a local callback to a hub, run a
//! sender task draining a bounded outbound queue and a receiver task reading
//! client frames, and unsubscribe when either side terminates.

use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::{CloseCode, CloseReason, Message};
use chrono::Utc;
use futures_util::StreamExt;
use uuid::Uuid;

use crate::error::StreamError;
use crate::models::{
    normalize_session_id, ControlAck, ControlFrame, LogRecord, RunEvent, SessionClientFrame,
    SessionFrame,
};
use crate::queue::BoundedQueue;
use crate::run_events_hub::RunEventsHub;
use crate::server::AppState;
use crate::session_streamer::SessionStreamer;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/workflows/visual/{session_id}/stream").route(web::get().to(session_stream)),
    )
    .service(
        web::resource("/workflows/visual/{session_id}/control")
            .route(web::get().to(control_channel)),
    )
    .service(web::resource("/ws/logs/{execution_id}").route(web::get().to(logs_stream)))
    .service(web::resource("/runs/{run_id}/events").route(web::get().to(run_events_stream)));
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn encode<T: serde::Serialize>(value: &T) -> Arc<str> {
    Arc::from(serde_json::to_string(value).unwrap_or_default())
}

/// Drains `queue` and writes each message to the socket until the queue
/// closes or the socket errors out.
fn spawn_sender(
    mut session: actix_ws::Session,
    queue: Arc<BoundedQueue<Arc<str>>>,
) -> tokio::task::JoinHandle<()> {
    actix_web::rt::spawn(async move {
        while let Some(message) = queue.recv().await {
            if session.text(message.to_string()).await.is_err() {
                break;
            }
        }
    })
}

async fn close_with_code(session: actix_ws::Session, code: u16, description: &str) {
    let _ = session
        .close(Some(CloseReason {
            code: CloseCode::Other(code),
            description: Some(description.to_string()),
        }))
        .await;
}

// ---------------------------------------------------------------------
// Session stream: /workflows/visual/{session_id}/stream
// ---------------------------------------------------------------------

async fn session_stream(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> Result<HttpResponse, actix_web::Error> {
    let raw = path.into_inner();
    let Some(session_id) = normalize_session_id(&raw) else {
        let (response, session, _msg_stream) = actix_ws::handle(&req, body)?;
        actix_web::rt::spawn(close_with_code(session, 4400, "invalid session id"));
        return Ok(response);
    };

    let streamer = state.streamer_manager.get_or_create_streamer(&session_id);
    streamer.start_streaming();

    let (response, session, mut msg_stream) = actix_ws::handle(&req, body)?;
    let client_id = Uuid::new_v4();
    let queue = streamer.add_client(client_id);

    let established = SessionFrame::ConnectionEstablished {
        client_id: client_id.to_string(),
        session_id: session_id.clone(),
        timestamp: now_ms(),
    };
    queue.push(encode(&established));

    let sender_task = spawn_sender(session.clone(), queue.clone());
    let recv_streamer = streamer.clone();

    actix_web::rt::spawn(async move {
        while let Some(Ok(msg)) = msg_stream.next().await {
            match msg {
                Message::Text(text) => {
                    handle_session_client_frame(&recv_streamer, client_id, &text, &queue);
                }
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => break,
                _ => {}
            }
        }
        recv_streamer.remove_client(client_id);
        sender_task.abort();
    });

    Ok(response)
}

fn handle_session_client_frame(
    streamer: &Arc<SessionStreamer>,
    client_id: Uuid,
    text: &str,
    queue: &Arc<BoundedQueue<Arc<str>>>,
) {
    let frame: SessionClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::debug!(error = %err, "could not parse session client frame");
            return;
        }
    };
    match frame {
        SessionClientFrame::Ping => {
            queue.push(encode(&SessionFrame::Pong { timestamp: now_ms() }));
        }
        SessionClientFrame::ClientReady => {
            queue.push(encode(&SessionFrame::Status {
                session_id: streamer.session_id().to_string(),
                phase: streamer.phase(),
                streaming_active: streamer.streaming_active(),
            }));
        }
        SessionClientFrame::SequenceResetRequest {
            history_window_seconds,
        } => {
            let window = history_window_seconds.unwrap_or(3.0);
            streamer.mark_sequence_reset_for_client(client_id);
            queue.push(encode(&SessionFrame::SequenceResetAck {
                session_id: streamer.session_id().to_string(),
                history_window_seconds: window,
            }));
            streamer.send_last_fullsnapshot_to_client(client_id, window);
        }
        SessionClientFrame::Unknown => {
            tracing::debug!(session_id = streamer.session_id(), "unknown client frame type");
        }
    }
}

// ---------------------------------------------------------------------
// Control channel: /workflows/visual/{session_id}/control
// ---------------------------------------------------------------------

async fn control_channel(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> Result<HttpResponse, actix_web::Error> {
    let raw = path.into_inner();
    let Some(session_id) = normalize_session_id(&raw) else {
        let (response, session, _msg_stream) = actix_ws::handle(&req, body)?;
        actix_web::rt::spawn(close_with_code(session, 4400, "invalid session id"));
        return Ok(response);
    };
    if state.streamer_manager.get_streamer(&session_id).is_none() {
        let (response, session, _msg_stream) = actix_ws::handle(&req, body)?;
        actix_web::rt::spawn(close_with_code(session, 4404, "session not found"));
        return Ok(response);
    }

    let (response, mut session, mut msg_stream) = actix_ws::handle(&req, body)?;
    let page_controllers = state.page_controllers.clone();
    let control_debug = state.config.control_channel_debug;

    actix_web::rt::spawn(async move {
        while let Some(Ok(msg)) = msg_stream.next().await {
            match msg {
                Message::Text(text) => {
                    let ack = handle_control_frame(
                        &page_controllers,
                        &session_id,
                        &text,
                        control_debug,
                    )
                    .await;
                    if session.text(serde_json::to_string(&ack).unwrap_or_default())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    Ok(response)
}

async fn handle_control_frame(
    page_controllers: &Arc<crate::control::PageControllerRegistry>,
    session_id: &str,
    text: &str,
    control_debug: bool,
) -> ControlAck {
    let frame: ControlFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            return ControlAck::Error {
                error_type: "invalid_message",
                error: err.to_string(),
                timestamp: now_ms(),
            }
        }
    };
    if control_debug {
        tracing::debug!(session_id, message = ?frame.message, "control channel frame");
    } else {
        tracing::debug!(session_id, "control channel frame");
    }
    match page_controllers.dispatch(session_id, &frame.message).await {
        Ok(()) => ControlAck::Ack,
        Err(err) => ControlAck::Error {
            error_type: control_error_type(&err),
            error: err.to_string(),
            timestamp: now_ms(),
        },
    }
}

fn control_error_type(err: &StreamError) -> &'static str {
    match err {
        StreamError::BrowserNotReady(_) => "browser_not_ready",
        StreamError::SessionNotFound(_) => "session_not_found",
        StreamError::ExecutionFailed(_) => "execution_failed",
        _ => "invalid_message",
    }
}

// ---------------------------------------------------------------------
// Execution logs: /ws/logs/{execution_id}
// ---------------------------------------------------------------------

async fn logs_stream(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> Result<HttpResponse, actix_web::Error> {
    let execution_id = path.into_inner();
    let (response, session, mut msg_stream) = actix_ws::handle(&req, body)?;

    let queue = BoundedQueue::new(500);
    for mut record in state.log_hub.get_history(&execution_id) {
        record.replay = Some(true);
        queue.push(encode(&record));
    }

    let queue_for_sub = queue.clone();
    let subscriber_id = state.log_hub.subscribe(
        &execution_id,
        Arc::new(move |record: LogRecord| {
            queue_for_sub.push(encode(&record));
        }),
    );

    let sender_task = spawn_sender(session, queue.clone());
    let log_hub = state.log_hub.clone();
    let execution_id_for_recv = execution_id.clone();

    actix_web::rt::spawn(async move {
        while let Some(Ok(msg)) = msg_stream.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
        log_hub.unsubscribe(&execution_id_for_recv, subscriber_id);
        queue.close();
        sender_task.abort();
    });

    Ok(response)
}

// ---------------------------------------------------------------------
// Run events: /runs/{run_id}/events
// ---------------------------------------------------------------------

async fn run_events_stream(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> Result<HttpResponse, actix_web::Error> {
    let run_id = path.into_inner();
    let (response, session, mut msg_stream) = actix_ws::handle(&req, body)?;

    let queue = BoundedQueue::new(500);
    let snapshot = state.run_hub.build_snapshot(&run_id);
    let snapshot_seq = snapshot.seq;
    queue.push(encode(&snapshot));
    for event in state.run_hub.get_buffered_events(&run_id) {
        if event.seq() > snapshot_seq {
            queue.push(encode(&event));
        }
    }

    let queue_for_sub = queue.clone();
    let subscriber_id = state.run_hub.subscribe(
        &run_id,
        Arc::new(move |event: RunEvent| {
            queue_for_sub.push(encode(&event));
        }),
    );

    let sender_task = spawn_sender(session, queue.clone());
    let run_hub: Arc<RunEventsHub> = state.run_hub.clone();
    let run_id_for_recv = run_id.clone();

    actix_web::rt::spawn(async move {
        while let Some(Ok(msg)) = msg_stream.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
        run_hub.unsubscribe(&run_id_for_recv, subscriber_id);
        queue.close();
        sender_task.abort();
    });

    Ok(response)
}
