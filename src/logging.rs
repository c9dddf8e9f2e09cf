//! Task-local execution-id propagation and the tracing layer that forwards
//! log events tagged with an execution-id to the Log Hub (C4).

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::log_hub::LogHub;
use crate::models::LogRecord;

tokio::task_local! {
    static EXECUTION_ID: String;
}

/// Runs `fut` with `execution_id` set as the task-local value for its whole
/// scope, including tasks spawned from within it via [`with_execution_id`]
/// again at the child's spawn site.
pub async fn with_execution_id<F: Future>(execution_id: String, fut: F) -> F::Output {
    EXECUTION_ID.scope(execution_id, fut).await
}

/// Reads the execution-id set by the innermost enclosing [`with_execution_id`]
/// scope, if any.
pub fn current_execution_id() -> Option<String> {
    EXECUTION_ID.try_with(|id| id.clone()).ok()
}

/// Initializes the global `tracing` subscriber: an `EnvFilter` driven by
/// `RUST_LOG`/`SERVER_LOG`, a `fmt` layer, and the [`LogHubLayer`] bridging
/// to the Log Hub.
pub fn init_logging(log_hub: Arc<LogHub>) {
    use tracing_subscriber::prelude::*;

    let filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("SERVER_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    let env_filter = tracing_subscriber::EnvFilter::new(filter);
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(LogHubLayer { hub: log_hub });

    // Only the process's real entrypoint should install a global subscriber;
    // tests call this at most once and ignore a late-binding failure.
    let _ = registry.try_init();
}

/// A `tracing_subscriber::Layer` that forwards events tagged with a
/// non-empty execution-id to the Log Hub. Never panics into the logger.
pub struct LogHubLayer {
    hub: Arc<LogHub>,
}

struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        }
    }
}

impl<S: Subscriber> Layer<S> for LogHubLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(execution_id) = current_execution_id() else {
            return;
        };
        if execution_id.is_empty() {
            return;
        }

        let mut visitor = MessageVisitor { message: None };
        event.record(&mut visitor);
        let metadata = event.metadata();

        let record = LogRecord {
            frame_type: "log".to_string(),
            timestamp: Utc::now().timestamp_millis(),
            level: metadata.level().to_string(),
            logger: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            execution_id: execution_id.clone(),
            pathname: metadata.file().map(|s| s.to_string()),
            lineno: metadata.line(),
            replay: None,
        };

        // publish() is synchronous and schedules delivery fire-and-forget;
        // a panicking subscriber must never bring the logger down with it.
        let hub = self.hub.clone();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            hub.publish(&execution_id, record);
        }));
    }
}
