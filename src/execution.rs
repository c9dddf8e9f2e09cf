//! Boundary to the external collaborator that persists execution records
//! (workflow_id, status, visual_streaming_enabled, ...). Storage technology
//! and the relational schema itself are out of scope for this crate; this
//! is the narrow notification surface the core can call into.

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionUpdate {
    pub execution_id: String,
    pub session_id: Option<String>,
    pub status: ExecutionStatus,
    pub visual_events_captured: Option<u64>,
    pub visual_stream_duration: Option<f64>,
    pub error: Option<String>,
}

/// Implemented by whatever owns the `execution_id -> row` table. The core
/// notifies it at lifecycle boundaries (e.g. termination) without knowing
/// anything about the underlying store.
#[async_trait]
pub trait ExecutionRecordSink: Send + Sync {
    async fn record_update(&self, update: ExecutionUpdate) -> anyhow::Result<()>;
}

/// A sink that drops every update; used when no external store is wired in
/// (tests, or a deployment that doesn't persist execution history).
pub struct NoopExecutionRecordSink;

#[async_trait]
impl ExecutionRecordSink for NoopExecutionRecordSink {
    async fn record_update(&self, _update: ExecutionUpdate) -> anyhow::Result<()> {
        Ok(())
    }
}
