//! C2: per-session DOM-event validation, sequencing, buffering, phase state
//! machine, client registry, and broadcast.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::{
    FinalStats, SequencedEvent, SessionFrame, StreamingPhase, EVENT_TYPE_FULL_SNAPSHOT,
};
use crate::queue::BoundedQueue;

const BUFFER_CAPACITY: usize = 1_000;
const CLIENT_QUEUE_CAPACITY: usize = 500;

struct ClientSlot {
    queue: Arc<BoundedQueue<Arc<str>>>,
    pending_reset: AtomicBool,
}

/// A point-in-time view used by the status endpoint; deliberately plain data,
/// not wired back into the streamer.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerStatus {
    pub session_id: String,
    pub phase: StreamingPhase,
    pub streaming_active: bool,
    pub browser_ready: bool,
    pub events_processed: u64,
    pub workflow_events: u64,
    pub setup_events: u64,
    pub connected_clients: usize,
    pub streaming_ready: bool,
}

/// The session's lifecycle plus its event buffer, client registry, and
/// broadcast plumbing. One instance exclusively owns its buffer, client set,
/// and phase; the Streamer Manager (C3) exclusively owns the session-id ->
/// instance mapping.
pub struct SessionStreamer {
    session_id: String,
    phase: Mutex<StreamingPhase>,
    sequence_counter: AtomicU64,
    buffer: Mutex<VecDeque<SequencedEvent>>,
    clients: DashMap<Uuid, ClientSlot>,
    streaming_active: AtomicBool,
    browser_ready: AtomicBool,
    workflow_events: AtomicU64,
    setup_events: AtomicU64,
    first_workflow_event_at: Mutex<Option<DateTime<Utc>>>,
    created_at: DateTime<Utc>,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
    broadcast_tx: mpsc::UnboundedSender<Arc<str>>,
    broadcast_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<str>>>>,
    broadcast_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionStreamer {
    pub fn new(session_id: impl Into<String>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            session_id: session_id.into(),
            phase: Mutex::new(StreamingPhase::Setup),
            sequence_counter: AtomicU64::new(0),
            buffer: Mutex::new(VecDeque::with_capacity(64)),
            clients: DashMap::new(),
            streaming_active: AtomicBool::new(false),
            browser_ready: AtomicBool::new(false),
            workflow_events: AtomicU64::new(0),
            setup_events: AtomicU64::new(0),
            first_workflow_event_at: Mutex::new(None),
            created_at: Utc::now(),
            last_event_at: Mutex::new(None),
            broadcast_tx: tx,
            broadcast_rx: Mutex::new(Some(rx)),
            broadcast_task: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> StreamingPhase {
        *self.phase.lock().unwrap()
    }

    pub fn browser_ready(&self) -> bool {
        self.browser_ready.load(Ordering::Acquire)
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        *self.last_event_at.lock().unwrap()
    }

    #[cfg(test)]
    pub fn set_last_event_at_for_test(&self, at: DateTime<Utc>) {
        *self.last_event_at.lock().unwrap() = Some(at);
    }

    pub fn streaming_active(&self) -> bool {
        self.streaming_active.load(Ordering::Acquire)
    }

    /// Validates, sequences, buffers, and schedules `raw` for broadcast.
    /// Returns false on validation failure (caller should drop the event).
    pub fn process_event(&self, mut raw: Value) -> bool {
        let Some(event_type) = raw.get("type").and_then(|v| v.as_i64()) else {
            tracing::warn!(session_id = %self.session_id, "dropping event with missing type");
            return false;
        };
        if !(0..=5).contains(&event_type) {
            tracing::warn!(session_id = %self.session_id, event_type, "dropping event with unknown type");
            return false;
        }
        if event_type == EVENT_TYPE_FULL_SNAPSHOT {
            let node = raw.pointer("/data/node");
            let empty = match node {
                None => true,
                Some(Value::Null) => true,
                Some(Value::Object(m)) => m.is_empty(),
                _ => false,
            };
            if empty {
                tracing::warn!(session_id = %self.session_id, "dropping FullSnapshot with empty DOM tree");
                return false;
            }
        }
        if raw.get("timestamp").and_then(|v| v.as_i64()).is_none() {
            if let Value::Object(map) = &mut raw {
                map.insert("timestamp".into(), Utc::now().timestamp_millis().into());
            }
        }

        let sequence_id = self.sequence_counter.fetch_add(1, Ordering::SeqCst);
        let received_at = Utc::now();
        let event = SequencedEvent {
            session_id: self.session_id.clone(),
            received_at,
            sequence_id,
            event: raw,
        };

        {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.len() >= BUFFER_CAPACITY {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }
        *self.last_event_at.lock().unwrap() = Some(received_at);

        if self.phase() == StreamingPhase::Executing {
            self.workflow_events.fetch_add(1, Ordering::SeqCst);
            let mut first = self.first_workflow_event_at.lock().unwrap();
            if first.is_none() {
                *first = Some(received_at);
            }
        } else {
            self.setup_events.fetch_add(1, Ordering::SeqCst);
        }

        if self.streaming_active.load(Ordering::Acquire) {
            let _ = self.broadcast_tx.send(encode_rrweb(&self.session_id, &event));
        }
        true
    }

    /// Registers a consumer and immediately replays the current buffer to it.
    pub fn add_client(&self, client_id: Uuid) -> Arc<BoundedQueue<Arc<str>>> {
        let queue = BoundedQueue::new(CLIENT_QUEUE_CAPACITY);
        self.clients.insert(
            client_id,
            ClientSlot {
                queue: queue.clone(),
                pending_reset: AtomicBool::new(false),
            },
        );
        let buffer = self.buffer.lock().unwrap();
        for event in buffer.iter() {
            queue.push(encode_rrweb(&self.session_id, event));
        }
        queue
    }

    pub fn remove_client(&self, client_id: Uuid) {
        if let Some((_, slot)) = self.clients.remove(&client_id) {
            slot.queue.close();
        }
    }

    /// Marks that the next replay batch for `client_id` is a sequence reset;
    /// a per-client flag only, never touches session-wide state.
    pub fn mark_sequence_reset_for_client(&self, client_id: Uuid) {
        if let Some(slot) = self.clients.get(&client_id) {
            slot.pending_reset.store(true, Ordering::SeqCst);
        }
    }

    /// Sends the most recent FullSnapshot plus a trailing window of events to
    /// `client_id`. Read-only: does not rewind `sequence_counter` or mutate
    /// the main buffer.
    pub fn send_last_fullsnapshot_to_client(
        &self,
        client_id: Uuid,
        history_window_seconds: f64,
    ) -> bool {
        let Some(slot) = self.clients.get(&client_id) else {
            return false;
        };
        let buffer = self.buffer.lock().unwrap();
        let Some(last_full) = buffer
            .iter()
            .rev()
            .find(|e| e.event_type() == Some(EVENT_TYPE_FULL_SNAPSHOT))
        else {
            return false;
        };
        let cutoff = Utc::now() - chrono::Duration::milliseconds(
            (history_window_seconds * 1000.0) as i64,
        );
        let mut frames = vec![encode_rrweb(&self.session_id, last_full)];
        for event in buffer.iter() {
            if event.sequence_id > last_full.sequence_id && event.received_at >= cutoff {
                frames.push(encode_rrweb(&self.session_id, event));
            }
        }
        drop(buffer);
        for frame in frames {
            slot.queue.push(frame);
        }
        slot.pending_reset.store(false, Ordering::SeqCst);
        true
    }

    /// Starts the broadcast task if not already running. Idempotent.
    pub fn start_streaming(self: &Arc<Self>) -> bool {
        if self
            .streaming_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return true;
        }
        let Some(mut rx) = self.broadcast_rx.lock().unwrap().take() else {
            return true;
        };
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let clients: Vec<Arc<BoundedQueue<Arc<str>>>> = this
                    .clients
                    .iter()
                    .map(|entry| entry.value().queue.clone())
                    .collect();
                for queue in clients {
                    queue.push(message.clone());
                }
            }
        });
        *self.broadcast_task.lock().unwrap() = Some(handle);
        true
    }

    /// Stops the broadcast task. Idempotent.
    pub fn stop_streaming(&self) -> bool {
        if self
            .streaming_active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return true;
        }
        if let Some(handle) = self.broadcast_task.lock().unwrap().take() {
            handle.abort();
        }
        true
    }

    /// Sends a terminal `workflow_completed` control frame to every client,
    /// waits briefly, then closes their queues (and thus their sockets).
    pub async fn graceful_shutdown(&self) {
        let total_events = self.workflow_events.load(Ordering::SeqCst)
            + self.setup_events.load(Ordering::SeqCst);
        let session_duration = (Utc::now() - self.created_at).num_milliseconds() as f64 / 1000.0;
        let events_per_second = if session_duration > 0.0 {
            total_events as f64 / session_duration
        } else {
            0.0
        };
        let frame = SessionFrame::WorkflowCompleted {
            session_id: self.session_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            message: "workflow completed".to_string(),
            final_stats: FinalStats {
                total_events,
                session_duration,
                events_per_second,
            },
        };
        let encoded: Arc<str> = Arc::from(serde_json::to_string(&frame).unwrap_or_default());
        for entry in self.clients.iter() {
            entry.value().queue.push(encoded.clone());
        }
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        for entry in self.clients.iter() {
            entry.value().queue.close();
        }
        self.stop_streaming();
    }

    fn set_phase_at_least(&self, target: StreamingPhase) {
        let mut phase = self.phase.lock().unwrap();
        if *phase < target {
            *phase = target;
        }
    }

    pub fn transition_to_ready(&self) {
        self.set_phase_at_least(StreamingPhase::Ready);
    }

    pub fn transition_to_executing(&self) {
        self.set_phase_at_least(StreamingPhase::Executing);
        self.browser_ready.store(true, Ordering::SeqCst);
    }

    pub fn transition_to_completed(&self) {
        self.set_phase_at_least(StreamingPhase::Completed);
    }

    /// Keeps `browser_ready` set until `final_cleanup` so viewers can tell a
    /// finished workflow apart from an aborted one.
    pub fn transition_to_cleanup(&self) {
        self.set_phase_at_least(StreamingPhase::Cleanup);
    }

    pub fn final_cleanup(&self) {
        self.set_phase_at_least(StreamingPhase::Cleanup);
        self.browser_ready.store(false, Ordering::SeqCst);
    }

    /// Delivers a pre-encoded out-of-band control frame to every currently
    /// connected client, bypassing sequencing entirely. Used for
    /// administrative broadcasts that are not DOM events.
    pub fn broadcast_raw(&self, encoded: Arc<str>) {
        for entry in self.clients.iter() {
            entry.value().queue.push(encoded.clone());
        }
    }

    pub fn status(&self) -> StreamerStatus {
        let events_processed = self.sequence_counter.load(Ordering::SeqCst);
        let streaming_active = self.streaming_active.load(Ordering::Acquire);
        let browser_ready = self.browser_ready.load(Ordering::Acquire);
        StreamerStatus {
            session_id: self.session_id.clone(),
            phase: self.phase(),
            streaming_active,
            browser_ready,
            events_processed,
            workflow_events: self.workflow_events.load(Ordering::SeqCst),
            setup_events: self.setup_events.load(Ordering::SeqCst),
            connected_clients: self.clients.len(),
            streaming_ready: streaming_active
                && events_processed > 0
                && (browser_ready || events_processed >= 3),
        }
    }
}

fn encode_rrweb(session_id: &str, event: &SequencedEvent) -> Arc<str> {
    let frame = SessionFrame::RrwebEvent {
        session_id: session_id.to_string(),
        timestamp: event.received_at.timestamp_millis(),
        event: event.event.clone(),
        sequence_id: event.sequence_id,
    };
    Arc::from(serde_json::to_string(&frame).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta_event() -> Value {
        json!({"type": 4, "timestamp": 1})
    }

    fn full_snapshot(tag: &str) -> Value {
        json!({"type": 2, "timestamp": 2, "data": {"node": {"tag": tag, "children": []}}})
    }

    fn incremental() -> Value {
        json!({"type": 3, "timestamp": 3, "data": {"source": 0}})
    }

    #[test]
    fn first_event_gets_sequence_zero() {
        let streamer = SessionStreamer::new("visual-test");
        assert!(streamer.process_event(meta_event()));
        assert_eq!(streamer.sequence_counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejects_malformed_and_empty_fullsnapshot() {
        let streamer = SessionStreamer::new("visual-test");
        assert!(!streamer.process_event(json!({"timestamp": 1})));
        assert!(!streamer.process_event(json!({"type": 2, "data": {"node": {}}})));
        assert!(streamer.process_event(full_snapshot("html")));
    }

    #[tokio::test]
    async fn client_replays_buffer_then_reset_sends_single_fullsnapshot() {
        let streamer = SessionStreamer::new("visual-00000000-0000-0000-0000-000000000001");
        streamer.process_event(meta_event());
        streamer.process_event(full_snapshot("html"));
        streamer.process_event(incremental());
        streamer.process_event(incremental());

        let client_id = Uuid::new_v4();
        let queue = streamer.add_client(client_id);
        let mut sequence_ids = Vec::new();
        for _ in 0..4 {
            let raw = queue.recv().await.unwrap();
            let value: Value = serde_json::from_str(&raw).unwrap();
            sequence_ids.push(value["sequence_id"].as_u64().unwrap());
        }
        assert_eq!(sequence_ids, vec![0, 1, 2, 3]);

        streamer.mark_sequence_reset_for_client(client_id);
        assert!(streamer.send_last_fullsnapshot_to_client(client_id, 2.0));
        let raw = queue.recv().await.unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["event"]["type"], 2);
        // sequence counter must be untouched by the replay-only operation.
        assert_eq!(streamer.sequence_counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn phase_transitions_are_one_way_and_idempotent() {
        let streamer = SessionStreamer::new("visual-test");
        streamer.transition_to_ready();
        streamer.transition_to_ready();
        assert_eq!(streamer.phase(), StreamingPhase::Ready);
        streamer.transition_to_executing();
        assert!(streamer.browser_ready());
        streamer.transition_to_completed();
        streamer.transition_to_ready();
        assert_eq!(streamer.phase(), StreamingPhase::Completed);
    }

    #[test]
    fn setup_phase_events_never_counted_as_workflow_events() {
        let streamer = SessionStreamer::new("visual-test");
        streamer.process_event(meta_event());
        streamer.process_event(full_snapshot("html"));
        assert_eq!(streamer.workflow_events.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn start_and_stop_streaming_are_idempotent() {
        let streamer = SessionStreamer::new("visual-test");
        assert!(streamer.start_streaming());
        assert!(streamer.start_streaming());
        assert!(streamer.stop_streaming());
        assert!(streamer.stop_streaming());
    }
}
