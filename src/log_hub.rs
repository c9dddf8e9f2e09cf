//! C4: per-execution-id log fan-out with bounded history, TTL, and optional
//! cross-process delivery over an injected `PeerChannel`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use uuid::Uuid;

use crate::models::LogRecord;

const HISTORY_CAPACITY: usize = 200;
const TTL_SECONDS: i64 = 180;

pub type LogCallback = Arc<dyn Fn(LogRecord) + Send + Sync>;

/// Narrow boundary to an external cross-process pub/sub collaborator
/// (Redis, in the one implementation this crate ships).
#[async_trait]
pub trait PeerChannel: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> anyhow::Result<()>;
    async fn subscribe(
        &self,
        channel: &str,
    ) -> anyhow::Result<futures_util::stream::BoxStream<'static, Vec<u8>>>;
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PeerEnvelope {
    publisher_id: String,
    record: LogRecord,
}

struct Subscriber {
    id: Uuid,
    callback: LogCallback,
}

struct ExecutionState {
    subscribers: Mutex<Vec<Subscriber>>,
    history: Mutex<VecDeque<LogRecord>>,
    last_publish_at: Mutex<Option<chrono::DateTime<Utc>>>,
    peer_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ExecutionState {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            last_publish_at: Mutex::new(None),
            peer_task: Mutex::new(None),
        }
    }
}

pub struct LogHub {
    executions: DashMap<String, Arc<ExecutionState>>,
    peer: Option<Arc<dyn PeerChannel>>,
    publisher_id: String,
}

impl LogHub {
    pub fn new(peer: Option<Arc<dyn PeerChannel>>) -> Arc<Self> {
        let hostname = hostname_or_default();
        let pid = std::process::id();
        Arc::new(Self {
            executions: DashMap::new(),
            peer,
            publisher_id: format!("{hostname}-{pid}"),
        })
    }

    fn state(&self, execution_id: &str) -> Arc<ExecutionState> {
        self.executions
            .entry(execution_id.to_string())
            .or_insert_with(|| Arc::new(ExecutionState::new()))
            .clone()
    }

    /// Registers `callback` for `execution_id`. Opens a peer-channel
    /// subscription on the 0 -> 1 local-subscriber transition.
    pub fn subscribe(&self, execution_id: &str, callback: LogCallback) -> Uuid {
        let state = self.state(execution_id);
        let id = Uuid::new_v4();
        let opened_first = {
            let mut subs = state.subscribers.lock().unwrap();
            let was_empty = subs.is_empty();
            subs.push(Subscriber { id, callback });
            was_empty
        };

        if opened_first {
            if let Some(peer) = self.peer.clone() {
                let channel = format!("logs:{execution_id}");
                let state_for_task = state.clone();
                let publisher_id = self.publisher_id.clone();
                let handle = tokio::spawn(async move {
                    let stream = match peer.subscribe(&channel).await {
                        Ok(s) => s,
                        Err(err) => {
                            tracing::warn!(error = %err, channel, "peer channel subscribe failed");
                            return;
                        }
                    };
                    tokio::pin!(stream);
                    while let Some(bytes) = stream.next().await {
                        let Ok(envelope) = serde_json::from_slice::<PeerEnvelope>(&bytes) else {
                            continue;
                        };
                        if envelope.publisher_id == publisher_id {
                            continue; // self-echo suppression
                        }
                        deliver_local(&state_for_task, envelope.record, true);
                    }
                });
                *state.peer_task.lock().unwrap() = Some(handle);
            }
        }

        id
    }

    pub fn unsubscribe(&self, execution_id: &str, id: Uuid) {
        if let Some(state) = self.executions.get(execution_id) {
            let became_empty = {
                let mut subs = state.subscribers.lock().unwrap();
                subs.retain(|s| s.id != id);
                subs.is_empty()
            };
            if became_empty {
                if let Some(handle) = state.peer_task.lock().unwrap().take() {
                    handle.abort();
                }
            }
        }
    }

    /// Appends to history and schedules every local subscriber's callback as
    /// a fire-and-forget task. No-op for an empty execution-id. Returns the
    /// number of callbacks scheduled.
    pub fn publish(&self, execution_id: &str, record: LogRecord) -> usize {
        if execution_id.is_empty() {
            return 0;
        }
        let state = self.state(execution_id);
        purge_if_expired(&state);
        {
            let mut history = state.history.lock().unwrap();
            if history.len() >= HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(record.clone());
            *state.last_publish_at.lock().unwrap() = Some(Utc::now());
        }
        deliver_local(&state, record, false)
    }

    /// Publishes to the peer channel if one is configured; silent no-op
    /// (`HubUnavailable`) otherwise.
    pub fn publish_to_peer(&self, execution_id: &str, record: LogRecord) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        let channel = format!("logs:{execution_id}");
        let envelope = PeerEnvelope {
            publisher_id: self.publisher_id.clone(),
            record,
        };
        tokio::spawn(async move {
            let Ok(bytes) = serde_json::to_vec(&envelope) else {
                return;
            };
            if let Err(err) = peer.publish(&channel, bytes).await {
                tracing::warn!(error = %err, channel, "peer channel publish failed");
            }
        });
    }

    pub fn get_history(&self, execution_id: &str) -> Vec<LogRecord> {
        if let Some(state) = self.executions.get(execution_id) {
            purge_if_expired(&state);
            state.history.lock().unwrap().iter().cloned().collect()
        } else {
            Vec::new()
        }
    }
}

fn purge_if_expired(state: &ExecutionState) {
    let mut last = state.last_publish_at.lock().unwrap();
    if let Some(at) = *last {
        if (Utc::now() - at).num_seconds() > TTL_SECONDS {
            state.history.lock().unwrap().clear();
            *last = None;
        }
    }
}

fn deliver_local(state: &ExecutionState, record: LogRecord, replay: bool) -> usize {
    let mut record = record;
    if replay {
        record.replay = Some(true);
    }
    let callbacks: Vec<LogCallback> = state
        .subscribers
        .lock()
        .unwrap()
        .iter()
        .map(|s| s.callback.clone())
        .collect();

    let scheduled = callbacks.len();
    for callback in callbacks {
        let record = record.clone();
        tokio::spawn(async move {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(record)));
            if result.is_err() {
                tracing::warn!("log subscriber callback panicked");
            }
        });
    }
    scheduled
}

fn hostname_or_default() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            frame_type: "log".to_string(),
            timestamp: 0,
            level: "INFO".to_string(),
            logger: "test".to_string(),
            message: message.to_string(),
            execution_id: "exec-1".to_string(),
            pathname: None,
            lineno: None,
            replay: None,
        }
    }

    #[test]
    fn publish_with_empty_execution_id_is_a_no_op() {
        let hub = LogHub::new(None);
        assert_eq!(hub.publish("", record("ignored")), 0);
        assert!(hub.get_history("").is_empty());
    }

    #[tokio::test]
    async fn late_subscriber_sees_history_replayed_before_live_events() {
        let hub = LogHub::new(None);
        hub.publish("exec-1", record("m1"));
        hub.publish("exec-1", record("m2"));
        hub.publish("exec-1", record("m3"));

        let history = hub.get_history("exec-1");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message, "m1");

        let (tx, rx) = mpsc::channel();
        let id = hub.subscribe(
            "exec-1",
            Arc::new(move |record: LogRecord| {
                let _ = tx.send(record);
            }),
        );
        hub.publish("exec-1", record("m4"));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let live = rx.try_recv().expect("expected live delivery");
        assert_eq!(live.message, "m4");
        assert!(live.replay.is_none());

        hub.unsubscribe("exec-1", id);
    }

    #[test]
    fn history_is_bounded_to_capacity() {
        let hub = LogHub::new(None);
        for i in 0..(HISTORY_CAPACITY + 10) {
            hub.publish("exec-2", record(&format!("m{i}")));
        }
        assert_eq!(hub.get_history("exec-2").len(), HISTORY_CAPACITY);
    }

    #[test]
    fn history_is_purged_after_ttl_elapses() {
        let hub = LogHub::new(None);
        hub.publish("exec-3", record("m1"));
        assert_eq!(hub.get_history("exec-3").len(), 1);

        let state = hub.state("exec-3");
        *state.last_publish_at.lock().unwrap() =
            Some(Utc::now() - chrono::Duration::seconds(TTL_SECONDS + 1));
        assert!(hub.get_history("exec-3").is_empty());
    }

    struct EchoPeer {
        tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
        rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>>>,
    }

    #[async_trait]
    impl PeerChannel for EchoPeer {
        async fn publish(&self, _channel: &str, payload: Vec<u8>) -> anyhow::Result<()> {
            let _ = self.tx.send(payload);
            Ok(())
        }

        async fn subscribe(
            &self,
            _channel: &str,
        ) -> anyhow::Result<futures_util::stream::BoxStream<'static, Vec<u8>>> {
            let rx = self.rx.lock().unwrap().take().expect("single subscriber in this test");
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(Box::pin(stream))
        }
    }

    #[tokio::test]
    async fn self_published_peer_messages_are_not_echoed_back_locally() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let peer = Arc::new(EchoPeer {
            tx,
            rx: Mutex::new(Some(rx)),
        });
        let hub = LogHub::new(Some(peer.clone() as Arc<dyn PeerChannel>));

        let (delivered_tx, delivered_rx) = mpsc::channel();
        hub.subscribe(
            "exec-4",
            Arc::new(move |record: LogRecord| {
                let _ = delivered_tx.send(record);
            }),
        );
        // Allow the 0->1 subscriber transition to open the peer subscription.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        hub.publish_to_peer("exec-4", record("from-self"));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(
            delivered_rx.try_recv().is_err(),
            "a message tagged with our own publisher id must not be echoed back"
        );
    }
}

