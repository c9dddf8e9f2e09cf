//! C3: creates, looks up, and retires Session Streamers (C2); runs a
//! periodic GC of idle sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;

use crate::models::SessionFrame;
use crate::session_streamer::SessionStreamer;

const GC_INTERVAL: Duration = Duration::from_secs(5 * 60);
const IDLE_RETIRE_AFTER: chrono::Duration = chrono::Duration::minutes(5);
const STALE_STREAMING_RETIRE_AFTER: chrono::Duration = chrono::Duration::minutes(10);

pub struct StreamerManager {
    streamers: DashMap<String, Arc<SessionStreamer>>,
    gc_started: AtomicBool,
}

impl StreamerManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streamers: DashMap::new(),
            gc_started: AtomicBool::new(false),
        })
    }

    /// The only creation path: returns the existing streamer for `session_id`
    /// or creates and registers a new one.
    pub fn get_or_create_streamer(self: &Arc<Self>, session_id: &str) -> Arc<SessionStreamer> {
        self.ensure_gc_started();
        self.streamers
            .entry(session_id.to_string())
            .or_insert_with(|| SessionStreamer::new(session_id))
            .clone()
    }

    pub fn get_streamer(&self, session_id: &str) -> Option<Arc<SessionStreamer>> {
        self.streamers.get(session_id).map(|entry| entry.clone())
    }

    /// Gracefully shuts the streamer down and drops it from the registry.
    pub async fn remove_streamer(&self, session_id: &str) {
        if let Some((_, streamer)) = self.streamers.remove(session_id) {
            streamer.graceful_shutdown().await;
        }
    }

    pub fn session_count(&self) -> usize {
        self.streamers.len()
    }

    /// Lists every active session with a small summary, for the
    /// administrative `/workflows/visual/sessions` endpoint.
    pub fn list_sessions(&self) -> Vec<crate::session_streamer::StreamerStatus> {
        self.streamers
            .iter()
            .map(|entry| entry.value().status())
            .collect()
    }

    /// Sends an administrative control message to every session. Failures on
    /// one session are localized and do not affect others.
    pub fn broadcast_to_all_sessions(&self, frame: &SessionFrame) {
        let encoded: Arc<str> = match serde_json::to_string(frame) {
            Ok(s) => Arc::from(s),
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode broadcast frame");
                return;
            }
        };
        for entry in self.streamers.iter() {
            // This is an out-of-band control path: it does not consume or
            // perturb the session's sequence-id space.
            entry.value().broadcast_raw(encoded.clone());
        }
    }

    fn ensure_gc_started(self: &Arc<Self>) {
        if self
            .gc_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            // Small random jitter on the first tick so a fleet of workers
            // restarted together doesn't all GC in lockstep.
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..5_000));
            tokio::time::sleep(jitter).await;
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                this.run_gc_pass().await;
            }
        });
    }

    async fn run_gc_pass(&self) {
        let now = Utc::now();
        let mut to_remove = Vec::new();
        for entry in self.streamers.iter() {
            let streamer = entry.value();
            if streamer.connected_clients() > 0 {
                continue;
            }
            let idle_since = streamer.last_event_at().unwrap_or(now);
            let idle_for = now - idle_since;
            let streaming_stale = streamer.streaming_active()
                && idle_for > STALE_STREAMING_RETIRE_AFTER;
            if idle_for > IDLE_RETIRE_AFTER || streaming_stale {
                to_remove.push(entry.key().clone());
            }
        }
        for session_id in to_remove {
            tracing::info!(session_id, "GC retiring idle session");
            self.remove_streamer(&session_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_the_only_creation_path_and_is_idempotent() {
        let manager = StreamerManager::new();
        let first = manager.get_or_create_streamer("visual-a");
        let second = manager.get_or_create_streamer("visual-a");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.session_count(), 1);
    }

    #[test]
    fn get_streamer_is_read_only_and_misses_are_none() {
        let manager = StreamerManager::new();
        assert!(manager.get_streamer("visual-missing").is_none());
        manager.get_or_create_streamer("visual-b");
        assert!(manager.get_streamer("visual-b").is_some());
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn remove_then_recreate_yields_a_distinct_streamer_with_fresh_sequence() {
        let manager = StreamerManager::new();
        let first = manager.get_or_create_streamer("visual-c");
        first.process_event(serde_json::json!({"type": 4, "timestamp": 1}));

        manager.remove_streamer("visual-c").await;
        assert!(manager.get_streamer("visual-c").is_none());

        let second = manager.get_or_create_streamer("visual-c");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.status().events_processed, 0);
    }

    #[tokio::test]
    async fn gc_does_not_retire_a_session_with_a_connected_client() {
        let manager = StreamerManager::new();
        let streamer = manager.get_or_create_streamer("visual-d");
        let _queue = streamer.add_client(uuid::Uuid::new_v4());

        manager.run_gc_pass().await;

        assert!(manager.get_streamer("visual-d").is_some());
    }

    #[tokio::test]
    async fn gc_retires_an_idle_session_with_no_clients() {
        let manager = StreamerManager::new();
        let streamer = manager.get_or_create_streamer("visual-e");
        streamer.process_event(serde_json::json!({"type": 4, "timestamp": 1}));
        streamer
            .set_last_event_at_for_test(Utc::now() - IDLE_RETIRE_AFTER - chrono::Duration::seconds(1));

        manager.run_gc_pass().await;

        assert!(manager.get_streamer("visual-e").is_none());
    }
}
