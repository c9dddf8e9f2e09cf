//! C1: the browser-side recording injection contract. The concrete browser
//! page handle and the recording agent's own JS payload are external to this
//! crate (the browser-automation library is explicitly out of scope); this
//! module only defines the trait boundary, the fixed recording configuration,
//! and an in-memory double used by tests and by callers with no real browser.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::error::{StreamError, StreamResult};

/// Injection deadline: the agent must call the event callback with a
/// Meta + FullSnapshot sequence within this window or injection fails.
pub const INJECTION_DEADLINE: Duration = Duration::from_secs(5);

/// Fixed, versioned recording configuration. Not a per-call parameter: every
/// session is recorded with the same privacy/fidelity tradeoffs.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingOptions {
    pub inline_stylesheet: bool,
    pub inline_images: bool,
    pub collect_fonts: bool,
    pub record_cross_origin_iframes: bool,
    pub record_canvas: bool,
    pub sampling_scroll_ms: u32,
    pub sampling_input: SamplingInput,
    pub sampling_mouse_move_ms: u32,
    pub block_class: &'static str,
    pub ignore_class: &'static str,
    pub mask_text_class: &'static str,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingInput {
    All,
    Last,
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self {
            inline_stylesheet: true,
            inline_images: true,
            collect_fonts: true,
            record_cross_origin_iframes: true,
            record_canvas: true,
            sampling_scroll_ms: 150,
            sampling_input: SamplingInput::Last,
            sampling_mouse_move_ms: 500,
            block_class: "wf-record-block",
            ignore_class: "wf-record-ignore",
            mask_text_class: "wf-record-mask",
        }
    }
}

/// Caps the in-page agent's emission rate with a rolling-window counter, so
/// a bursty page cannot overwhelm the server or a slow viewer.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ThrottleConfig {
    pub max_events_per_second: u32,
    pub window: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_events_per_second: 150,
            window: Duration::from_secs(1),
        }
    }
}

/// Which injection method to attempt; CDN is tried first, inline is the
/// fallback. A method is never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionMethod {
    Cdn,
    Inline,
}

/// A server-side callback invoked by page-side code via an exposed binding.
/// Both the event and error channels accept a JSON string, matching the
/// two-callback page contract.
pub type EventCallback = std::sync::Arc<dyn Fn(String) + Send + Sync>;
pub type ErrorCallback = std::sync::Arc<dyn Fn(String) + Send + Sync>;

/// Makes a browser page emit DOM events to a server-side callback. The
/// concrete browser-automation crate implements this against its own page
/// handle type; this crate ships only the trait and an in-memory double.
#[async_trait]
pub trait RecorderInjector: Send + Sync {
    async fn start_recording(
        &self,
        session_id: &str,
        method: InjectionMethod,
        event_callback: EventCallback,
        error_callback: ErrorCallback,
    ) -> StreamResult<bool>;

    async fn reinject_after_navigation(&self, url: &str) -> StreamResult<bool>;

    async fn stop_recording(&self) -> StreamResult<bool>;

    fn enable_navigation_monitoring(&self);

    fn disable_navigation_monitoring(&self);
}

/// An in-memory `RecorderInjector` for tests and non-browser callers: it
/// records calls and immediately "injects" by invoking the event callback
/// with a synthetic Meta + FullSnapshot pair, honoring the same timeout
/// semantics a real page would be held to.
pub struct InMemoryRecorder {
    navigation_monitoring: std::sync::atomic::AtomicBool,
    fail_injection: bool,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self {
            navigation_monitoring: std::sync::atomic::AtomicBool::new(false),
            fail_injection: false,
        }
    }

    pub fn always_timeout() -> Self {
        Self {
            navigation_monitoring: std::sync::atomic::AtomicBool::new(false),
            fail_injection: true,
        }
    }
}

impl Default for InMemoryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecorderInjector for InMemoryRecorder {
    async fn start_recording(
        &self,
        _session_id: &str,
        _method: InjectionMethod,
        event_callback: EventCallback,
        _error_callback: ErrorCallback,
    ) -> StreamResult<bool> {
        if self.fail_injection {
            return Err(StreamError::InjectionTimeout);
        }
        let now = chrono::Utc::now().timestamp_millis();
        event_callback(serde_json::json!({"type": 4, "timestamp": now}).to_string());
        event_callback(
            serde_json::json!({
                "type": 2,
                "timestamp": now,
                "data": {"node": {"tag": "html", "children": []}}
            })
            .to_string(),
        );
        Ok(true)
    }

    async fn reinject_after_navigation(&self, _url: &str) -> StreamResult<bool> {
        Ok(true)
    }

    async fn stop_recording(&self) -> StreamResult<bool> {
        Ok(true)
    }

    fn enable_navigation_monitoring(&self) {
        self.navigation_monitoring
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn disable_navigation_monitoring(&self) {
        self.navigation_monitoring
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn in_memory_recorder_emits_meta_then_fullsnapshot() {
        let recorder = InMemoryRecorder::new();
        let received = std::sync::Arc::new(Mutex::new(Vec::new()));
        let received_cb = received.clone();
        let event_cb: EventCallback = std::sync::Arc::new(move |payload| {
            received_cb.lock().unwrap().push(payload);
        });
        let error_cb: ErrorCallback = std::sync::Arc::new(|_| {});

        let ok = recorder
            .start_recording("visual-test", InjectionMethod::Cdn, event_cb, error_cb)
            .await
            .unwrap();
        assert!(ok);

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&events[0]).unwrap();
        let second: serde_json::Value = serde_json::from_str(&events[1]).unwrap();
        assert_eq!(first["type"], 4);
        assert_eq!(second["type"], 2);
    }

    #[tokio::test]
    async fn failing_recorder_reports_injection_timeout() {
        let recorder = InMemoryRecorder::always_timeout();
        let event_cb: EventCallback = std::sync::Arc::new(|_| {});
        let error_cb: ErrorCallback = std::sync::Arc::new(|_| {});
        let result = recorder
            .start_recording("visual-test", InjectionMethod::Cdn, event_cb, error_cb)
            .await;
        assert!(matches!(result, Err(StreamError::InjectionTimeout)));
    }
}
