//! The control-channel boundary: forwards mouse/keyboard/wheel frames from a
//! viewer to the live browser page. The page itself (and the automation
//! library driving it) is an external collaborator; this module defines the
//! trait boundary, a per-session registry, and an in-memory double.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{StreamError, StreamResult};
use crate::models::ControlMessage;

/// Implemented by whatever drives the real browser page (out of scope for
/// this crate). Dispatches one already-validated control message.
#[async_trait]
pub trait PageController: Send + Sync {
    async fn dispatch(&self, message: &ControlMessage) -> StreamResult<()>;
}

/// Maps session-id -> its page controller. A session only has an entry once
/// its browser page is controllable; `BrowserNotReady` covers the gap.
pub struct PageControllerRegistry {
    controllers: DashMap<String, Arc<dyn PageController>>,
}

impl PageControllerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            controllers: DashMap::new(),
        })
    }

    pub fn register(&self, session_id: &str, controller: Arc<dyn PageController>) {
        self.controllers.insert(session_id.to_string(), controller);
    }

    pub fn unregister(&self, session_id: &str) {
        self.controllers.remove(session_id);
    }

    pub async fn dispatch(&self, session_id: &str, message: &ControlMessage) -> StreamResult<()> {
        let controller = self
            .controllers
            .get(session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| StreamError::BrowserNotReady(session_id.to_string()))?;
        controller.dispatch(message).await
    }
}

/// An in-memory `PageController` for tests: records every message it
/// receives and never fails.
pub struct InMemoryPageController {
    pub received: std::sync::Mutex<Vec<ControlMessage>>,
}

impl InMemoryPageController {
    pub fn new() -> Self {
        Self {
            received: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl Default for InMemoryPageController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageController for InMemoryPageController {
    async fn dispatch(&self, message: &ControlMessage) -> StreamResult<()> {
        self.received.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_without_registration_is_browser_not_ready() {
        let registry = PageControllerRegistry::new();
        let msg = ControlMessage::Mouse {
            action: "click".into(),
            x: Some(1.0),
            y: Some(2.0),
        };
        let result = registry.dispatch("visual-missing", &msg).await;
        assert!(matches!(result, Err(StreamError::BrowserNotReady(_))));
    }

    #[tokio::test]
    async fn dispatch_forwards_to_registered_controller() {
        let registry = PageControllerRegistry::new();
        let controller = Arc::new(InMemoryPageController::new());
        registry.register("visual-a", controller.clone());
        let msg = ControlMessage::Keyboard {
            action: "press".into(),
            key: Some("Enter".into()),
        };
        registry.dispatch("visual-a", &msg).await.unwrap();
        assert_eq!(controller.received.lock().unwrap().len(), 1);
    }
}
