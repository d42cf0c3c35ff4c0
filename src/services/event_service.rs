use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

// analysis tracking
pub const EVENT_ANALYSIS_ROOT_NEW: &str = "/core/analysis/root/new";
pub const EVENT_ANALYSIS_ROOT_MODIFIED: &str = "/core/analysis/root/modified";
pub const EVENT_ANALYSIS_ROOT_COMPLETED: &str = "/core/analysis/root/completed";
pub const EVENT_ANALYSIS_ROOT_EXPIRED: &str = "/core/analysis/root/expired";
pub const EVENT_ANALYSIS_ROOT_DELETED: &str = "/core/analysis/root/deleted";
// analysis details tracking
pub const EVENT_ANALYSIS_DETAILS_NEW: &str = "/core/analysis/details/new";
pub const EVENT_ANALYSIS_DETAILS_MODIFIED: &str = "/core/analysis/details/modified";
pub const EVENT_ANALYSIS_DETAILS_DELETED: &str = "/core/analysis/details/deleted";
// alerting
pub const EVENT_ALERT: &str = "/core/alert/new";
pub const EVENT_ALERT_SYSTEM_REGISTERED: &str = "/core/alert/system/registered";
pub const EVENT_ALERT_SYSTEM_UNREGISTERED: &str = "/core/alert/system/unregistered";
// analysis module tracking
pub const EVENT_AMT_NEW: &str = "/core/module/new";
pub const EVENT_AMT_MODIFIED: &str = "/core/module/modified";
pub const EVENT_AMT_DELETED: &str = "/core/module/deleted";
// analysis request tracking
pub const EVENT_AR_NEW: &str = "/core/request/new";
pub const EVENT_AR_DELETED: &str = "/core/request/deleted";
pub const EVENT_AR_EXPIRED: &str = "/core/request/expired";
// caching
pub const EVENT_CACHE_NEW: &str = "/core/cache/new";
pub const EVENT_CACHE_HIT: &str = "/core/cache/hit";
// config
pub const EVENT_CONFIG_SET: &str = "/core/config/set";
pub const EVENT_CONFIG_DELETE: &str = "/core/config/delete";
// storage
pub const EVENT_STORAGE_NEW: &str = "/core/storage/new";
pub const EVENT_STORAGE_DELETED: &str = "/core/storage/deleted";
// work queues
pub const EVENT_WORK_QUEUE_NEW: &str = "/core/work/queue/new";
pub const EVENT_WORK_QUEUE_DELETED: &str = "/core/work/queue/deleted";
pub const EVENT_WORK_ADD: &str = "/core/work/add";
pub const EVENT_WORK_REMOVE: &str = "/core/work/remove";
pub const EVENT_WORK_ASSIGNED: &str = "/core/work/assigned";
// processing
pub const EVENT_PROCESSING_REQUEST_OBSERVABLE: &str = "/core/processing/request/observable";
pub const EVENT_PROCESSING_REQUEST_ROOT: &str = "/core/processing/request/root";
pub const EVENT_PROCESSING_REQUEST_RESULT: &str = "/core/processing/request/result";

/// A fired domain event: topic name plus a JSON payload.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub name: String,
    pub args: Value,
}

/// Receives domain events. Handlers are treated as untrusted: a failure in
/// one handler never prevents delivery to the others.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> anyhow::Result<()>;

    async fn handle_exception(&self, event: &Event, error: &anyhow::Error) {
        tracing::error!("event handler failed on {}: {}", event.name, error);
    }
}

/// In-process fan-out of named domain events to registered handlers.
/// Per-topic order is preserved within a single firing task; no ordering is
/// guaranteed across topics.
#[derive(Default)]
pub struct EventService {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl EventService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for the given event. Registering the same
    /// handler twice for one event is a no-op.
    pub async fn register_event_handler(&self, event: &str, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        let registered = handlers.entry(event.to_string()).or_default();
        if !registered.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
            registered.push(handler);
        }
    }

    /// Removes the handler from the given events, or from all events when
    /// `events` is empty.
    pub async fn remove_event_handler(&self, handler: &Arc<dyn EventHandler>, events: &[String]) {
        let mut handlers = self.handlers.write().await;
        if events.is_empty() {
            for registered in handlers.values_mut() {
                registered.retain(|existing| !Arc::ptr_eq(existing, handler));
            }
        } else {
            for event in events {
                if let Some(registered) = handlers.get_mut(event) {
                    registered.retain(|existing| !Arc::ptr_eq(existing, handler));
                }
            }
        }
    }

    pub async fn get_event_handlers(&self, event: &str) -> Vec<Arc<dyn EventHandler>> {
        self.handlers.read().await.get(event).cloned().unwrap_or_default()
    }

    /// Dispatches the event to every registered handler. Handler errors are
    /// routed to `handle_exception` and never propagate.
    pub async fn fire_event(&self, name: &str, args: Value) {
        let event = Event { name: name.to_string(), args };
        tracing::debug!("fired event {}", event.name);

        let handlers = self.get_event_handlers(name).await;
        for handler in handlers {
            if let Err(error) = handler.handle_event(&event).await {
                handler.handle_exception(&event, &error).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingHandler {
        received: AtomicUsize,
        exceptions: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle_event(&self, _event: &Event) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("handler failure");
            }
            self.received.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn handle_exception(&self, _event: &Event, _error: &anyhow::Error) {
            self.exceptions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_fire_event_reaches_registered_handlers() {
        let service = EventService::new();
        let handler = Arc::new(RecordingHandler::default());
        service
            .register_event_handler(EVENT_CACHE_HIT, handler.clone() as Arc<dyn EventHandler>)
            .await;

        service.fire_event(EVENT_CACHE_HIT, serde_json::json!({"k": "v"})).await;
        service.fire_event(EVENT_CACHE_NEW, serde_json::json!(null)).await;

        assert_eq!(handler.received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_delivery() {
        let service = EventService::new();
        let failing = Arc::new(RecordingHandler { fail: true, ..Default::default() });
        let healthy = Arc::new(RecordingHandler::default());

        service
            .register_event_handler(EVENT_ALERT, failing.clone() as Arc<dyn EventHandler>)
            .await;
        service
            .register_event_handler(EVENT_ALERT, healthy.clone() as Arc<dyn EventHandler>)
            .await;

        service.fire_event(EVENT_ALERT, serde_json::json!("root-uuid")).await;

        assert_eq!(failing.exceptions.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_event_handler() {
        let service = EventService::new();
        let handler = Arc::new(RecordingHandler::default());
        let as_dyn = handler.clone() as Arc<dyn EventHandler>;

        service.register_event_handler(EVENT_AMT_NEW, as_dyn.clone()).await;
        service.register_event_handler(EVENT_AMT_DELETED, as_dyn.clone()).await;

        // removal from a single event
        service.remove_event_handler(&as_dyn, &[EVENT_AMT_NEW.to_string()]).await;
        service.fire_event(EVENT_AMT_NEW, serde_json::json!(null)).await;
        service.fire_event(EVENT_AMT_DELETED, serde_json::json!(null)).await;
        assert_eq!(handler.received.load(Ordering::SeqCst), 1);

        // removal from everything
        service.remove_event_handler(&as_dyn, &[]).await;
        service.fire_event(EVENT_AMT_DELETED, serde_json::json!(null)).await;
        assert_eq!(handler.received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_ignored() {
        let service = EventService::new();
        let handler = Arc::new(RecordingHandler::default());
        let as_dyn = handler.clone() as Arc<dyn EventHandler>;

        service.register_event_handler(EVENT_WORK_ADD, as_dyn.clone()).await;
        service.register_event_handler(EVENT_WORK_ADD, as_dyn).await;

        service.fire_event(EVENT_WORK_ADD, serde_json::json!(null)).await;
        assert_eq!(handler.received.load(Ordering::SeqCst), 1);
    }
}
