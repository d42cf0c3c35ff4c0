use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};

use crate::models::AnalysisRequest;
use crate::services::event_service::{
    EventService, EVENT_WORK_ADD, EVENT_WORK_QUEUE_DELETED, EVENT_WORK_QUEUE_NEW, EVENT_WORK_REMOVE,
};
use crate::utils::{CoreError, CoreResult};

struct WorkQueue {
    items: Mutex<VecDeque<AnalysisRequest>>,
    notify: Notify,
}

impl WorkQueue {
    fn new() -> Self {
        Self { items: Mutex::new(VecDeque::new()), notify: Notify::new() }
    }
}

/// One strictly-FIFO queue of pending analysis requests per registered
/// module type. Queue deletion discards pending work.
pub struct WorkQueueService {
    queues: DashMap<String, Arc<WorkQueue>>,
    events: Arc<EventService>,
}

impl WorkQueueService {
    pub fn new(events: Arc<EventService>) -> Self {
        Self { queues: DashMap::new(), events }
    }

    /// Creates the queue for the module. Returns true when a new queue was
    /// actually created.
    pub async fn add_work_queue(&self, module_name: &str) -> bool {
        if self.queues.contains_key(module_name) {
            return false;
        }

        self.queues.insert(module_name.to_string(), Arc::new(WorkQueue::new()));
        tracing::debug!("added work queue for {}", module_name);
        self.events.fire_event(EVENT_WORK_QUEUE_NEW, serde_json::json!(module_name)).await;
        true
    }

    /// Deletes the queue and everything in it. Returns true when a queue
    /// existed.
    pub async fn delete_work_queue(&self, module_name: &str) -> bool {
        let removed = self.queues.remove(module_name).is_some();
        if removed {
            tracing::debug!("deleted work queue for {}", module_name);
            self.events
                .fire_event(EVENT_WORK_QUEUE_DELETED, serde_json::json!(module_name))
                .await;
        }
        removed
    }

    fn queue(&self, module_name: &str) -> CoreResult<Arc<WorkQueue>> {
        self.queues
            .get(module_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoreError::InvalidWorkQueue(module_name.to_string()))
    }

    /// Appends the request to the module's queue.
    pub async fn put_work(&self, module_name: &str, request: AnalysisRequest) -> CoreResult<()> {
        let queue = self.queue(module_name)?;
        let request_id = request.id.clone();

        queue.items.lock().await.push_back(request);
        queue.notify.notify_one();

        tracing::debug!("added request {} to work queue for {}", request_id, module_name);
        self.events
            .fire_event(
                EVENT_WORK_ADD,
                serde_json::json!({ "module": module_name, "request_id": request_id }),
            )
            .await;
        Ok(())
    }

    /// Pops the next request. A zero timeout returns immediately; otherwise
    /// the call blocks up to `timeout` waiting for work.
    pub async fn get_work(
        &self,
        module_name: &str,
        timeout: Duration,
    ) -> CoreResult<Option<AnalysisRequest>> {
        let queue = self.queue(module_name)?;
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(request) = queue.items.lock().await.pop_front() {
                self.events
                    .fire_event(
                        EVENT_WORK_REMOVE,
                        serde_json::json!({ "module": module_name, "request_id": request.id }),
                    )
                    .await;
                return Ok(Some(request));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            if tokio::time::timeout(remaining, queue.notify.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    pub fn has_work_queue(&self, module_name: &str) -> bool {
        self.queues.contains_key(module_name)
    }

    pub async fn get_queue_size(&self, module_name: &str) -> CoreResult<usize> {
        let queue = self.queue(module_name)?;
        let size = queue.items.lock().await.len();
        Ok(size)
    }
}
