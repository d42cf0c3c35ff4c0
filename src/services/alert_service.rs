use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, Notify};

use crate::services::event_service::{
    EventService, EVENT_ALERT, EVENT_ALERT_SYSTEM_REGISTERED, EVENT_ALERT_SYSTEM_UNREGISTERED,
};
use crate::utils::{CoreError, CoreResult};

struct AlertQueue {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl AlertQueue {
    fn new() -> Self {
        Self { items: Mutex::new(VecDeque::new()), notify: Notify::new() }
    }
}

/// Alert fan-out: roots that accumulate detection points are pushed, by
/// uuid, onto the queue of every registered alert subscriber.
pub struct AlertService {
    pool: SqlitePool,
    queues: DashMap<String, Arc<AlertQueue>>,
    events: Arc<EventService>,
}

impl AlertService {
    pub fn new(pool: SqlitePool, events: Arc<EventService>) -> Self {
        Self { pool, queues: DashMap::new(), events }
    }

    /// Registers the named subscriber. Returns true when the registration is
    /// new.
    pub async fn register_alert_system(&self, name: &str) -> CoreResult<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO alert_systems (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;

        self.queues.entry(name.to_string()).or_insert_with(|| Arc::new(AlertQueue::new()));

        let registered = result.rows_affected() > 0;
        if registered {
            tracing::info!("registered alert system {}", name);
            self.events
                .fire_event(EVENT_ALERT_SYSTEM_REGISTERED, serde_json::json!(name))
                .await;
        }

        Ok(registered)
    }

    pub async fn unregister_alert_system(&self, name: &str) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM alert_systems WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;

        self.queues.remove(name);

        let unregistered = result.rows_affected() > 0;
        if unregistered {
            tracing::info!("unregistered alert system {}", name);
            self.events
                .fire_event(EVENT_ALERT_SYSTEM_UNREGISTERED, serde_json::json!(name))
                .await;
        }

        Ok(unregistered)
    }

    async fn registered_names(&self) -> CoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM alert_systems ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn is_registered(&self, name: &str) -> CoreResult<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT name FROM alert_systems WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    fn queue(&self, name: &str) -> Arc<AlertQueue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AlertQueue::new()))
            .clone()
    }

    /// Pushes the root uuid to every registered subscriber. Returns true if
    /// at least one subscriber received it.
    pub async fn submit_alert(&self, root_uuid: &str) -> CoreResult<bool> {
        let names = self.registered_names().await?;

        tracing::info!("submitting alert {}", root_uuid);
        for name in &names {
            let queue = self.queue(name);
            queue.items.lock().await.push_back(root_uuid.to_string());
            queue.notify.notify_one();
        }

        let delivered = !names.is_empty();
        if delivered {
            self.events.fire_event(EVENT_ALERT, serde_json::json!(root_uuid)).await;
        }

        Ok(delivered)
    }

    /// Drains the subscriber's queue. With a timeout the call waits up to
    /// that long for at least one alert to show up.
    pub async fn get_alerts(&self, name: &str, timeout: Option<Duration>) -> CoreResult<Vec<String>> {
        if !self.is_registered(name).await? {
            return Err(CoreError::UnknownAlertSystem(name.to_string()));
        }

        let queue = self.queue(name);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let drained: Vec<String> = queue.items.lock().await.drain(..).collect();
            if !drained.is_empty() {
                return Ok(drained);
            }

            let Some(deadline) = deadline else {
                return Ok(Vec::new());
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }

            if tokio::time::timeout(remaining, queue.notify.notified()).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    pub async fn get_alert_count(&self, name: &str) -> CoreResult<usize> {
        if !self.is_registered(name).await? {
            return Err(CoreError::UnknownAlertSystem(name.to_string()));
        }

        let queue = self.queue(name);
        let count = queue.items.lock().await.len();
        Ok(count)
    }
}
