use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::SqlitePool;

use crate::models::{
    generate_cache_key, AnalysisModuleType, AnalysisRequest, Observable, RequestStatus,
};
use crate::services::event_service::{EventService, EVENT_AR_DELETED, EVENT_AR_NEW};
use crate::services::lock_service::LockService;
use crate::utils::{CoreError, CoreResult};

/// How long the engine may hold a request lock before it self-expires.
const REQUEST_LOCK_TIMEOUT_SECONDS: i64 = 30;

fn request_lock_id(request_id: &str) -> String {
    format!("analysis_request:{}", request_id)
}

/// Tracks the lifecycle of analysis requests: by id, cache key, root and
/// module type, plus the linked-request table consumed during result
/// processing.
#[derive(Clone)]
pub struct RequestTrackingService {
    pool: SqlitePool,
    locks: LockService,
    events: Arc<EventService>,
}

impl RequestTrackingService {
    pub fn new(pool: SqlitePool, locks: LockService, events: Arc<EventService>) -> Self {
        Self { pool, locks, events }
    }

    /// Begins (or refreshes) tracking of the request. Typed requests whose
    /// module type is no longer registered are refused. A request that
    /// enters the analyzing state gets an expiration deadline of
    /// `now + module timeout`; leaving the state clears it.
    pub async fn track_analysis_request(&self, request: &AnalysisRequest) -> CoreResult<()> {
        if let Some(amt) = &request.module_type {
            let registered: Option<(String,)> =
                sqlx::query_as("SELECT name FROM analysis_module_tracking WHERE name = ?")
                    .bind(&amt.name)
                    .fetch_optional(&self.pool)
                    .await?;

            if registered.is_none() {
                return Err(CoreError::UnknownAnalysisModuleType(amt.name.clone()));
            }
        }

        let expiration_date = match (&request.module_type, request.status) {
            (Some(amt), RequestStatus::Analyzing) => Some(Utc::now() + Duration::seconds(amt.timeout)),
            _ => None,
        };

        let json_data = serde_json::to_string(request)?;

        sqlx::query(
            r#"
            INSERT INTO analysis_request_tracking
                (id, expiration_date, analysis_module_type, cache_key, root_uuid, json_data)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                expiration_date = excluded.expiration_date,
                analysis_module_type = excluded.analysis_module_type,
                cache_key = excluded.cache_key,
                root_uuid = excluded.root_uuid,
                json_data = excluded.json_data
            "#,
        )
        .bind(&request.id)
        .bind(expiration_date)
        .bind(request.module_type.as_ref().map(|amt| amt.name.clone()))
        .bind(&request.cache_key)
        .bind(&request.root.uuid)
        .bind(&json_data)
        .execute(&self.pool)
        .await?;

        tracing::debug!("tracking analysis request {}", request);
        self.events.fire_event(EVENT_AR_NEW, serde_json::json!(request.id)).await;
        Ok(())
    }

    /// Deletes the request. Linked-request rows cascade with it.
    pub async fn delete_analysis_request(&self, request_id: &str) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM analysis_request_tracking WHERE id = ?")
            .bind(request_id)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            self.locks.release_any(&request_lock_id(request_id)).await?;
            tracing::debug!("deleted analysis request {}", request_id);
            self.events.fire_event(EVENT_AR_DELETED, serde_json::json!(request_id)).await;
        }

        Ok(deleted)
    }

    pub async fn get_analysis_request_by_request_id(
        &self,
        request_id: &str,
    ) -> CoreResult<Option<AnalysisRequest>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT json_data FROM analysis_request_tracking WHERE id = ?")
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((json_data,)) => Ok(Some(serde_json::from_str(&json_data)?)),
            None => Ok(None),
        }
    }

    pub async fn get_analysis_request_by_cache_key(
        &self,
        cache_key: &str,
    ) -> CoreResult<Option<AnalysisRequest>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT json_data FROM analysis_request_tracking
            WHERE cache_key = ? ORDER BY insert_date DESC, id LIMIT 1
            "#,
        )
        .bind(cache_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((json_data,)) => Ok(Some(serde_json::from_str(&json_data)?)),
            None => Ok(None),
        }
    }

    /// Resolves the tracked in-flight request for (observable, module type).
    /// Always None for uncachable module types.
    pub async fn get_analysis_request_by_observable(
        &self,
        observable: &Observable,
        amt: &AnalysisModuleType,
    ) -> CoreResult<Option<AnalysisRequest>> {
        match generate_cache_key(observable, amt) {
            Some(cache_key) => self.get_analysis_request_by_cache_key(&cache_key).await,
            None => Ok(None),
        }
    }

    pub async fn get_analysis_requests_by_root(
        &self,
        root_uuid: &str,
    ) -> CoreResult<Vec<AnalysisRequest>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT json_data FROM analysis_request_tracking WHERE root_uuid = ? ORDER BY insert_date",
        )
        .bind(root_uuid)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(json_data,)| serde_json::from_str(&json_data).map_err(CoreError::from))
            .collect()
    }

    /// Deletes tracking for every request of the given module type.
    pub async fn clear_tracking_by_analysis_module_type(&self, module_name: &str) -> CoreResult<u64> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM analysis_request_tracking WHERE analysis_module_type = ?",
        )
        .bind(module_name)
        .fetch_all(&self.pool)
        .await?;

        let mut deleted = 0;
        for (id,) in ids {
            if self.delete_analysis_request(&id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Requests that were claimed but not completed within their module's
    /// timeout.
    pub async fn get_expired_analysis_requests(&self) -> CoreResult<Vec<AnalysisRequest>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT json_data FROM analysis_request_tracking
            WHERE expiration_date IS NOT NULL AND expiration_date <= ?
            ORDER BY insert_date
            "#,
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(json_data,)| serde_json::from_str(&json_data).map_err(CoreError::from))
            .collect()
    }

    //
    // request locks
    //

    /// Locks the request for engine processing. Non-blocking.
    pub async fn lock_analysis_request(&self, request_id: &str, owner: &str) -> CoreResult<bool> {
        Ok(self
            .locks
            .acquire(
                &request_lock_id(request_id),
                owner,
                Duration::seconds(REQUEST_LOCK_TIMEOUT_SECONDS),
            )
            .await?)
    }

    pub async fn unlock_analysis_request(&self, request_id: &str, owner: &str) -> CoreResult<bool> {
        Ok(self.locks.release(&request_lock_id(request_id), owner).await?)
    }

    /// Force-unlocks the request regardless of owner; used when a request is
    /// re-submitted.
    pub async fn force_unlock_analysis_request(&self, request_id: &str) -> CoreResult<()> {
        Ok(self.locks.release_any(&request_lock_id(request_id)).await?)
    }

    pub async fn is_locked(&self, request_id: &str) -> CoreResult<bool> {
        Ok(self.locks.is_locked(&request_lock_id(request_id)).await?)
    }

    //
    // linking
    //

    /// Records that when `source` resolves, `dest` is driven with the same
    /// result delta. Fails (returning false) when the source is currently
    /// locked or no longer tracked.
    pub async fn link_analysis_requests(&self, source_id: &str, dest_id: &str) -> CoreResult<bool> {
        if source_id == dest_id {
            return Ok(false);
        }

        if self.is_locked(source_id).await? {
            tracing::debug!("cannot link to locked analysis request {}", source_id);
            return Ok(false);
        }

        let tracked: Option<(String,)> =
            sqlx::query_as("SELECT id FROM analysis_request_tracking WHERE id = ?")
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?;

        if tracked.is_none() {
            tracing::debug!("cannot link to untracked analysis request {}", source_id);
            return Ok(false);
        }

        sqlx::query("INSERT OR IGNORE INTO analysis_request_links (source_id, dest_id) VALUES (?, ?)")
            .bind(source_id)
            .bind(dest_id)
            .execute(&self.pool)
            .await?;

        tracing::debug!("linked analysis request {} to {}", source_id, dest_id);
        Ok(true)
    }

    pub async fn get_linked_analysis_requests(
        &self,
        source_id: &str,
    ) -> CoreResult<Vec<AnalysisRequest>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT art.json_data
            FROM analysis_request_links arl
            JOIN analysis_request_tracking art ON art.id = arl.dest_id
            WHERE arl.source_id = ?
            ORDER BY art.insert_date
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(json_data,)| serde_json::from_str(&json_data).map_err(CoreError::from))
            .collect()
    }
}
