use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::SqlitePool;

use crate::models::{generate_cache_key, AnalysisModuleType, AnalysisRequest, Observable};
use crate::services::event_service::{EventService, EVENT_CACHE_NEW};
use crate::utils::{CoreError, CoreResult};

/// Content-addressed cache of analysis results, keyed by
/// [`generate_cache_key`]. The whole request is stored so that the
/// `original_root`/`modified_root` delta can be replayed into other roots.
#[derive(Clone)]
pub struct CacheService {
    pool: SqlitePool,
    events: Arc<EventService>,
}

impl CacheService {
    pub fn new(pool: SqlitePool, events: Arc<EventService>) -> Self {
        Self { pool, events }
    }

    /// Caches the result request under its cache key with an expiration of
    /// `now + cache_ttl`. Returns the cache key, or None when the request is
    /// not cachable.
    pub async fn cache_analysis_result(&self, request: &AnalysisRequest) -> CoreResult<Option<String>> {
        let Some(cache_key) = request.cache_key.clone() else {
            return Ok(None);
        };

        let amt = request
            .module_type
            .as_ref()
            .ok_or_else(|| CoreError::Internal("cachable request without module type".to_string()))?;
        let cache_ttl = amt
            .cache_ttl
            .ok_or_else(|| CoreError::Internal("cachable request without cache ttl".to_string()))?;

        let expiration_date = Utc::now() + Duration::seconds(cache_ttl);
        let json_data = serde_json::to_string(request)?;

        sqlx::query(
            r#"
            INSERT INTO analysis_result_cache (cache_key, expiration_date, analysis_module_type, json_data)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (cache_key) DO UPDATE SET
                expiration_date = excluded.expiration_date,
                json_data = excluded.json_data
            "#,
        )
        .bind(&cache_key)
        .bind(expiration_date)
        .bind(&amt.name)
        .bind(&json_data)
        .execute(&self.pool)
        .await?;

        tracing::debug!("cached analysis result {} with key {} ttl {}", request.id, cache_key, cache_ttl);
        self.events
            .fire_event(EVENT_CACHE_NEW, serde_json::json!({ "cache_key": cache_key, "request_id": request.id }))
            .await;

        Ok(Some(cache_key))
    }

    /// Returns the cached result for (observable, module type) if present
    /// and unexpired.
    pub async fn get_cached_analysis_result(
        &self,
        observable: &Observable,
        amt: &AnalysisModuleType,
    ) -> CoreResult<Option<AnalysisRequest>> {
        let Some(cache_key) = generate_cache_key(observable, amt) else {
            return Ok(None);
        };

        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT json_data FROM analysis_result_cache
            WHERE cache_key = ? AND (expiration_date IS NULL OR expiration_date > ?)
            "#,
        )
        .bind(&cache_key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((json_data,)) => Ok(Some(serde_json::from_str(&json_data)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_expired_cached_analysis_results(&self) -> CoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM analysis_result_cache WHERE expiration_date IS NOT NULL AND expiration_date <= ?",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::debug!("deleted {} expired cached analysis results", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    /// Purges every cached result of the given module type; used when the
    /// type is deleted.
    pub async fn delete_cached_analysis_results_by_module_type(&self, module_name: &str) -> CoreResult<u64> {
        let result = sqlx::query("DELETE FROM analysis_result_cache WHERE analysis_module_type = ?")
            .bind(module_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Number of cached results, optionally restricted to one module type.
    pub async fn get_cache_size(&self, module_name: Option<&str>) -> CoreResult<i64> {
        let count: (i64,) = match module_name {
            Some(name) => {
                sqlx::query_as("SELECT COUNT(*) FROM analysis_result_cache WHERE analysis_module_type = ?")
                    .bind(name)
                    .fetch_one(&self.pool)
                    .await?
            },
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM analysis_result_cache")
                    .fetch_one(&self.pool)
                    .await?
            },
        };
        Ok(count.0)
    }
}
