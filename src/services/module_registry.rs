use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;

use crate::models::AnalysisModuleType;
use crate::services::cache_service::CacheService;
use crate::services::event_service::{
    EventService, EVENT_AMT_DELETED, EVENT_AMT_MODIFIED, EVENT_AMT_NEW,
};
use crate::services::request_tracking::RequestTrackingService;
use crate::services::work_queue_service::WorkQueueService;
use crate::utils::{CoreError, CoreResult};

/// Registration of analysis module types: dependency validation, circular
/// dependency detection, and the bookkeeping tied to a type's lifecycle
/// (work queue creation, request tracking and cache purges on deletion).
#[derive(Clone)]
pub struct ModuleRegistryService {
    pool: SqlitePool,
    work_queues: Arc<WorkQueueService>,
    request_tracking: Arc<RequestTrackingService>,
    cache: Arc<CacheService>,
    events: Arc<EventService>,
}

impl ModuleRegistryService {
    pub fn new(
        pool: SqlitePool,
        work_queues: Arc<WorkQueueService>,
        request_tracking: Arc<RequestTrackingService>,
        cache: Arc<CacheService>,
        events: Arc<EventService>,
    ) -> Self {
        Self { pool, work_queues, request_tracking, cache, events }
    }

    /// Registers (or re-registers) the module type. Every dependency must
    /// already be registered and no dependency chain may loop back to this
    /// type. A first registration creates the module's work queue.
    pub async fn register_analysis_module_type(&self, amt: &AnalysisModuleType) -> CoreResult<()> {
        for dependency in &amt.dependencies {
            if self.get_analysis_module_type(dependency).await?.is_none() {
                tracing::error!(
                    "registration of {} failed: dependency on unknown type {}",
                    amt.name,
                    dependency
                );
                return Err(CoreError::InvalidModuleDependency(amt.name.clone(), dependency.clone()));
            }
        }

        self.check_circular_dependencies(amt).await?;

        let current = self.get_analysis_module_type(&amt.name).await?;
        let json_data = serde_json::to_string(amt)?;

        sqlx::query(
            r#"
            INSERT INTO analysis_module_tracking (name, json_data) VALUES (?, ?)
            ON CONFLICT (name) DO UPDATE SET json_data = excluded.json_data
            "#,
        )
        .bind(&amt.name)
        .bind(&json_data)
        .execute(&self.pool)
        .await?;

        match current {
            None => {
                self.work_queues.add_work_queue(&amt.name).await;
                tracing::info!("registered analysis module type {}", amt);
                self.events.fire_event(EVENT_AMT_NEW, serde_json::json!(amt.name)).await;
            },
            Some(existing) => {
                if !existing.extended_version_matches(amt) {
                    tracing::info!("updated analysis module type {}", amt);
                    self.events.fire_event(EVENT_AMT_MODIFIED, serde_json::json!(amt.name)).await;
                }
            },
        }

        Ok(())
    }

    /// Depth-first walk of the dependency graph refusing any path that
    /// arrives back at the type being registered.
    async fn check_circular_dependencies(&self, amt: &AnalysisModuleType) -> CoreResult<()> {
        // (type to expand, chain of names that led to it)
        let mut pending: Vec<(AnalysisModuleType, Vec<String>)> =
            vec![(amt.clone(), vec![amt.name.clone()])];

        while let Some((current, chain)) = pending.pop() {
            for dependency in &current.dependencies {
                if *dependency == amt.name {
                    let mut cycle = chain.clone();
                    cycle.push(dependency.clone());
                    return Err(CoreError::CircularDependency(cycle.join(" -> ")));
                }

                if let Some(dependency_amt) = self.get_analysis_module_type(dependency).await? {
                    let mut next_chain = chain.clone();
                    next_chain.push(dependency.clone());
                    pending.push((dependency_amt, next_chain));
                }
            }
        }

        Ok(())
    }

    pub async fn get_analysis_module_type(&self, name: &str) -> CoreResult<Option<AnalysisModuleType>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT json_data FROM analysis_module_tracking WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((json_data,)) => Ok(Some(serde_json::from_str(&json_data)?)),
            None => Ok(None),
        }
    }

    pub async fn get_all_analysis_module_types(&self) -> CoreResult<Vec<AnalysisModuleType>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT json_data FROM analysis_module_tracking ORDER BY name")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(json_data,)| serde_json::from_str(&json_data).map_err(CoreError::from))
            .collect()
    }

    /// Snapshot keyed by name, used by the acceptance predicate.
    pub async fn get_analysis_module_type_map(&self) -> CoreResult<HashMap<String, AnalysisModuleType>> {
        Ok(self
            .get_all_analysis_module_types()
            .await?
            .into_iter()
            .map(|amt| (amt.name.clone(), amt))
            .collect())
    }

    /// Unregisters the module type: its work queue (discarding queued
    /// requests), any tracked requests and any cached results go with it.
    pub async fn delete_analysis_module_type(&self, name: &str) -> CoreResult<bool> {
        if self.get_analysis_module_type(name).await?.is_none() {
            return Ok(false);
        }

        tracing::info!("deleting analysis module type {}", name);

        self.work_queues.delete_work_queue(name).await;

        sqlx::query("DELETE FROM analysis_module_tracking WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;

        self.request_tracking.clear_tracking_by_analysis_module_type(name).await?;
        self.cache.delete_cached_analysis_results_by_module_type(name).await?;

        self.events.fire_event(EVENT_AMT_DELETED, serde_json::json!(name)).await;
        Ok(true)
    }
}
