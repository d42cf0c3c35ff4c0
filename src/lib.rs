//! Analysis correlation engine core.
//!
//! A distributed orchestrator that drives the recursive analysis of a tree
//! of observables by pluggable analysis modules, merging their results into
//! a single evolving root document, deduplicating work through request
//! linking and a content-addressed result cache, and raising alerts when
//! detection points accumulate.

use std::path::PathBuf;
use std::sync::Arc;

use sqlx::SqlitePool;

pub mod config;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use models::{
    Analysis, AnalysisModuleType, AnalysisRequest, DetectionPoint, Observable, RequestStatus,
    RootAnalysis,
};
pub use services::{
    AlertService, AnalysisTrackingService, CacheService, ConfigService, EventService, LockService,
    ModuleRegistryService, ProcessingEngine, RequestTrackingService, StorageService,
    WorkQueueService,
};
pub use utils::{CoreError, CoreResult};

/// Application shared state. Rust's type system is the DI container: every
/// service is wrapped in an Arc and wired up once at startup.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub events: Arc<EventService>,
    pub config_service: Arc<ConfigService>,
    pub locks: LockService,
    pub storage: Arc<StorageService>,
    pub cache: Arc<CacheService>,
    pub work_queues: Arc<WorkQueueService>,
    pub request_tracking: Arc<RequestTrackingService>,
    pub analysis_tracking: Arc<AnalysisTrackingService>,
    pub registry: Arc<ModuleRegistryService>,
    pub alerts: Arc<AlertService>,
    pub engine: Arc<ProcessingEngine>,
}

impl AppState {
    /// Wires the full service graph over the given pool and storage root.
    pub fn initialize(pool: SqlitePool, storage_root: impl Into<PathBuf>) -> Self {
        let events = Arc::new(EventService::new());
        let config_service = Arc::new(ConfigService::new(pool.clone(), Arc::clone(&events)));
        let locks = LockService::new(pool.clone());
        let storage = Arc::new(StorageService::new(pool.clone(), storage_root, Arc::clone(&events)));
        let cache = Arc::new(CacheService::new(pool.clone(), Arc::clone(&events)));
        let work_queues = Arc::new(WorkQueueService::new(Arc::clone(&events)));
        let request_tracking = Arc::new(RequestTrackingService::new(
            pool.clone(),
            locks.clone(),
            Arc::clone(&events),
        ));
        let analysis_tracking = Arc::new(AnalysisTrackingService::new(
            pool.clone(),
            Arc::clone(&events),
            Arc::clone(&config_service),
            Arc::clone(&storage),
        ));
        let registry = Arc::new(ModuleRegistryService::new(
            pool.clone(),
            Arc::clone(&work_queues),
            Arc::clone(&request_tracking),
            Arc::clone(&cache),
            Arc::clone(&events),
        ));
        let alerts = Arc::new(AlertService::new(pool.clone(), Arc::clone(&events)));
        let engine = Arc::new(ProcessingEngine::new(
            Arc::clone(&analysis_tracking),
            Arc::clone(&request_tracking),
            Arc::clone(&registry),
            Arc::clone(&work_queues),
            Arc::clone(&cache),
            Arc::clone(&alerts),
            locks.clone(),
            Arc::clone(&events),
        ));

        Self {
            db: pool,
            events,
            config_service,
            locks,
            storage,
            cache,
            work_queues,
            request_tracking,
            analysis_tracking,
            registry,
            alerts,
            engine,
        }
    }

    /// Re-creates the in-process work queues for every registered module
    /// type; called at startup since queues do not survive a restart.
    pub async fn restore_work_queues(&self) -> CoreResult<()> {
        for amt in self.registry.get_all_analysis_module_types().await? {
            self.work_queues.add_work_queue(&amt.name).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
