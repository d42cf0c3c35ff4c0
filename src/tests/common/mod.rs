// Common test utilities and helpers

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::models::{Analysis, AnalysisModuleType, AnalysisRequest, RootAnalysis};
use crate::services::{Event, EventHandler};
use crate::utils::CoreResult;
use crate::AppState;

/// Create an in-memory SQLite database for testing.
pub async fn create_test_db() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("Failed to parse sqlite url")
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(3))
        .connect_with(options)
        .await
        .expect("Failed to create test database");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Full service graph over an in-memory database and a temporary storage
/// directory.
pub struct TestContext {
    pub state: AppState,
    _storage_dir: tempfile::TempDir,
}

pub async fn create_test_context() -> TestContext {
    let pool = create_test_db().await;
    let storage_dir = tempfile::tempdir().expect("Failed to create storage directory");
    let state = AppState::initialize(pool, storage_dir.path());
    TestContext { state, _storage_dir: storage_dir }
}

/// A module type accepting `test` observables.
pub fn test_amt(name: &str) -> AnalysisModuleType {
    let mut amt = AnalysisModuleType::new(name);
    amt.observable_types = vec!["test".to_string()];
    amt
}

/// Same, with caching enabled.
pub fn cachable_amt(name: &str) -> AnalysisModuleType {
    let mut amt = test_amt(name);
    amt.cache_ttl = Some(600);
    amt
}

impl TestContext {
    pub async fn register(&self, amt: &AnalysisModuleType) {
        self.state
            .registry
            .register_analysis_module_type(amt)
            .await
            .expect("Failed to register module type");
    }

    pub async fn submit_root(&self, root: RootAnalysis) {
        self.state
            .engine
            .submit_analysis_request(AnalysisRequest::root_request(root))
            .await
            .expect("Root submission failed");
    }

    pub async fn claim_work(&self, owner: &str, amt: &AnalysisModuleType) -> Option<AnalysisRequest> {
        self.state
            .engine
            .get_next_analysis_request(owner, amt, Duration::ZERO)
            .await
            .expect("Failed to claim work")
    }

    /// Fills the claimed request in as a result carrying an analysis with
    /// the given details (and any child observables) and processes it.
    pub async fn complete_request(
        &self,
        mut request: AnalysisRequest,
        amt: &AnalysisModuleType,
        details: Value,
        children: &[(&str, &str)],
    ) -> CoreResult<()> {
        request.initialize_result();
        let observable_uuid = request
            .modified_observable_uuid()
            .expect("Request has no observable in its modified root");

        {
            let modified_root = request
                .modified_root
                .as_mut()
                .expect("Result was not initialized");
            modified_root
                .add_analysis(&observable_uuid, Analysis::new(amt.clone()).with_details(details))
                .expect("Failed to add analysis");

            for (child_type, child_value) in children {
                modified_root
                    .add_analysis_observable(&observable_uuid, &amt.name, *child_type, *child_value, None)
                    .expect("Failed to add child observable");
            }
        }

        self.state.engine.process_analysis_request(request).await
    }

    pub async fn get_root(&self, uuid: &str) -> Option<RootAnalysis> {
        self.state
            .analysis_tracking
            .get_root_analysis(uuid)
            .await
            .expect("Failed to load root")
    }

    pub async fn queue_size(&self, amt: &AnalysisModuleType) -> usize {
        self.state
            .work_queues
            .get_queue_size(&amt.name)
            .await
            .expect("Failed to read queue size")
    }

    /// The stored details of the analysis by `module_name` on the
    /// observable with the given value.
    pub async fn analysis_details(
        &self,
        root_uuid: &str,
        observable_value: &str,
        module_name: &str,
    ) -> Option<Value> {
        let root = self.get_root(root_uuid).await?;
        let observable = root.all_observables().find(|o| o.value == observable_value)?;
        let analysis = observable.get_analysis(module_name)?;
        self.state
            .analysis_tracking
            .get_analysis_details(&analysis.uuid)
            .await
            .expect("Failed to load analysis details")
    }
}

/// Event handler that records every event it sees.
#[derive(Default)]
pub struct CollectingHandler {
    pub events: Mutex<Vec<Event>>,
}

#[async_trait]
impl EventHandler for CollectingHandler {
    async fn handle_event(&self, event: &Event) -> anyhow::Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

impl CollectingHandler {
    pub fn subscribe() -> Arc<CollectingHandler> {
        Arc::new(CollectingHandler::default())
    }

    pub async fn count(&self, name: &str) -> usize {
        self.events.lock().await.iter().filter(|e| e.name == name).count()
    }
}
