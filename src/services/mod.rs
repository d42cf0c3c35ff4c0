pub mod alert_service;
pub mod analysis_tracking;
pub mod cache_service;
pub mod config_service;
pub mod event_service;
pub mod lock_service;
pub mod module_registry;
pub mod processing;
pub mod request_tracking;
pub mod storage_service;
pub mod work_queue_service;

pub use alert_service::AlertService;
pub use analysis_tracking::AnalysisTrackingService;
pub use cache_service::CacheService;
pub use config_service::{ConfigService, ConfigSetting, CONFIG_ANALYSIS_ENCRYPTION_ENABLED};
pub use event_service::{Event, EventHandler, EventService};
pub use lock_service::LockService;
pub use module_registry::ModuleRegistryService;
pub use processing::ProcessingEngine;
pub use request_tracking::RequestTrackingService;
pub use storage_service::{ContentMetadata, StorageService};
pub use work_queue_service::WorkQueueService;
