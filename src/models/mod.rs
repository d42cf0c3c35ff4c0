pub mod analysis;
pub mod module_type;
pub mod observable;
pub mod request;
pub mod root;

pub use analysis::Analysis;
pub use module_type::AnalysisModuleType;
pub use observable::{DetectionPoint, Observable, ObservableKey};
pub use request::{generate_cache_key, AnalysisRequest, RequestStatus};
pub use root::RootAnalysis;
