use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Core error taxonomy. The `code()` strings form the wire contract and must
/// stay stable across releases.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("unknown alert system {0}")]
    UnknownAlertSystem(String),

    #[error("circular dependency: {0}")]
    CircularDependency(String),

    #[error("module {0} depends on unknown module {1}")]
    InvalidModuleDependency(String, String),

    #[error("unknown analysis module type {0}")]
    UnknownAnalysisModuleType(String),

    #[error("analysis module type {0} version mismatch: {1} != {2}")]
    AnalysisModuleTypeVersion(String, String, String),

    #[error("analysis module type {0} extended version mismatch")]
    AnalysisModuleTypeExtendedVersion(String),

    #[error("unknown analysis request {0}")]
    UnknownAnalysisRequest(String),

    #[error("expired analysis request {0}")]
    ExpiredAnalysisRequest(String),

    #[error("analysis request {0} is locked")]
    LockedAnalysisRequest(String),

    #[error("unknown observable {0}")]
    UnknownObservable(String),

    #[error("unknown root analysis {0}")]
    UnknownRootAnalysis(String),

    #[error("root analysis {0} already exists")]
    RootAnalysisExists(String),

    #[error("unknown file {0}")]
    UnknownFile(String),

    #[error("invalid work queue {0}")]
    InvalidWorkQueue(String),

    #[error("encryption settings are not available")]
    MissingEncryptionSettings,

    #[error("invalid password")]
    InvalidPassword,

    #[error("invalid api key")]
    InvalidApiKey,

    #[error("operation requires an admin api key")]
    InvalidAccess,

    #[error("api key name {0} already exists")]
    DuplicateApiKeyName(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Stable string code used in the `{code, details}` wire format.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::UnknownAlertSystem(_) => "unknown_ams",
            CoreError::CircularDependency(_) => "amt_circ_dependency",
            CoreError::InvalidModuleDependency(..) => "invalid_amt_dependency",
            CoreError::UnknownAnalysisModuleType(_) => "unknown_amt",
            CoreError::AnalysisModuleTypeVersion(..) => "amt_version",
            CoreError::AnalysisModuleTypeExtendedVersion(_) => "amt_extended_version",
            CoreError::UnknownAnalysisRequest(_) => "unknown_analysis_request",
            CoreError::ExpiredAnalysisRequest(_) => "expired_analysis_request",
            CoreError::LockedAnalysisRequest(_) => "locked_analysis_request",
            CoreError::UnknownObservable(_) => "unknown_observable",
            CoreError::UnknownRootAnalysis(_) => "unknown_root",
            CoreError::RootAnalysisExists(_) => "root_exists",
            CoreError::UnknownFile(_) => "unknown_file",
            CoreError::InvalidWorkQueue(_) => "invalid_work_queue",
            CoreError::MissingEncryptionSettings => "missing_encryption_settings",
            CoreError::InvalidPassword => "invalid_password",
            CoreError::InvalidApiKey => "invalid_api_key",
            CoreError::InvalidAccess => "invalid_access",
            CoreError::DuplicateApiKeyName(_) => "duplicate_apikey_name",
            CoreError::Database(_)
            | CoreError::Migrate(_)
            | CoreError::Io(_)
            | CoreError::Serde(_)
            | CoreError::Internal(_) => "internal_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            CoreError::UnknownAlertSystem(_)
            | CoreError::UnknownAnalysisModuleType(_)
            | CoreError::UnknownAnalysisRequest(_)
            | CoreError::UnknownObservable(_)
            | CoreError::UnknownRootAnalysis(_)
            | CoreError::UnknownFile(_)
            | CoreError::InvalidWorkQueue(_) => StatusCode::NOT_FOUND,
            CoreError::CircularDependency(_)
            | CoreError::InvalidModuleDependency(..)
            | CoreError::AnalysisModuleTypeVersion(..)
            | CoreError::AnalysisModuleTypeExtendedVersion(_)
            | CoreError::ExpiredAnalysisRequest(_)
            | CoreError::RootAnalysisExists(_)
            | CoreError::DuplicateApiKeyName(_) => StatusCode::BAD_REQUEST,
            CoreError::LockedAnalysisRequest(_) => StatusCode::CONFLICT,
            CoreError::InvalidApiKey | CoreError::InvalidPassword => StatusCode::UNAUTHORIZED,
            CoreError::InvalidAccess => StatusCode::FORBIDDEN,
            CoreError::MissingEncryptionSettings
            | CoreError::Database(_)
            | CoreError::Migrate(_)
            | CoreError::Io(_)
            | CoreError::Serde(_)
            | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    details: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }

        let body = ErrorBody { code: self.code(), details: self.to_string() };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_error_codes() {
        assert_eq!(CoreError::UnknownAlertSystem("x".into()).code(), "unknown_ams");
        assert_eq!(CoreError::CircularDependency("a -> b".into()).code(), "amt_circ_dependency");
        assert_eq!(
            CoreError::InvalidModuleDependency("a".into(), "b".into()).code(),
            "invalid_amt_dependency"
        );
        assert_eq!(CoreError::UnknownAnalysisModuleType("m".into()).code(), "unknown_amt");
        assert_eq!(
            CoreError::AnalysisModuleTypeVersion("m".into(), "1".into(), "2".into()).code(),
            "amt_version"
        );
        assert_eq!(
            CoreError::AnalysisModuleTypeExtendedVersion("m".into()).code(),
            "amt_extended_version"
        );
        assert_eq!(CoreError::UnknownAnalysisRequest("r".into()).code(), "unknown_analysis_request");
        assert_eq!(CoreError::ExpiredAnalysisRequest("r".into()).code(), "expired_analysis_request");
        assert_eq!(CoreError::LockedAnalysisRequest("r".into()).code(), "locked_analysis_request");
        assert_eq!(CoreError::UnknownObservable("o".into()).code(), "unknown_observable");
        assert_eq!(CoreError::UnknownRootAnalysis("u".into()).code(), "unknown_root");
        assert_eq!(CoreError::RootAnalysisExists("u".into()).code(), "root_exists");
        assert_eq!(CoreError::UnknownFile("f".into()).code(), "unknown_file");
        assert_eq!(CoreError::InvalidWorkQueue("q".into()).code(), "invalid_work_queue");
        assert_eq!(CoreError::MissingEncryptionSettings.code(), "missing_encryption_settings");
        assert_eq!(CoreError::InvalidPassword.code(), "invalid_password");
        assert_eq!(CoreError::InvalidApiKey.code(), "invalid_api_key");
        assert_eq!(CoreError::InvalidAccess.code(), "invalid_access");
        assert_eq!(CoreError::DuplicateApiKeyName("k".into()).code(), "duplicate_apikey_name");
    }
}
