use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::services::event_service::{EventService, EVENT_CONFIG_DELETE, EVENT_CONFIG_SET};
use crate::utils::{CoreError, CoreResult};

/// Config key enabling analysis detail encryption at rest.
pub const CONFIG_ANALYSIS_ENCRYPTION_ENABLED: &str = "/core/analysis/encrypted";

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSetting {
    pub key: String,
    pub value: Option<Value>,
    pub documentation: Option<String>,
}

/// Key -> value settings with optional documentation, persisted in the
/// relational store.
#[derive(Clone)]
pub struct ConfigService {
    pool: SqlitePool,
    events: Arc<EventService>,
}

impl ConfigService {
    pub fn new(pool: SqlitePool, events: Arc<EventService>) -> Self {
        Self { pool, events }
    }

    pub async fn get_config(&self, key: &str) -> CoreResult<Option<ConfigSetting>> {
        let row: Option<(String, Option<String>, Option<String>)> =
            sqlx::query_as("SELECT key, value, documentation FROM config_settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((key, value, documentation)) => {
                let value = match value {
                    Some(raw) => Some(serde_json::from_str(&raw)?),
                    None => None,
                };
                Ok(Some(ConfigSetting { key, value, documentation }))
            },
            None => Ok(None),
        }
    }

    /// Returns the setting value; when the setting is absent, falls back to
    /// the named environment variable (as a plain string), then the default.
    pub async fn get_config_value(
        &self,
        key: &str,
        default: Option<Value>,
        env: Option<&str>,
    ) -> CoreResult<Option<Value>> {
        if let Some(setting) = self.get_config(key).await? {
            if setting.value.is_some() {
                return Ok(setting.value);
            }
        }

        if let Some(env) = env {
            if let Ok(value) = std::env::var(env) {
                return Ok(Some(Value::String(value)));
            }
        }

        Ok(default)
    }

    /// Creates or updates the setting. A None value or documentation leaves
    /// that field unchanged on an existing setting; passing both as None is
    /// an error.
    pub async fn set_config(
        &self,
        key: &str,
        value: Option<Value>,
        documentation: Option<&str>,
    ) -> CoreResult<()> {
        if value.is_none() && documentation.is_none() {
            return Err(CoreError::Internal(
                "set_config requires a value or documentation".to_string(),
            ));
        }

        let serialized = match &value {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO config_settings (key, value, documentation) VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                value = COALESCE(excluded.value, config_settings.value),
                documentation = COALESCE(excluded.documentation, config_settings.documentation)
            "#,
        )
        .bind(key)
        .bind(&serialized)
        .bind(documentation)
        .execute(&self.pool)
        .await?;

        tracing::debug!("modified config key {}", key);
        self.events
            .fire_event(EVENT_CONFIG_SET, serde_json::json!({ "key": key, "value": value }))
            .await;
        Ok(())
    }

    pub async fn delete_config(&self, key: &str) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM config_settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            self.events.fire_event(EVENT_CONFIG_DELETE, serde_json::json!(key)).await;
        }

        Ok(deleted)
    }
}
