use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::utils::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ApiKey {
    pub name: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub is_admin: bool,
    pub insert_date: DateTime<Utc>,
}

/// Creates a new api key and returns its secret value.
pub async fn create_api_key(pool: &SqlitePool, name: &str, is_admin: bool) -> CoreResult<String> {
    let existing: Option<(String,)> = sqlx::query_as("SELECT name FROM api_keys WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;

    if existing.is_some() {
        return Err(CoreError::DuplicateApiKeyName(name.to_string()));
    }

    let api_key = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO api_keys (name, api_key, is_admin) VALUES (?, ?, ?)")
        .bind(name)
        .bind(&api_key)
        .bind(is_admin)
        .execute(pool)
        .await?;

    tracing::info!("created api key {} (admin: {})", name, is_admin);
    Ok(api_key)
}

pub async fn delete_api_key(pool: &SqlitePool, name: &str) -> CoreResult<bool> {
    let result = sqlx::query("DELETE FROM api_keys WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn list_api_keys(pool: &SqlitePool) -> CoreResult<Vec<ApiKey>> {
    let keys: Vec<ApiKey> = sqlx::query_as("SELECT * FROM api_keys ORDER BY name")
        .fetch_all(pool)
        .await?;
    Ok(keys)
}

/// Validates the api key, optionally requiring admin access.
pub async fn verify_api_key(pool: &SqlitePool, api_key: &str, admin_required: bool) -> CoreResult<ApiKey> {
    let key: Option<ApiKey> = sqlx::query_as("SELECT * FROM api_keys WHERE api_key = ?")
        .bind(api_key)
        .fetch_optional(pool)
        .await?;

    let key = key.ok_or(CoreError::InvalidApiKey)?;
    if admin_required && !key.is_admin {
        return Err(CoreError::InvalidAccess);
    }

    Ok(key)
}
