use std::sync::{Arc, RwLock};

use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::RootAnalysis;
use crate::services::config_service::{ConfigService, CONFIG_ANALYSIS_ENCRYPTION_ENABLED};
use crate::services::event_service::{
    EventService, EVENT_ANALYSIS_DETAILS_DELETED, EVENT_ANALYSIS_DETAILS_MODIFIED,
    EVENT_ANALYSIS_DETAILS_NEW, EVENT_ANALYSIS_ROOT_DELETED, EVENT_ANALYSIS_ROOT_MODIFIED,
    EVENT_ANALYSIS_ROOT_NEW,
};
use crate::services::storage_service::StorageService;
use crate::utils::crypto::{decrypt_chunk, encrypt_chunk};
use crate::utils::{CoreError, CoreResult, EncryptionSettings};

/// Persists root documents with optimistic versioning, and analysis detail
/// blobs keyed by analysis uuid with cascade delete from their root.
///
/// Detail blobs are detached from the root document on save and fetched on
/// demand; a root returned by [`get_root_analysis`] carries no details.
/// When encryption is enabled the blobs are AES-256-CBC encrypted at rest.
///
/// [`get_root_analysis`]: AnalysisTrackingService::get_root_analysis
#[derive(Clone)]
pub struct AnalysisTrackingService {
    pool: SqlitePool,
    events: Arc<EventService>,
    config: Arc<ConfigService>,
    storage: Arc<StorageService>,
    encryption: Arc<RwLock<Option<EncryptionSettings>>>,
}

impl AnalysisTrackingService {
    pub fn new(
        pool: SqlitePool,
        events: Arc<EventService>,
        config: Arc<ConfigService>,
        storage: Arc<StorageService>,
    ) -> Self {
        Self { pool, events, config, storage, encryption: Arc::new(RwLock::new(None)) }
    }

    /// Installs the encryption settings (with the AES key loaded) so detail
    /// blobs can be encrypted at rest.
    pub fn set_encryption_settings(&self, settings: EncryptionSettings) {
        if let Ok(mut guard) = self.encryption.write() {
            *guard = Some(settings);
        }
    }

    fn aes_key(&self) -> Option<Vec<u8>> {
        self.encryption
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().and_then(|s| s.aes_key.clone()))
    }

    /// True when key material is loaded and `/core/analysis/encrypted` is
    /// set.
    pub async fn analysis_encryption_enabled(&self) -> CoreResult<bool> {
        if self.aes_key().is_none() {
            return Ok(false);
        }

        let value = self
            .config
            .get_config_value(CONFIG_ANALYSIS_ENCRYPTION_ENABLED, None, None)
            .await?;
        Ok(matches!(value, Some(Value::Bool(true))))
    }

    //
    // root tracking
    //

    /// Returns the tracked root, details unloaded.
    pub async fn get_root_analysis(&self, uuid: &str) -> CoreResult<Option<RootAnalysis>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT json_data FROM root_analysis_tracking WHERE uuid = ?")
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((json_data,)) => Ok(Some(serde_json::from_str(&json_data)?)),
            None => Ok(None),
        }
    }

    pub async fn root_analysis_exists(&self, uuid: &str) -> CoreResult<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT uuid FROM root_analysis_tracking WHERE uuid = ?")
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Inserts the root if it is not tracked yet, otherwise falls through to
    /// an optimistic update. Returns true when the root was persisted.
    pub async fn track_root_analysis(&self, root: &mut RootAnalysis) -> CoreResult<bool> {
        let details = Self::detach_details(root);

        let previous_version = root.version.clone();
        root.version = Some(Uuid::new_v4().to_string());
        let json_data = serde_json::to_string(&*root)?;

        let result = sqlx::query(
            r#"
            INSERT INTO root_analysis_tracking (uuid, version, json_data) VALUES (?, ?, ?)
            ON CONFLICT (uuid) DO NOTHING
            "#,
        )
        .bind(&root.uuid)
        .bind(root.version.as_deref())
        .bind(&json_data)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            self.store_details(&root.uuid, details).await?;
            self.track_file_observables(root).await?;
            tracing::debug!("tracking new root {}", root.uuid);
            self.events
                .fire_event(EVENT_ANALYSIS_ROOT_NEW, serde_json::json!(root.uuid))
                .await;
            return Ok(true);
        }

        root.version = previous_version;
        self.update_inner(root, details).await
    }

    /// Optimistic update: succeeds iff the stored version matches
    /// `root.version`, in which case a fresh version token is assigned.
    /// Returns false without modification on a version mismatch; the caller
    /// reloads, re-applies and retries.
    pub async fn update_root_analysis(&self, root: &mut RootAnalysis) -> CoreResult<bool> {
        let details = Self::detach_details(root);
        self.update_inner(root, details).await
    }

    async fn update_inner(
        &self,
        root: &mut RootAnalysis,
        details: Vec<(String, Value)>,
    ) -> CoreResult<bool> {
        let Some(previous_version) = root.version.clone() else {
            return Ok(false);
        };

        root.version = Some(Uuid::new_v4().to_string());
        let json_data = serde_json::to_string(&*root)?;

        let result = sqlx::query(
            "UPDATE root_analysis_tracking SET version = ?, json_data = ? WHERE uuid = ? AND version = ?",
        )
        .bind(root.version.as_deref())
        .bind(&json_data)
        .bind(&root.uuid)
        .bind(&previous_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            root.version = Some(previous_version);
            tracing::debug!("version mismatch updating root {}", root.uuid);
            return Ok(false);
        }

        self.store_details(&root.uuid, details).await?;
        self.track_file_observables(root).await?;
        self.events
            .fire_event(EVENT_ANALYSIS_ROOT_MODIFIED, serde_json::json!(root.uuid))
            .await;
        Ok(true)
    }

    /// Deletes the root; detail rows cascade with it.
    pub async fn delete_root_analysis(&self, uuid: &str) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM root_analysis_tracking WHERE uuid = ?")
            .bind(uuid)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            tracing::debug!("deleted root {}", uuid);
            self.events
                .fire_event(EVENT_ANALYSIS_ROOT_DELETED, serde_json::json!(uuid))
                .await;
        }

        Ok(deleted)
    }

    /// Pulls detail blobs out of the document before it is persisted; they
    /// are stored separately keyed by analysis uuid.
    fn detach_details(root: &mut RootAnalysis) -> Vec<(String, Value)> {
        let mut details = Vec::new();

        if let Some(value) = root.details.take() {
            details.push((root.uuid.clone(), value));
        }

        for observable in root.observable_store.values_mut() {
            for analysis in observable.analysis.values_mut() {
                if let Some(value) = analysis.details.take() {
                    details.push((analysis.uuid.clone(), value));
                }
            }
        }

        details
    }

    async fn store_details(&self, root_uuid: &str, details: Vec<(String, Value)>) -> CoreResult<()> {
        for (uuid, value) in details {
            self.track_analysis_details(root_uuid, &uuid, &value).await?;
        }
        Ok(())
    }

    /// Content observables keep their backing blobs alive; re-associate them
    /// on every save.
    async fn track_file_observables(&self, root: &RootAnalysis) -> CoreResult<()> {
        for observable in root.get_observables_by_type("file") {
            if self.storage.get_content_meta(&observable.value).await?.is_some() {
                self.storage.track_content_root(&observable.value, &root.uuid).await?;
            }
        }
        Ok(())
    }

    //
    // analysis details
    //

    pub async fn track_analysis_details(
        &self,
        root_uuid: &str,
        uuid: &str,
        value: &Value,
    ) -> CoreResult<bool> {
        let exists = self.analysis_details_exists(uuid).await?;
        let serialized = serde_json::to_vec(value)?;

        let content = if self.analysis_encryption_enabled().await? {
            let key = self.aes_key().ok_or(CoreError::MissingEncryptionSettings)?;
            encrypt_chunk(&key, &serialized)?
        } else {
            serialized
        };

        sqlx::query(
            r#"
            INSERT INTO analysis_details_tracking (uuid, root_uuid, content) VALUES (?, ?, ?)
            ON CONFLICT (uuid) DO UPDATE SET root_uuid = excluded.root_uuid, content = excluded.content
            "#,
        )
        .bind(uuid)
        .bind(root_uuid)
        .bind(&content)
        .execute(&self.pool)
        .await?;

        let event = if exists { EVENT_ANALYSIS_DETAILS_MODIFIED } else { EVENT_ANALYSIS_DETAILS_NEW };
        self.events.fire_event(event, serde_json::json!(uuid)).await;
        Ok(true)
    }

    pub async fn get_analysis_details(&self, uuid: &str) -> CoreResult<Option<Value>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT content FROM analysis_details_tracking WHERE uuid = ?")
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;

        let Some((content,)) = row else {
            return Ok(None);
        };

        let decoded = if self.analysis_encryption_enabled().await? {
            let key = self.aes_key().ok_or(CoreError::MissingEncryptionSettings)?;
            decrypt_chunk(&key, &content)?
        } else {
            content
        };

        Ok(Some(serde_json::from_slice(&decoded)?))
    }

    pub async fn delete_analysis_details(&self, uuid: &str) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM analysis_details_tracking WHERE uuid = ?")
            .bind(uuid)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            self.events
                .fire_event(EVENT_ANALYSIS_DETAILS_DELETED, serde_json::json!(uuid))
                .await;
        }

        Ok(deleted)
    }

    pub async fn analysis_details_exists(&self, uuid: &str) -> CoreResult<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT uuid FROM analysis_details_tracking WHERE uuid = ?")
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }
}
