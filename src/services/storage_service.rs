use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqlitePool};

use crate::services::event_service::{EventService, EVENT_STORAGE_DELETED, EVENT_STORAGE_NEW};
use crate::utils::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ContentMetadata {
    pub sha256: String,
    pub name: String,
    pub size: i64,
    pub location: String,
    pub insert_date: DateTime<Utc>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub custom: Option<String>,
}

/// Content-addressed blob store: one file per lowercase hex sha256 under the
/// storage root, with metadata and root back-references in the relational
/// store.
#[derive(Clone)]
pub struct StorageService {
    pool: SqlitePool,
    root: PathBuf,
    events: Arc<EventService>,
}

impl StorageService {
    pub fn new(pool: SqlitePool, root: impl Into<PathBuf>, events: Arc<EventService>) -> Self {
        Self { pool, root: root.into(), events }
    }

    fn content_path(&self, sha256: &str) -> PathBuf {
        // two-level fanout keeps directories small
        self.root.join(&sha256[..2]).join(sha256)
    }

    /// Stores the content and returns its lowercase hex sha256. Storing the
    /// same content twice refreshes the metadata.
    pub async fn store_content(
        &self,
        content: &[u8],
        name: &str,
        expiration_date: Option<DateTime<Utc>>,
        custom: Option<serde_json::Value>,
    ) -> CoreResult<String> {
        let sha256 = hex::encode(Sha256::digest(content));
        let path = self.content_path(&sha256);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;

        let custom = match custom {
            Some(value) => Some(serde_json::to_string(&value)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO storage_metadata (sha256, name, size, location, expiration_date, custom)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (sha256) DO UPDATE SET
                name = excluded.name,
                expiration_date = excluded.expiration_date,
                custom = excluded.custom
            "#,
        )
        .bind(&sha256)
        .bind(name)
        .bind(content.len() as i64)
        .bind(path.display().to_string())
        .bind(expiration_date)
        .bind(&custom)
        .execute(&self.pool)
        .await?;

        tracing::debug!("stored content {} ({} bytes)", sha256, content.len());
        self.events
            .fire_event(EVENT_STORAGE_NEW, serde_json::json!({ "sha256": sha256, "name": name }))
            .await;

        Ok(sha256)
    }

    pub async fn get_content_bytes(&self, sha256: &str) -> CoreResult<Vec<u8>> {
        let meta = self
            .get_content_meta(sha256)
            .await?
            .ok_or_else(|| CoreError::UnknownFile(sha256.to_string()))?;

        match tokio::fs::read(&meta.location).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::UnknownFile(sha256.to_string()))
            },
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_content_meta(&self, sha256: &str) -> CoreResult<Option<ContentMetadata>> {
        let meta: Option<ContentMetadata> =
            sqlx::query_as("SELECT * FROM storage_metadata WHERE sha256 = ?")
                .bind(sha256)
                .fetch_optional(&self.pool)
                .await?;
        Ok(meta)
    }

    /// Opens the stored content for buffered streaming reads.
    pub async fn iter_content(
        &self,
        sha256: &str,
    ) -> CoreResult<tokio::io::BufReader<tokio::fs::File>> {
        let meta = self
            .get_content_meta(sha256)
            .await?
            .ok_or_else(|| CoreError::UnknownFile(sha256.to_string()))?;

        match tokio::fs::File::open(&meta.location).await {
            Ok(file) => Ok(tokio::io::BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::UnknownFile(sha256.to_string()))
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Stores the file at `path` and returns its sha256.
    pub async fn save_file(
        &self,
        path: &str,
        expiration_date: Option<DateTime<Utc>>,
    ) -> CoreResult<String> {
        let content = tokio::fs::read(path).await?;
        let name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path)
            .to_string();
        self.store_content(&content, &name, expiration_date, None).await
    }

    /// Writes the stored content out to `path`.
    pub async fn load_file(&self, sha256: &str, path: &str) -> CoreResult<()> {
        let content = self.get_content_bytes(sha256).await?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Deletes the content and its metadata. Idempotent.
    pub async fn delete_content(&self, sha256: &str) -> CoreResult<bool> {
        let meta = self.get_content_meta(sha256).await?;
        let Some(meta) = meta else {
            return Ok(false);
        };

        match tokio::fs::remove_file(&meta.location).await {
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }

        sqlx::query("DELETE FROM storage_metadata WHERE sha256 = ?")
            .bind(sha256)
            .execute(&self.pool)
            .await?;

        self.events.fire_event(EVENT_STORAGE_DELETED, serde_json::json!(sha256)).await;
        Ok(true)
    }

    /// Records that the root references this content.
    pub async fn track_content_root(&self, sha256: &str, root_uuid: &str) -> CoreResult<()> {
        sqlx::query("INSERT OR IGNORE INTO storage_roots (sha256, root_uuid) VALUES (?, ?)")
            .bind(sha256)
            .bind(root_uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_content_roots(&self, sha256: &str) -> CoreResult<Vec<String>> {
        let roots: Vec<(String,)> =
            sqlx::query_as("SELECT root_uuid FROM storage_roots WHERE sha256 = ?")
                .bind(sha256)
                .fetch_all(&self.pool)
                .await?;
        Ok(roots.into_iter().map(|(uuid,)| uuid).collect())
    }

    /// True iff at least one root referencing this content still exists.
    pub async fn has_valid_root_reference(&self, sha256: &str) -> CoreResult<bool> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM storage_roots sr
            JOIN root_analysis_tracking rat ON rat.uuid = sr.root_uuid
            WHERE sr.sha256 = ?
            "#,
        )
        .bind(sha256)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 > 0)
    }

    pub async fn iter_expired_content(&self) -> CoreResult<Vec<ContentMetadata>> {
        let expired: Vec<ContentMetadata> = sqlx::query_as(
            "SELECT * FROM storage_metadata WHERE expiration_date IS NOT NULL AND expiration_date <= ?",
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;
        Ok(expired)
    }

    /// Deletes expired content whose referencing roots are all gone.
    /// Returns the number of blobs deleted.
    pub async fn delete_expired_content(&self) -> CoreResult<u64> {
        let mut deleted = 0;
        for meta in self.iter_expired_content().await? {
            if self.has_valid_root_reference(&meta.sha256).await? {
                continue;
            }

            if self.delete_content(&meta.sha256).await? {
                deleted += 1;
            }
        }

        if deleted > 0 {
            tracing::info!("deleted {} expired content blobs", deleted);
        }
        Ok(deleted)
    }
}
