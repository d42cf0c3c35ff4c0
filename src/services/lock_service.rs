use chrono::{Duration, Utc};
use sqlx::SqlitePool;

/// Named locks over the relational store: `{id, owner, acquire_date,
/// expiration_date, count}`. Acquisition is non-blocking, reentrant by
/// owner, and self-expiring via `expiration_date` so a crashed holder never
/// wedges the system.
#[derive(Clone)]
pub struct LockService {
    pool: SqlitePool,
}

impl LockService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Attempts to acquire the lock for `owner`. Returns true on success,
    /// including reentrant acquisition by the current holder.
    pub async fn acquire(
        &self,
        lock_id: &str,
        owner: &str,
        lock_timeout: Duration,
    ) -> Result<bool, sqlx::Error> {
        let now = Utc::now();
        let expiration = now + lock_timeout;

        // reentrant case: the owner already holds the lock
        let reentrant = sqlx::query(
            "UPDATE locks SET count = count + 1, expiration_date = ? WHERE id = ? AND owner = ?",
        )
        .bind(expiration)
        .bind(lock_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if reentrant.rows_affected() > 0 {
            return Ok(true);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO locks (id, owner, acquire_date, expiration_date, count)
            VALUES (?, ?, ?, ?, 1)
            ON CONFLICT (id) DO UPDATE SET
                owner = excluded.owner,
                acquire_date = excluded.acquire_date,
                expiration_date = excluded.expiration_date,
                count = 1
            WHERE locks.owner IS NULL OR locks.expiration_date < ?
            "#,
        )
        .bind(lock_id)
        .bind(owner)
        .bind(now)
        .bind(expiration)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Releases one acquisition held by `owner`. The lock frees when the
    /// reentrancy count reaches zero. Returns false when the owner does not
    /// hold the lock.
    pub async fn release(&self, lock_id: &str, owner: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE locks SET count = count - 1 WHERE id = ? AND owner = ?")
            .bind(lock_id)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE locks SET owner = NULL, acquire_date = NULL, expiration_date = NULL, count = 0
            WHERE id = ? AND owner = ? AND count <= 0
            "#,
        )
        .bind(lock_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    /// Force-releases the lock regardless of ownership.
    pub async fn release_any(&self, lock_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE locks SET owner = NULL, acquire_date = NULL, expiration_date = NULL, count = 0
            WHERE id = ?
            "#,
        )
        .bind(lock_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn is_locked(&self, lock_id: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(Option<String>, Option<chrono::DateTime<Utc>>)> =
            sqlx::query_as("SELECT owner, expiration_date FROM locks WHERE id = ?")
                .bind(lock_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((Some(_), expiration)) => {
                Ok(expiration.map(|e| e > Utc::now()).unwrap_or(true))
            },
            _ => Ok(false),
        }
    }
}
