//! Lease-based mutual exclusion shared by all replicas using the same
//! database.

use crate::services::error::StorageResult;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};

#[derive(Clone)]
pub struct LocksRepository {
    db: Arc<SqlitePool>,
}

impl LocksRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Take or renew the lease `name` for `owner`. Succeeds when the lock is
    /// free, expired, or already held by `owner`.
    pub async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let result = sqlx::query(
            "INSERT INTO distributed_locks (name, owner, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
             WHERE distributed_locks.owner = excluded.owner
                OR distributed_locks.expires_at < ?",
        )
        .bind(name)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release(&self, name: &str, owner: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM distributed_locks WHERE name = ? AND owner = ?")
            .bind(name)
            .bind(owner)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn current_owner(&self, name: &str) -> StorageResult<Option<String>> {
        let owner = sqlx::query_scalar("SELECT owner FROM distributed_locks WHERE name = ?")
            .bind(name)
            .fetch_optional(&*self.db)
            .await?;
        Ok(owner)
    }
}
