//! Background removal of uploads that were never completed.
//!
//! Every pass looks at the pending rows whose upload window closed, asks the
//! object store whether the bytes arrived anyway and either finalizes the row
//! or deletes it together with any multipart upload it still holds. Only the
//! replica holding the lease in `distributed_locks` runs a pass.

use crate::{
    config::StorageSettings,
    constants::{CLEANER_LOCK_NAME, CLEANER_MAX_CONCURRENCY},
    db::LocksRepository,
    models::FileMetaData,
    services::{
        error::StorageResult,
        simcore_s3_dsm::{Reconciliation, SimcoreS3DataManager},
    },
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanReport {
    /// Rows whose object turned out to exist.
    pub finalized: Vec<String>,
    /// Rows removed with their leftovers.
    pub removed: Vec<String>,
    /// Rows left for a later pass after a timeout or backend error.
    pub skipped: Vec<String>,
}

enum Outcome {
    Finalized(String),
    Removed(String),
    Skipped(String),
}

pub struct UploadCleaner {
    dsm: Arc<SimcoreS3DataManager>,
    locks: LocksRepository,
    owner: String,
    settings: StorageSettings,
}

impl UploadCleaner {
    pub fn new(dsm: Arc<SimcoreS3DataManager>, db: Arc<SqlitePool>) -> Self {
        let settings = dsm.settings().clone();
        Self {
            dsm,
            locks: LocksRepository::new(db),
            owner: Uuid::new_v4().to_string(),
            settings,
        }
    }

    /// One pass over the uploads that expired before `now`.
    pub async fn clean_expired_uploads(&self, now: DateTime<Utc>) -> StorageResult<CleanReport> {
        let expired = self.dsm.files().list_expired(now).await?;
        if expired.is_empty() {
            debug!("no expired uploads");
            return Ok(CleanReport::default());
        }
        info!(count = expired.len(), "cleaning expired uploads");

        let outcomes: Vec<Outcome> = stream::iter(expired)
            .map(|fmd| self.clean_one(fmd, now))
            .buffer_unordered(CLEANER_MAX_CONCURRENCY)
            .collect()
            .await;

        let mut report = CleanReport::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Finalized(id) => report.finalized.push(id),
                Outcome::Removed(id) => report.removed.push(id),
                Outcome::Skipped(id) => report.skipped.push(id),
            }
        }
        report.finalized.sort();
        report.removed.sort();
        report.skipped.sort();
        info!(
            finalized = report.finalized.len(),
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            "expired uploads cleaned"
        );
        Ok(report)
    }

    async fn clean_one(&self, fmd: FileMetaData, now: DateTime<Utc>) -> Outcome {
        let file_id = fmd.file_id.clone();
        let probe = timeout(
            self.settings.cleaner_probe_timeout,
            self.dsm.reconcile_from_storage(fmd, now),
        )
        .await;

        let fmd = match probe {
            Err(_) => {
                warn!(file_id, "object store probe timed out, keeping the row");
                return Outcome::Skipped(file_id);
            }
            Ok(Err(err)) => {
                warn!(file_id, error = %err, "object store probe failed, keeping the row");
                return Outcome::Skipped(file_id);
            }
            Ok(Ok(Reconciliation::Reconciled(_))) => {
                info!(file_id, "expired upload had completed, row finalized");
                return Outcome::Finalized(file_id);
            }
            Ok(Ok(Reconciliation::StillPending(fmd) | Reconciliation::Orphaned(fmd))) => fmd,
        };

        if let Err(err) = self.remove(&fmd).await {
            warn!(file_id, error = %err, "failed to remove expired upload");
            return Outcome::Skipped(file_id);
        }
        warn!(file_id, user_id = fmd.user_id, "expired upload removed");
        Outcome::Removed(file_id)
    }

    async fn remove(&self, fmd: &FileMetaData) -> StorageResult<()> {
        self.dsm.abort_managed_upload(fmd).await?;
        self.dsm.remove_file(&fmd.storage_file_id()?).await
    }

    /// Run passes every `cleaner_interval` until `shutdown` fires. A pass in
    /// flight is finished before returning; the lease is released on exit.
    pub async fn run(self, shutdown: CancellationToken) {
        let Some(interval) = self.settings.cleaner_interval else {
            info!("upload cleaner disabled");
            return;
        };
        info!(owner = %self.owner, ?interval, "upload cleaner started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(interval) => {}
            }
            self.run_pass().await;
        }

        if let Err(err) = self.locks.release(CLEANER_LOCK_NAME, &self.owner).await {
            warn!(error = %err, "could not release the cleaner lease");
        }
        info!("upload cleaner stopped");
    }

    /// One leased pass; returns `None` when another replica holds the lease.
    pub async fn run_pass(&self) -> Option<CleanReport> {
        let now = Utc::now();
        match self
            .locks
            .try_acquire(CLEANER_LOCK_NAME, &self.owner, self.settings.cleaner_lease, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("cleaner lease held elsewhere, skipping pass");
                return None;
            }
            Err(err) => {
                warn!(error = %err, "could not acquire the cleaner lease");
                return None;
            }
        }

        match self.clean_expired_uploads(now).await {
            Ok(report) => Some(report),
            Err(err) => {
                error!(error = %err, "upload cleaner pass failed");
                None
            }
        }
    }
}
