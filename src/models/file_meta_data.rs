//! Represents one logical file (or directory) in the storage catalog.

use crate::{
    constants::{SIMCORE_S3_ID, SIMCORE_S3_STR, UNDEFINED_SIZE},
    models::{LocationId, NodeId, ProjectId, StorageFileId, UserId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A catalog row.
///
/// `upload_expires_at` is the pivot of the upload lifecycle: a row carrying
/// one is a pending upload and must not be served as a complete file until it
/// has been finalised or reconciled against the object store.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileMetaData {
    /// Logical identifier, also the object key for current writes.
    pub file_id: String,

    /// Backend owning the object.
    pub location_id: LocationId,
    pub location_name: String,

    /// Physical coordinates in the object store.
    pub bucket_name: String,
    pub object_name: String,

    /// Set for workbench files, `None` for API uploads and exports.
    pub project_id: Option<ProjectId>,
    pub node_id: Option<NodeId>,

    /// Creator of the file.
    pub user_id: UserId,

    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,

    /// Size in bytes, `-1` while unknown.
    pub file_size: i64,

    pub entity_tag: Option<String>,
    pub sha256_checksum: Option<String>,

    /// Managed multipart upload id, or the external sentinel.
    pub upload_id: Option<String>,

    /// Non-null while an upload is pending.
    pub upload_expires_at: Option<DateTime<Utc>>,

    pub is_soft_link: bool,
    pub is_directory: bool,

    /// Display names, filled in by listings from the project table.
    #[sqlx(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,

    #[sqlx(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl FileMetaData {
    /// Build a fresh pending row for an upload to the simcore bucket.
    pub fn new_pending(
        file_id: &StorageFileId,
        bucket_name: &str,
        user_id: UserId,
        sha256_checksum: Option<String>,
        is_directory: bool,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            file_id: file_id.to_string(),
            location_id: SIMCORE_S3_ID,
            location_name: SIMCORE_S3_STR.to_string(),
            bucket_name: bucket_name.to_string(),
            object_name: file_id.to_string(),
            project_id: file_id.project_id(),
            node_id: file_id.node_id(),
            user_id,
            created_at: now,
            last_modified: now,
            file_size: UNDEFINED_SIZE,
            entity_tag: None,
            sha256_checksum,
            upload_id: None,
            upload_expires_at: Some(expires_at),
            is_soft_link: false,
            is_directory,
            project_name: None,
            node_name: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.upload_expires_at.is_some()
    }

    pub fn storage_file_id(&self) -> Result<StorageFileId, crate::services::error::StorageError> {
        StorageFileId::parse(&self.file_id)
    }

    /// Last path segment of the identifier.
    pub fn display_name(&self) -> &str {
        self.file_id.rsplit('/').next().unwrap_or(&self.file_id)
    }
}
