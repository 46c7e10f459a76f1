//! The operation set shared by every storage location.
//!
//! Each location implements [`DataManager`]; [`Location`] is the closed set
//! of locations the service knows about. Operations a backend cannot perform
//! fail with [`StorageError::NotSupported`] through the default methods.

use crate::{
    models::{
        DatasetMetaData, FileMetaData, LinkType, LocationId, PathsPage, ProjectId, UploadLinks,
        UploadedPart, UserId,
    },
    services::{
        datcore_dsm::DatCoreDataManager,
        error::{StorageError, StorageResult},
        simcore_s3_dsm::SimcoreS3DataManager,
    },
};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait DataManager: Send + Sync {
    fn location_id(&self) -> LocationId;

    fn location_name(&self) -> &'static str;

    async fn authorized(&self, user_id: UserId) -> StorageResult<bool>;

    async fn list_datasets(&self, user_id: UserId) -> StorageResult<Vec<DatasetMetaData>>;

    async fn list_files_in_dataset(
        &self,
        user_id: UserId,
        dataset_id: &str,
        expand_dirs: bool,
    ) -> StorageResult<Vec<FileMetaData>>;

    /// Files visible to `user_id`. With `expand_dirs`, directory rows are
    /// replaced by the objects they contain (capped).
    async fn list_files(
        &self,
        user_id: UserId,
        expand_dirs: bool,
        uuid_filter: &str,
        project_id: Option<ProjectId>,
    ) -> StorageResult<Vec<FileMetaData>>;

    async fn get_file(&self, user_id: UserId, file_id: &str) -> StorageResult<FileMetaData>;

    async fn create_file_download_link(
        &self,
        user_id: UserId,
        file_id: &str,
        link_type: LinkType,
    ) -> StorageResult<String>;

    async fn delete_file(&self, user_id: UserId, file_id: &str) -> StorageResult<()>;

    async fn list_paths(
        &self,
        _user_id: UserId,
        _file_filter: Option<&str>,
        _cursor: Option<&str>,
        _limit: usize,
    ) -> StorageResult<PathsPage> {
        Err(self.not_supported("list_paths"))
    }

    async fn compute_path_size(&self, _user_id: UserId, _path: &str) -> StorageResult<u64> {
        Err(self.not_supported("compute_path_size"))
    }

    async fn create_file_upload_links(
        &self,
        _user_id: UserId,
        _file_id: &str,
        _link_type: LinkType,
        _file_size: u64,
        _is_directory: bool,
        _sha256_checksum: Option<String>,
    ) -> StorageResult<UploadLinks> {
        Err(self.not_supported("create_file_upload_links"))
    }

    async fn complete_file_upload(
        &self,
        _file_id: &str,
        _user_id: UserId,
        _parts: &[UploadedPart],
    ) -> StorageResult<FileMetaData> {
        Err(self.not_supported("complete_file_upload"))
    }

    async fn abort_file_upload(&self, _user_id: UserId, _file_id: &str) -> StorageResult<()> {
        Err(self.not_supported("abort_file_upload"))
    }

    fn not_supported(&self, operation: &'static str) -> StorageError {
        StorageError::NotSupported {
            location: self.location_name(),
            operation,
        }
    }
}

/// A constructed storage location.
#[derive(Clone)]
pub enum Location {
    SimcoreS3(Arc<SimcoreS3DataManager>),
    DatCore(Arc<DatCoreDataManager>),
}

impl Location {
    pub fn manager(&self) -> &dyn DataManager {
        match self {
            Location::SimcoreS3(dsm) => dsm.as_ref(),
            Location::DatCore(dsm) => dsm.as_ref(),
        }
    }

    pub fn location_id(&self) -> LocationId {
        self.manager().location_id()
    }

    pub fn location_name(&self) -> &'static str {
        self.manager().location_name()
    }

    /// The simcore manager, for the operations only it implements.
    pub fn as_simcore(&self) -> StorageResult<&Arc<SimcoreS3DataManager>> {
        match self {
            Location::SimcoreS3(dsm) => Ok(dsm),
            other => Err(StorageError::NotSupported {
                location: other.location_name(),
                operation: "simcore-only operation",
            }),
        }
    }
}
