//! The `datcore` location: a read-mostly view over the user's datasets in the
//! external backend, reached through the datcore adapter with the user's own
//! credentials. Uploads are not supported here.

use crate::{
    config::StorageSettings,
    constants::{DATCORE_ID, DATCORE_STR, MAX_CONCURRENT_REST_CALLS},
    db::{DatCoreCredentials, TokensRepository},
    models::{DatasetMetaData, FileMetaData, LinkType, LocationId, ProjectId, UserId},
    services::{
        datcore_adapter::{DatCoreAdapterClient, DatCoreFile, PackageFile},
        dsm::DataManager,
        error::{StorageError, StorageResult},
    },
};
use async_trait::async_trait;
use futures::{StreamExt, stream};
use sqlx::SqlitePool;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info};

fn dataset_file_meta_data(user_id: UserId, file: DatCoreFile) -> FileMetaData {
    FileMetaData {
        file_id: file.package_id,
        location_id: DATCORE_ID,
        location_name: DATCORE_STR.to_string(),
        bucket_name: file.dataset_id,
        object_name: file.path,
        project_id: None,
        node_id: None,
        user_id,
        created_at: file.created_at,
        last_modified: file.last_modified_at,
        file_size: file.size,
        entity_tag: None,
        sha256_checksum: None,
        upload_id: None,
        upload_expires_at: None,
        is_soft_link: false,
        is_directory: false,
        project_name: None,
        node_name: None,
    }
}

fn package_file_meta_data(user_id: UserId, file: PackageFile) -> FileMetaData {
    FileMetaData {
        file_id: file.package_id.clone(),
        location_id: DATCORE_ID,
        location_name: DATCORE_STR.to_string(),
        bucket_name: String::new(),
        object_name: file.display_path,
        project_id: None,
        node_id: None,
        user_id,
        created_at: file.created_at,
        last_modified: file.updated_at,
        file_size: file.size,
        entity_tag: None,
        sha256_checksum: None,
        upload_id: None,
        upload_expires_at: None,
        is_soft_link: false,
        is_directory: false,
        project_name: None,
        node_name: None,
    }
}

pub struct DatCoreDataManager {
    client: Option<DatCoreAdapterClient>,
    tokens: TokensRepository,
}

impl DatCoreDataManager {
    pub fn new(db: Arc<SqlitePool>, settings: &StorageSettings) -> StorageResult<Self> {
        let client = settings
            .datcore_adapter_url
            .as_deref()
            .map(|url| DatCoreAdapterClient::new(url, settings.datcore_timeout))
            .transpose()?;
        Ok(Self {
            client,
            tokens: TokensRepository::new(db),
        })
    }

    fn client(&self) -> StorageResult<&DatCoreAdapterClient> {
        self.client
            .as_ref()
            .ok_or_else(|| StorageError::DatCoreAdapter("datcore adapter is not configured".into()))
    }

    async fn credentials(&self, user_id: UserId) -> StorageResult<DatCoreCredentials> {
        self.tokens
            .get_datcore_credentials(user_id)
            .await?
            .ok_or(StorageError::DatCoreCredentialsMissing { user_id })
    }

    pub async fn is_healthy(&self) -> bool {
        match &self.client {
            Some(client) => client.check_service_health().await,
            None => false,
        }
    }

    /// Download a datcore file into `dir`, returning the local path.
    pub async fn download_to(&self, user_id: UserId, file_id: &str, dir: &Path) -> StorageResult<PathBuf> {
        let credentials = self.credentials(user_id).await?;
        let client = self.client()?;
        let link = client.get_file_download_link(&credentials, file_id).await?;
        let path = client.download(&link, dir).await?;
        debug!(file_id, path = %path.display(), "datcore file downloaded");
        Ok(path)
    }
}

#[async_trait]
impl DataManager for DatCoreDataManager {
    fn location_id(&self) -> LocationId {
        DATCORE_ID
    }

    fn location_name(&self) -> &'static str {
        DATCORE_STR
    }

    async fn authorized(&self, user_id: UserId) -> StorageResult<bool> {
        let Some(credentials) = self.tokens.get_datcore_credentials(user_id).await? else {
            return Ok(false);
        };
        Ok(self.client()?.check_user_can_connect(&credentials).await)
    }

    async fn list_datasets(&self, user_id: UserId) -> StorageResult<Vec<DatasetMetaData>> {
        let credentials = self.credentials(user_id).await?;
        self.client()?.list_all_datasets(&credentials).await
    }

    async fn list_files_in_dataset(
        &self,
        user_id: UserId,
        dataset_id: &str,
        _expand_dirs: bool,
    ) -> StorageResult<Vec<FileMetaData>> {
        let credentials = self.credentials(user_id).await?;
        let files = self
            .client()?
            .list_dataset_files(&credentials, dataset_id)
            .await?;
        Ok(files
            .into_iter()
            .map(|file| dataset_file_meta_data(user_id, file))
            .collect())
    }

    /// Every file of every dataset. Datcore has no projects, so
    /// `project_id` does not narrow the result.
    async fn list_files(
        &self,
        user_id: UserId,
        _expand_dirs: bool,
        uuid_filter: &str,
        _project_id: Option<ProjectId>,
    ) -> StorageResult<Vec<FileMetaData>> {
        let credentials = self.credentials(user_id).await?;
        let client = self.client()?;
        let datasets = client.list_all_datasets(&credentials).await?;

        let listings: Vec<StorageResult<Vec<DatCoreFile>>> = stream::iter(datasets)
            .map(|dataset| {
                let credentials = &credentials;
                async move { client.list_dataset_files(credentials, &dataset.dataset_id).await }
            })
            .buffered(MAX_CONCURRENT_REST_CALLS)
            .collect()
            .await;

        let mut files = Vec::new();
        for listing in listings {
            files.extend(
                listing?
                    .into_iter()
                    .map(|file| dataset_file_meta_data(user_id, file))
                    .filter(|fmd| {
                        uuid_filter.is_empty()
                            || fmd.object_name.contains(uuid_filter)
                            || fmd.file_id.contains(uuid_filter)
                    }),
            );
        }
        info!(user_id, files = files.len(), "datcore files listed");
        Ok(files)
    }

    async fn get_file(&self, user_id: UserId, file_id: &str) -> StorageResult<FileMetaData> {
        let credentials = self.credentials(user_id).await?;
        self.client()?
            .get_package_files(&credentials, file_id)
            .await?
            .into_iter()
            .next()
            .map(|file| package_file_meta_data(user_id, file))
            .ok_or_else(|| StorageError::file_not_found(file_id))
    }

    async fn create_file_download_link(
        &self,
        user_id: UserId,
        file_id: &str,
        link_type: LinkType,
    ) -> StorageResult<String> {
        if link_type == LinkType::S3 {
            return Err(self.not_supported("s3 download links"));
        }
        let credentials = self.credentials(user_id).await?;
        self.client()?
            .get_file_download_link(&credentials, file_id)
            .await
    }

    async fn delete_file(&self, user_id: UserId, file_id: &str) -> StorageResult<()> {
        let credentials = self.credentials(user_id).await?;
        self.client()?.delete_file(&credentials, file_id).await?;
        info!(user_id, file_id, "datcore file deleted");
        Ok(())
    }
}
