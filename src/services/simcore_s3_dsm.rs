//! The `simcore.s3` location: a SQLite catalog over the objects of one bucket.
//!
//! Uploads go straight from the client to the object store through the links
//! handed out here; the catalog row tracks the upload until it is confirmed.
//! Confirmation happens either explicitly (`complete_file_upload`) or lazily:
//! every read path, abort and the cleaner funnel pending rows through
//! [`SimcoreS3DataManager::reconcile_from_storage`].

use crate::{
    config::StorageSettings,
    constants::{
        DATCORE_ID, MAX_CONCURRENT_S3_TASKS, MAX_OBJECT_BYTE_SIZE, MAX_PARALLEL_S3_CALLS,
        MAX_SINGLE_LINK_BYTE_SIZE, S3_UNDEFINED_OR_EXTERNAL_MULTIPART_ID, SIMCORE_S3_ID,
        SIMCORE_S3_STR, SYNC_PRUNE_CHUNK_SIZE, UNDEFINED_SIZE,
    },
    db::{AccessRightsRepository, FileMetaDataRepository, ListFilter, ProjectRow, ProjectsRepository},
    models::{
        AccessRights, DatasetMetaData, FileMetaData, LinkType, LocationId, NodeId, PathMetaData,
        PathsPage, ProjectId, StorageFileId, UploadLinks, UploadedPart, UserId,
        paths::PathCursor,
    },
    s3::{ListObjectsParams, ObjectMetadata, ObjectStore, ObjectStoreError, compute_s3_url},
    services::{
        datcore_dsm::DatCoreDataManager,
        dsm::DataManager,
        error::{StorageError, StorageResult},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of checking a catalog row against the object store.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// The row is finalized (possibly just now).
    Reconciled(FileMetaData),
    /// Nothing stored yet, but the upload window is still open.
    StillPending(FileMetaData),
    /// Nothing stored and the upload window has closed.
    Orphaned(FileMetaData),
}

impl Reconciliation {
    pub fn finalized(self) -> Option<FileMetaData> {
        match self {
            Reconciliation::Reconciled(fmd) => Some(fmd),
            Reconciliation::StillPending(_) | Reconciliation::Orphaned(_) => None,
        }
    }

    /// The row, or a not-found error when the object is not there yet.
    fn into_finalized(self) -> StorageResult<FileMetaData> {
        match self {
            Reconciliation::Reconciled(fmd) => Ok(fmd),
            Reconciliation::StillPending(fmd) | Reconciliation::Orphaned(fmd) => Err(
                ObjectStoreError::not_found(&fmd.bucket_name, &fmd.object_name).into(),
            ),
        }
    }
}

/// What a project deep copy produced.
#[derive(Serialize, Debug, Default, Clone, PartialEq)]
pub struct DeepCopyReport {
    pub copied: Vec<FileMetaData>,
    /// Datcore output path -> file id of its copy in simcore.s3.
    pub relinked_outputs: BTreeMap<String, String>,
}

enum CopyTask {
    Simcore {
        source: FileMetaData,
        destination: StorageFileId,
    },
    DatCore {
        source: String,
        node_id: NodeId,
    },
}

fn is_managed_multipart_upload(upload_id: Option<&str>) -> bool {
    matches!(upload_id, Some(id) if id != S3_UNDEFINED_OR_EXTERNAL_MULTIPART_ID)
}

/// Copy the object facts onto a row and mark it finalized.
fn apply_object_metadata(fmd: &mut FileMetaData, metadata: &ObjectMetadata) {
    fmd.file_size = metadata.size;
    if !fmd.is_directory {
        fmd.entity_tag = Some(metadata.e_tag.clone());
        fmd.last_modified = metadata.last_modified;
    }
    fmd.upload_expires_at = None;
    fmd.upload_id = None;
}

/// A synthetic row for an object living inside a directory row.
fn object_in_directory(directory: &FileMetaData, object: &ObjectMetadata) -> FileMetaData {
    FileMetaData {
        file_id: object.key.clone(),
        object_name: object.key.clone(),
        last_modified: object.last_modified,
        file_size: object.size,
        entity_tag: Some(object.e_tag.clone()),
        sha256_checksum: None,
        upload_id: None,
        upload_expires_at: None,
        is_soft_link: false,
        is_directory: false,
        ..directory.clone()
    }
}

/// First `depth` segments of `path`.
fn path_prefix(path: &str, depth: usize) -> String {
    path.split('/').take(depth).collect::<Vec<_>>().join("/")
}

pub struct SimcoreS3DataManager {
    files: FileMetaDataRepository,
    access: AccessRightsRepository,
    projects: ProjectsRepository,
    store: Arc<dyn ObjectStore>,
    settings: StorageSettings,
    datcore: Option<Arc<DatCoreDataManager>>,
}

impl SimcoreS3DataManager {
    pub fn new(db: Arc<SqlitePool>, store: Arc<dyn ObjectStore>, settings: StorageSettings) -> Self {
        Self {
            files: FileMetaDataRepository::new(db.clone()),
            access: AccessRightsRepository::new(db.clone()),
            projects: ProjectsRepository::new(db),
            store,
            settings,
            datcore: None,
        }
    }

    /// Enables copying datcore-hosted node outputs during deep copies.
    pub fn with_datcore(mut self, datcore: Arc<DatCoreDataManager>) -> Self {
        self.datcore = Some(datcore);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.settings.bucket
    }

    pub fn files(&self) -> &FileMetaDataRepository {
        &self.files
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    fn upload_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.settings.presigned_link_expiration)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn file_rights(&self, user_id: UserId, file_id: &StorageFileId) -> StorageResult<AccessRights> {
        self.access.get_file_access_rights(user_id, file_id).await
    }

    async fn require_project_right(
        &self,
        user_id: UserId,
        project_id: ProjectId,
        access_right: &'static str,
        granted: impl Fn(&AccessRights) -> bool,
    ) -> StorageResult<()> {
        let rights = self.access.get_project_access_rights(user_id, project_id).await?;
        if granted(&rights) {
            Ok(())
        } else {
            Err(StorageError::ProjectAccessRight {
                access_right,
                project_id: project_id.to_string(),
            })
        }
    }

    /// Check a row against the object store and finalize it when its object
    /// is there.
    ///
    /// Finalized rows are returned untouched (`Reconciled`), except directory
    /// rows whose size was invalidated: their size is recomputed, an empty
    /// directory counting as zero bytes. Errors other than a missing object
    /// are propagated.
    pub async fn reconcile_from_storage(
        &self,
        fmd: FileMetaData,
        now: DateTime<Utc>,
    ) -> StorageResult<Reconciliation> {
        if !fmd.is_pending() {
            if fmd.is_directory && fmd.file_size == UNDEFINED_SIZE {
                return self.refresh_directory_size(fmd).await.map(Reconciliation::Reconciled);
            }
            return Ok(Reconciliation::Reconciled(fmd));
        }

        match self.probe(&fmd).await {
            Ok(metadata) => {
                let mut fmd = fmd;
                apply_object_metadata(&mut fmd, &metadata);
                let fmd = self.files.upsert(&fmd).await?;
                debug!(file_id = %fmd.file_id, file_size = fmd.file_size, "upload reconciled");
                Ok(Reconciliation::Reconciled(fmd))
            }
            Err(err) if err.is_not_found() => {
                if fmd.upload_expires_at.is_some_and(|expires_at| expires_at > now) {
                    Ok(Reconciliation::StillPending(fmd))
                } else {
                    Ok(Reconciliation::Orphaned(fmd))
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn probe(&self, fmd: &FileMetaData) -> Result<ObjectMetadata, ObjectStoreError> {
        if fmd.is_directory {
            self.store
                .get_directory_metadata(&fmd.bucket_name, &format!("{}/", fmd.object_name))
                .await
        } else {
            self.store
                .get_object_metadata(&fmd.bucket_name, &fmd.object_name)
                .await
        }
    }

    async fn refresh_directory_size(&self, mut fmd: FileMetaData) -> StorageResult<FileMetaData> {
        fmd.file_size = match self.probe(&fmd).await {
            Ok(metadata) => metadata.size,
            Err(err) if err.is_not_found() => 0,
            Err(err) => return Err(err.into()),
        };
        self.files.upsert(&fmd).await
    }

    /// Abort the multipart upload a row is tracking, if it is one we manage.
    pub(crate) async fn abort_managed_upload(&self, fmd: &FileMetaData) -> StorageResult<()> {
        if let Some(upload_id) = fmd
            .upload_id
            .as_deref()
            .filter(|id| is_managed_multipart_upload(Some(id)))
        {
            debug!(file_id = %fmd.file_id, upload_id, "aborting multipart upload");
            self.store
                .abort_multipart_upload(&fmd.bucket_name, &fmd.file_id, upload_id)
                .await?;
        }
        Ok(())
    }

    async fn clean_pending_upload(&self, file_id: &StorageFileId) -> StorageResult<()> {
        if let Some(fmd) = self.files.try_get(file_id.as_str()).await? {
            self.abort_managed_upload(&fmd).await?;
        }
        Ok(())
    }

    /// The registered directory enclosing `file_id`, innermost first. With
    /// `include_self` a directory row for `file_id` itself also matches.
    async fn enclosing_directory(
        &self,
        file_id: &StorageFileId,
        include_self: bool,
    ) -> StorageResult<Option<FileMetaData>> {
        let mut candidates = Vec::new();
        if include_self {
            candidates.push(file_id.to_string());
        }
        candidates.extend(file_id.ancestors().into_iter().map(StorageFileId::into_string));
        Ok(self.files.find_directories(&candidates).await?.into_iter().next())
    }

    /// Delete a file's objects and row without checking access rights.
    ///
    /// Soft links own no bytes, so only their row goes. The objects of a
    /// regular file are removed even if soft links still point at them.
    pub(crate) async fn remove_file(&self, file_id: &StorageFileId) -> StorageResult<()> {
        let existing = self.files.try_get(file_id.as_str()).await?;
        if !existing.as_ref().is_some_and(|fmd| fmd.is_soft_link) {
            match self.store.delete_object(self.bucket(), file_id.as_str()).await {
                Err(err) if err.is_not_found() => {
                    warn!(file_id = %file_id, "object already missing from the store");
                }
                other => other?,
            }
            self.store
                .delete_objects_by_prefix(self.bucket(), &file_id.as_prefix())
                .await?;

            if let Some(fmd) = &existing {
                let links = self
                    .files
                    .count_links_to_object(&fmd.bucket_name, &fmd.object_name, &fmd.file_id)
                    .await?;
                if links > 0 {
                    warn!(
                        file_id = %file_id,
                        links,
                        "deleted object is still referenced by soft links"
                    );
                }
            }
        }

        let parent = self.enclosing_directory(file_id, false).await?;
        self.files
            .delete_and_invalidate_directory(
                file_id.as_str(),
                parent.as_ref().map(|dir| dir.file_id.as_str()),
            )
            .await?;
        debug!(file_id = %file_id, "file deleted");
        Ok(())
    }

    async fn link_for(&self, key: &str, link_type: LinkType) -> StorageResult<String> {
        match link_type {
            LinkType::Presigned => Ok(self
                .store
                .create_single_presigned_download_link(
                    self.bucket(),
                    key,
                    self.settings.presigned_link_expiration,
                )
                .await?),
            LinkType::S3 => Ok(compute_s3_url(self.bucket(), key)),
        }
    }

    /// Projects `user_id` may browse below `path`. A path starting with a
    /// project id restricts the scope to that project, which must be readable.
    async fn accessible_project_ids(
        &self,
        user_id: UserId,
        path: Option<&str>,
    ) -> StorageResult<Vec<ProjectId>> {
        let project_id = path
            .and_then(|p| p.split('/').next())
            .and_then(|segment| Uuid::parse_str(segment).ok());
        match project_id {
            Some(project_id) => {
                self.require_project_right(user_id, project_id, "read", |r| r.read)
                    .await?;
                Ok(vec![project_id])
            }
            None => self.access.list_readable_project_ids(user_id).await,
        }
    }

    /// Up to `limit` objects stored below a directory row.
    async fn expand_directory(
        &self,
        directory: &FileMetaData,
        limit: usize,
    ) -> StorageResult<Vec<FileMetaData>> {
        let objects = self
            .store
            .list_all_objects(
                &directory.bucket_name,
                &format!("{}/", directory.object_name),
                Some(limit),
            )
            .await?;
        Ok(objects
            .iter()
            .map(|object| object_in_directory(directory, object))
            .collect())
    }

    /// Fill in project and node names. Rows whose project or node cannot be
    /// named are dropped.
    async fn with_display_names(&self, data: Vec<FileMetaData>) -> StorageResult<Vec<FileMetaData>> {
        let projects = self
            .projects
            .get_many(data.iter().filter_map(|fmd| fmd.project_id).collect::<Vec<_>>())
            .await?;
        let labels: HashMap<ProjectId, HashMap<String, String>> = projects
            .iter()
            .map(|(id, project)| (*id, project.node_labels()))
            .collect();

        Ok(data
            .into_iter()
            .filter_map(|mut fmd| {
                let project_id = fmd.project_id?;
                let project = projects.get(&project_id)?;
                let node_name = labels.get(&project_id)?.get(&fmd.node_id?.to_string())?;
                fmd.project_name = Some(project.name.clone());
                fmd.node_name = Some(node_name.clone());
                Some(fmd)
            })
            .collect())
    }

    async fn fill_display_paths(&self, items: &mut [PathMetaData]) -> StorageResult<()> {
        let projects = self
            .projects
            .get_many(
                items
                    .iter()
                    .filter_map(|item| item.path.split('/').next())
                    .filter_map(|segment| Uuid::parse_str(segment).ok())
                    .collect::<Vec<_>>(),
            )
            .await?;
        let names: HashMap<ProjectId, (&ProjectRow, HashMap<String, String>)> = projects
            .iter()
            .map(|(id, project)| (*id, (project, project.node_labels())))
            .collect();

        for item in items.iter_mut() {
            let mut segments: Vec<String> = item.path.split('/').map(str::to_string).collect();
            let project = segments
                .first()
                .and_then(|segment| Uuid::parse_str(segment).ok())
                .and_then(|id| names.get(&id));
            if let Some((project, labels)) = project {
                segments[0] = project.name.clone();
                if let Some(label) = segments.get(1).and_then(|node| labels.get(node)) {
                    segments[1] = label.clone();
                }
            }
            item.display_path = segments.join("/");
        }
        Ok(())
    }

    async fn list_paths_in_catalog(
        &self,
        project_ids: Vec<ProjectId>,
        filter: Option<&str>,
        cursor: Option<(PathCursor, &str)>,
        limit: usize,
    ) -> StorageResult<PathsPage> {
        let offset = match cursor {
            None => 0,
            Some((PathCursor::Offset(offset), _)) => offset,
            Some((PathCursor::Continuation(_), raw)) => {
                return Err(StorageError::InvalidCursor(raw.to_string()));
            }
        };

        let rows = self
            .files
            .list_filtered(&ListFilter {
                project_ids: Some(project_ids),
                file_id_prefix: filter.map(|f| format!("{f}/")),
                ..ListFilter::default()
            })
            .await?;

        let depth = filter.map_or(0, |f| f.split('/').count()) + 1;
        let mut children: BTreeMap<String, Option<FileMetaData>> = BTreeMap::new();
        for row in rows {
            let child = path_prefix(&row.file_id, depth);
            let is_file = child == row.file_id && !row.is_directory;
            let entry = children.entry(child).or_insert(None);
            if is_file {
                *entry = Some(row);
            }
        }

        let total = i64::try_from(children.len()).unwrap_or(i64::MAX);
        let now = Utc::now();
        let mut items = Vec::new();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        for (path, fmd) in children.into_iter().skip(start).take(limit) {
            let file_meta_data = match fmd {
                Some(fmd) => match self.reconcile_from_storage(fmd, now).await?.finalized() {
                    Some(fmd) => Some(fmd),
                    None => continue,
                },
                None => None,
            };
            items.push(PathMetaData {
                display_path: path.clone(),
                path,
                location_id: SIMCORE_S3_ID,
                file_meta_data,
            });
        }

        let next = offset.saturating_add(i64::try_from(limit).unwrap_or(i64::MAX));
        Ok(PathsPage {
            items,
            next_cursor: (next < total).then(|| PathCursor::Offset(next).encode()),
            total: Some(total),
        })
    }

    async fn list_paths_in_directory(
        &self,
        directory: &FileMetaData,
        filter: &str,
        cursor: Option<(PathCursor, &str)>,
        limit: usize,
    ) -> StorageResult<PathsPage> {
        let continuation_token = match cursor {
            None => None,
            Some((PathCursor::Continuation(token), _)) => Some(token),
            Some((PathCursor::Offset(_), raw)) => {
                return Err(StorageError::InvalidCursor(raw.to_string()));
            }
        };
        let page = self
            .store
            .list_objects(
                &directory.bucket_name,
                ListObjectsParams {
                    prefix: format!("{filter}/"),
                    delimited: true,
                    continuation_token,
                    max_keys: limit,
                },
            )
            .await?;

        let mut items: Vec<PathMetaData> = page
            .common_prefixes
            .iter()
            .map(|prefix| {
                let path = prefix.trim_end_matches('/').to_string();
                PathMetaData {
                    display_path: path.clone(),
                    path,
                    location_id: SIMCORE_S3_ID,
                    file_meta_data: None,
                }
            })
            .chain(page.objects.iter().map(|object| PathMetaData {
                path: object.key.clone(),
                display_path: object.key.clone(),
                location_id: SIMCORE_S3_ID,
                file_meta_data: Some(object_in_directory(directory, object)),
            }))
            .collect();
        items.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(PathsPage {
            items,
            next_cursor: page
                .next_continuation_token
                .map(|token| PathCursor::Continuation(token).encode()),
            total: None,
        })
    }

    /// Rows owned by the user or readable through their projects.
    pub async fn search_owned_files(
        &self,
        user_id: UserId,
        file_id_prefix: Option<String>,
        sha256_checksum: Option<String>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> StorageResult<Vec<FileMetaData>> {
        let project_ids = self.access.list_readable_project_ids(user_id).await?;
        let rows = self
            .files
            .list_filtered(&ListFilter {
                user_id: Some(user_id),
                project_ids: Some(project_ids),
                file_id_prefix,
                sha256_checksum,
                is_directory: Some(false),
                limit,
                offset,
                ..ListFilter::default()
            })
            .await?;

        let now = Utc::now();
        let mut resolved = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(fmd) = self.reconcile_from_storage(row, now).await?.finalized() {
                resolved.push(fmd);
            }
        }
        Ok(resolved)
    }

    /// Register `link_file_id` as a second name for the bytes of
    /// `target_file_id`.
    pub async fn create_soft_link(
        &self,
        user_id: UserId,
        target_file_id: &str,
        link_file_id: &str,
    ) -> StorageResult<FileMetaData> {
        let link_id = StorageFileId::parse(link_file_id)?;
        if self.files.exists(link_id.as_str()).await? {
            return Err(StorageError::LinkAlreadyExists {
                file_id: link_id.into_string(),
            });
        }
        let target = self.get_file(user_id, target_file_id).await?;
        let link = FileMetaData {
            file_id: link_id.into_string(),
            is_soft_link: true,
            project_name: None,
            node_name: None,
            ..target
        };
        let link = self.files.insert(&link).await?;
        info!(target = target_file_id, link = %link.file_id, "soft link created");
        Ok(link)
    }

    /// Delete every file of a project, or of one of its nodes.
    ///
    /// Catalog rows go first, then the objects below the matching prefix.
    pub async fn delete_project(
        &self,
        user_id: UserId,
        project_id: ProjectId,
        node_id: Option<NodeId>,
    ) -> StorageResult<()> {
        self.require_project_right(user_id, project_id, "delete", |r| r.delete)
            .await?;

        let (deleted, prefix) = match node_id {
            Some(node_id) => (
                self.files.delete_all_for_node(project_id, node_id).await?,
                format!("{project_id}/{node_id}/"),
            ),
            None => (
                self.files.delete_all_for_project(project_id).await?,
                format!("{project_id}/"),
            ),
        };
        self.store.delete_objects_by_prefix(self.bucket(), &prefix).await?;
        info!(%project_id, ?node_id, deleted, "project data deleted");
        Ok(())
    }

    /// Copy the files of `src_project` into `dst_project`, renaming nodes
    /// through `node_mapping`. Datcore files referenced by the destination
    /// workbench are pulled into simcore.s3 as well.
    pub async fn deep_copy_project(
        &self,
        user_id: UserId,
        src_project: ProjectId,
        dst_project: ProjectId,
        node_mapping: &HashMap<NodeId, NodeId>,
    ) -> StorageResult<DeepCopyReport> {
        for project_id in [src_project, dst_project] {
            if !self.projects.exists(project_id).await? {
                return Err(StorageError::project_not_found(project_id));
            }
        }
        self.require_project_right(user_id, src_project, "read", |r| r.read)
            .await?;
        self.require_project_right(user_id, dst_project, "write", |r| r.write)
            .await?;

        let mut tasks = Vec::new();
        for source in self.files.list_for_project(src_project, None).await? {
            let Some(node_id) = source.node_id else {
                warn!(file_id = %source.file_id, "project file without node, not copied");
                continue;
            };
            if source.location_id != SIMCORE_S3_ID {
                warn!(file_id = %source.file_id, "file outside simcore.s3, not copied");
                continue;
            }
            let Some(new_node_id) = node_mapping.get(&node_id) else {
                continue;
            };
            let tail = source
                .object_name
                .splitn(3, '/')
                .nth(2)
                .unwrap_or(source.display_name())
                .to_string();
            let destination = StorageFileId::parse(&format!("{dst_project}/{new_node_id}/{tail}"))?;
            tasks.push(CopyTask::Simcore {
                source,
                destination,
            });
        }

        let destination = self
            .projects
            .get(dst_project)
            .await?
            .ok_or_else(|| StorageError::project_not_found(dst_project))?;
        for (node_id, path) in destination.outputs_in_location(DATCORE_ID) {
            match Uuid::parse_str(&node_id) {
                Ok(node_id) => tasks.push(CopyTask::DatCore {
                    source: path,
                    node_id,
                }),
                Err(_) => warn!(%dst_project, node_id, "workbench node id is not a uuid"),
            }
        }

        info!(%src_project, %dst_project, tasks = tasks.len(), "deep copying project");
        let results: Vec<StorageResult<(Option<String>, FileMetaData)>> = stream::iter(tasks)
            .map(|task| self.run_copy_task(user_id, dst_project, task))
            .buffer_unordered(MAX_CONCURRENT_S3_TASKS)
            .collect()
            .await;

        let mut report = DeepCopyReport::default();
        for result in results {
            let (relinked_from, fmd) = result?;
            if let Some(source) = relinked_from {
                report.relinked_outputs.insert(source, fmd.file_id.clone());
            }
            report.copied.push(fmd);
        }
        report.copied.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        Ok(report)
    }

    async fn run_copy_task(
        &self,
        user_id: UserId,
        dst_project: ProjectId,
        task: CopyTask,
    ) -> StorageResult<(Option<String>, FileMetaData)> {
        match task {
            CopyTask::Simcore {
                source,
                destination,
            } => self
                .copy_simcore_file(user_id, &source, &destination)
                .await
                .map(|fmd| (None, fmd)),
            CopyTask::DatCore { source, node_id } => {
                let fmd = self
                    .copy_datcore_file(user_id, &source, dst_project, node_id)
                    .await?;
                Ok((Some(source), fmd))
            }
        }
    }

    async fn register_copy_target(
        &self,
        user_id: UserId,
        destination: &StorageFileId,
        sha256_checksum: Option<String>,
        is_directory: bool,
    ) -> StorageResult<FileMetaData> {
        let now = Utc::now();
        let mut fmd = FileMetaData::new_pending(
            destination,
            self.bucket(),
            user_id,
            sha256_checksum,
            is_directory,
            now,
            self.upload_expiry(now),
        );
        fmd.upload_id = Some(S3_UNDEFINED_OR_EXTERNAL_MULTIPART_ID.to_string());
        self.files.upsert(&fmd).await
    }

    async fn copy_simcore_file(
        &self,
        user_id: UserId,
        source: &FileMetaData,
        destination: &StorageFileId,
    ) -> StorageResult<FileMetaData> {
        debug!(src = %source.file_id, dst = %destination, "copying");
        let mut fmd = self
            .register_copy_target(
                user_id,
                destination,
                source.sha256_checksum.clone(),
                source.is_directory,
            )
            .await?;

        if source.is_directory {
            let src_prefix = format!("{}/", source.object_name);
            let dst_prefix = destination.as_prefix();
            for object in self.store.list_all_objects(self.bucket(), &src_prefix, None).await? {
                let Some(relative) = object.key.strip_prefix(&src_prefix) else {
                    continue;
                };
                self.store
                    .copy_object(self.bucket(), &object.key, &format!("{dst_prefix}{relative}"))
                    .await?;
            }
            // a directory copy inherits the source size instead of rescanning
            fmd.file_size = source.file_size;
            fmd.upload_expires_at = None;
            fmd.upload_id = None;
            return self.files.upsert(&fmd).await;
        }

        self.store
            .copy_object(self.bucket(), &source.object_name, &fmd.object_name)
            .await?;
        self.reconcile_from_storage(fmd, Utc::now()).await?.into_finalized()
    }

    async fn copy_datcore_file(
        &self,
        user_id: UserId,
        source: &str,
        dst_project: ProjectId,
        node_id: NodeId,
    ) -> StorageResult<FileMetaData> {
        let datcore = self
            .datcore
            .as_ref()
            .ok_or(StorageError::LocationNotFound(DATCORE_ID))?;
        let workdir = tempfile::tempdir()?;
        let local_path = datcore.download_to(user_id, source, workdir.path()).await?;
        let file_name = local_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StorageError::DatCoreAdapter(format!("no file name for `{source}`")))?;
        let destination = StorageFileId::parse(&format!("{dst_project}/{node_id}/{file_name}"))?;

        let fmd = self
            .register_copy_target(user_id, &destination, None, false)
            .await?;
        self.store
            .upload_file(self.bucket(), destination.as_str(), &local_path)
            .await?;
        let fmd = self.reconcile_from_storage(fmd, Utc::now()).await?.into_finalized()?;
        info!(source, file_id = %fmd.file_id, "datcore file copied");
        Ok(fmd)
    }

    /// Whether a finalized row still has bytes behind it.
    async fn object_exists(&self, fmd: &FileMetaData) -> StorageResult<bool> {
        if fmd.is_directory {
            let page = self
                .store
                .list_objects(
                    &fmd.bucket_name,
                    ListObjectsParams {
                        prefix: format!("{}/", fmd.object_name),
                        max_keys: 1,
                        ..ListObjectsParams::default()
                    },
                )
                .await?;
            return Ok(!page.objects.is_empty());
        }
        match self
            .store
            .get_object_metadata(&fmd.bucket_name, &fmd.object_name)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove finalized rows whose objects are gone. With `dry_run` the rows
    /// are only reported.
    pub async fn synchronise_meta_data_table(&self, dry_run: bool) -> StorageResult<Vec<String>> {
        let rows = self.files.list_finalized(SIMCORE_S3_ID).await?;
        info!(rows = rows.len(), dry_run, "synchronising catalog with the object store");

        let checks: Vec<StorageResult<Option<String>>> = stream::iter(rows)
            .map(|fmd| async move {
                let exists = self.object_exists(&fmd).await?;
                Ok::<_, StorageError>((!exists).then_some(fmd.file_id))
            })
            .buffered(MAX_PARALLEL_S3_CALLS)
            .collect()
            .await;

        let mut missing = Vec::new();
        for check in checks {
            if let Some(file_id) = check? {
                missing.push(file_id);
            }
        }

        if !dry_run {
            for chunk in missing.chunks(SYNC_PRUNE_CHUNK_SIZE) {
                self.files.delete(chunk).await?;
            }
        }
        if !missing.is_empty() {
            warn!(removed = missing.len(), dry_run, "catalog rows without objects");
        }
        Ok(missing)
    }
}

#[async_trait]
impl DataManager for SimcoreS3DataManager {
    fn location_id(&self) -> LocationId {
        SIMCORE_S3_ID
    }

    fn location_name(&self) -> &'static str {
        SIMCORE_S3_STR
    }

    async fn authorized(&self, _user_id: UserId) -> StorageResult<bool> {
        Ok(true)
    }

    async fn list_datasets(&self, user_id: UserId) -> StorageResult<Vec<DatasetMetaData>> {
        let readable = self.access.list_readable_project_ids(user_id).await?;
        let mut datasets: Vec<DatasetMetaData> = self
            .projects
            .get_many(readable)
            .await?
            .into_values()
            .map(|project| DatasetMetaData {
                dataset_id: project.uuid.to_string(),
                display_name: project.name,
            })
            .collect();
        datasets.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.dataset_id.cmp(&b.dataset_id))
        });
        Ok(datasets)
    }

    async fn list_files_in_dataset(
        &self,
        user_id: UserId,
        dataset_id: &str,
        expand_dirs: bool,
    ) -> StorageResult<Vec<FileMetaData>> {
        let uuid_filter = format!("{}/", dataset_id.trim_end_matches('/'));
        self.list_files(user_id, expand_dirs, &uuid_filter, None).await
    }

    async fn list_files(
        &self,
        user_id: UserId,
        expand_dirs: bool,
        uuid_filter: &str,
        project_id: Option<ProjectId>,
    ) -> StorageResult<Vec<FileMetaData>> {
        let filter = match project_id {
            Some(project_id) => {
                self.require_project_right(user_id, project_id, "read", |r| r.read)
                    .await?;
                ListFilter {
                    project_ids: Some(vec![project_id]),
                    ..ListFilter::default()
                }
            }
            None => ListFilter {
                user_id: Some(user_id),
                project_ids: Some(self.access.list_readable_project_ids(user_id).await?),
                ..ListFilter::default()
            },
        };
        let rows = self
            .files
            .list_filtered(&ListFilter {
                partial_file_id: (!uuid_filter.is_empty()).then(|| uuid_filter.to_string()),
                ..filter
            })
            .await?;

        let now = Utc::now();
        let cap = self.settings.expand_dir_max_item_count;
        let mut data = Vec::new();
        let mut directories = Vec::new();
        for row in rows {
            if row.is_directory && expand_dirs {
                directories.push(row);
                continue;
            }
            if let Some(fmd) = self.reconcile_from_storage(row, now).await?.finalized() {
                data.push(fmd);
            }
        }

        if expand_dirs && data.len() < cap {
            let budget = cap - data.len();
            let expansions: Vec<StorageResult<Vec<FileMetaData>>> = stream::iter(directories)
                .map(|directory| async move { self.expand_directory(&directory, budget).await })
                .buffered(MAX_PARALLEL_S3_CALLS)
                .collect()
                .await;
            for expansion in expansions {
                let remaining = cap.saturating_sub(data.len());
                data.extend(expansion?.into_iter().take(remaining));
            }
        }

        self.with_display_names(data).await
    }

    async fn get_file(&self, user_id: UserId, file_id: &str) -> StorageResult<FileMetaData> {
        let file_id = StorageFileId::parse(file_id)?;
        if !self.file_rights(user_id, &file_id).await?.read {
            return Err(StorageError::FileAccessRight {
                access_right: "read",
                file_id: file_id.into_string(),
            });
        }
        let fmd = self.files.get(file_id.as_str()).await?;
        self.reconcile_from_storage(fmd, Utc::now()).await?.into_finalized()
    }

    async fn create_file_download_link(
        &self,
        user_id: UserId,
        file_id: &str,
        link_type: LinkType,
    ) -> StorageResult<String> {
        let file_id = StorageFileId::parse(file_id)?;
        let directory = self.enclosing_directory(&file_id, false).await?;
        let checked = match &directory {
            Some(directory) => StorageFileId::parse(&directory.file_id)?,
            None => file_id.clone(),
        };
        if !self.file_rights(user_id, &checked).await?.read {
            return Err(StorageError::FileAccessRight {
                access_right: "read",
                file_id: checked.into_string(),
            });
        }

        if directory.is_some() {
            self.store
                .get_object_metadata(self.bucket(), file_id.as_str())
                .await?;
            return self.link_for(file_id.as_str(), link_type).await;
        }

        let fmd = self.files.get(file_id.as_str()).await?;
        let fmd = self.reconcile_from_storage(fmd, Utc::now()).await?.into_finalized()?;
        self.link_for(&fmd.object_name, link_type).await
    }

    async fn delete_file(&self, user_id: UserId, file_id: &str) -> StorageResult<()> {
        let file_id = StorageFileId::parse(file_id)?;
        if !self.file_rights(user_id, &file_id).await?.delete {
            return Err(StorageError::FileAccessRight {
                access_right: "delete",
                file_id: file_id.into_string(),
            });
        }
        self.remove_file(&file_id).await
    }

    async fn list_paths(
        &self,
        user_id: UserId,
        file_filter: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> StorageResult<PathsPage> {
        let filter = file_filter
            .map(|f| f.trim_matches('/'))
            .filter(|f| !f.is_empty());
        let cursor = match cursor {
            Some(raw) => Some((PathCursor::decode(raw)?, raw)),
            None => None,
        };
        let limit = limit.max(1);
        let project_ids = self.accessible_project_ids(user_id, filter).await?;

        let directory = match filter.map(StorageFileId::parse) {
            Some(Ok(id)) => self.enclosing_directory(&id, true).await?,
            _ => None,
        };
        let mut page = match (directory, filter) {
            (Some(directory), Some(filter)) => {
                let readable = match directory.project_id {
                    Some(project_id) => project_ids.contains(&project_id),
                    None => directory.user_id == user_id,
                };
                if !readable {
                    return Err(StorageError::FileAccessRight {
                        access_right: "read",
                        file_id: directory.file_id,
                    });
                }
                self.list_paths_in_directory(&directory, filter, cursor, limit)
                    .await?
            }
            _ => {
                self.list_paths_in_catalog(project_ids, filter, cursor, limit)
                    .await?
            }
        };
        self.fill_display_paths(&mut page.items).await?;
        Ok(page)
    }

    async fn compute_path_size(&self, user_id: UserId, path: &str) -> StorageResult<u64> {
        let path = path.trim_matches('/');
        let project_ids = self
            .accessible_project_ids(user_id, Some(path).filter(|p| !p.is_empty()))
            .await?;

        if let Ok(file_id) = StorageFileId::parse(path) {
            if self.enclosing_directory(&file_id, false).await?.is_some() {
                let size = match self.store.get_object_metadata(self.bucket(), path).await {
                    Ok(metadata) => metadata.size,
                    Err(err) if err.is_not_found() => {
                        match self
                            .store
                            .get_directory_metadata(self.bucket(), &file_id.as_prefix())
                            .await
                        {
                            Ok(metadata) => metadata.size,
                            Err(err) if err.is_not_found() => 0,
                            Err(err) => return Err(err.into()),
                        }
                    }
                    Err(err) => return Err(err.into()),
                };
                return Ok(u64::try_from(size).unwrap_or(0));
            }
        }

        let rows = self
            .files
            .list_filtered(&ListFilter {
                user_id: Some(user_id),
                project_ids: Some(project_ids),
                file_id_prefix: Some(path.to_string()).filter(|p| !p.is_empty()),
                ..ListFilter::default()
            })
            .await?;

        let now = Utc::now();
        let mut total: u64 = 0;
        for row in rows {
            let below = path.is_empty()
                || row.file_id == path
                || row.file_id.starts_with(&format!("{path}/"));
            if !below {
                continue;
            }
            if let Some(fmd) = self.reconcile_from_storage(row, now).await?.finalized() {
                total = total.saturating_add(u64::try_from(fmd.file_size).unwrap_or(0));
            }
        }
        Ok(total)
    }

    async fn create_file_upload_links(
        &self,
        user_id: UserId,
        file_id: &str,
        link_type: LinkType,
        file_size: u64,
        is_directory: bool,
        sha256_checksum: Option<String>,
    ) -> StorageResult<UploadLinks> {
        let file_id = StorageFileId::parse(file_id)?;
        if !self.file_rights(user_id, &file_id).await?.write {
            return Err(StorageError::FileAccessRight {
                access_right: "write",
                file_id: file_id.into_string(),
            });
        }
        if file_size > MAX_OBJECT_BYTE_SIZE {
            return Err(StorageError::FileTooLarge {
                size: file_size,
                max: MAX_OBJECT_BYTE_SIZE,
            });
        }

        // a dangling multipart upload would keep costing storage
        self.clean_pending_upload(&file_id).await?;
        if !is_directory {
            self.remove_file(&file_id).await?;
        }

        let multipart = file_size >= self.settings.multipart_min_total_size;
        let now = Utc::now();
        let mut fmd = FileMetaData::new_pending(
            &file_id,
            self.bucket(),
            user_id,
            sha256_checksum,
            is_directory,
            now,
            self.upload_expiry(now),
        );
        if multipart || link_type == LinkType::S3 {
            fmd.upload_id = Some(S3_UNDEFINED_OR_EXTERNAL_MULTIPART_ID.to_string());
        }
        let mut fmd = self.files.upsert(&fmd).await?;
        let expiration = self.settings.presigned_link_expiration;

        match link_type {
            LinkType::Presigned if multipart => {
                let links = self
                    .store
                    .create_multipart_upload_links(self.bucket(), file_id.as_str(), file_size, expiration)
                    .await?;
                fmd.upload_id = Some(links.upload_id);
                self.files.upsert(&fmd).await?;
                info!(file_id = %file_id, parts = links.urls.len(), "multipart upload links created");
                Ok(UploadLinks {
                    urls: links.urls,
                    chunk_size: links.chunk_size,
                })
            }
            LinkType::Presigned => {
                let url = self
                    .store
                    .create_single_presigned_upload_link(self.bucket(), file_id.as_str(), expiration)
                    .await?;
                debug!(file_id = %file_id, "single upload link created");
                Ok(UploadLinks {
                    urls: vec![url],
                    chunk_size: if file_size > 0 { file_size } else { MAX_SINGLE_LINK_BYTE_SIZE },
                })
            }
            LinkType::S3 => Ok(UploadLinks {
                urls: vec![compute_s3_url(self.bucket(), file_id.as_str())],
                chunk_size: if file_size > 0 { file_size } else { MAX_OBJECT_BYTE_SIZE },
            }),
        }
    }

    async fn complete_file_upload(
        &self,
        file_id: &str,
        user_id: UserId,
        parts: &[UploadedPart],
    ) -> StorageResult<FileMetaData> {
        let file_id = StorageFileId::parse(file_id)?;
        if !self.file_rights(user_id, &file_id).await?.write {
            return Err(StorageError::FileAccessRight {
                access_right: "write",
                file_id: file_id.into_string(),
            });
        }
        let fmd = self.files.get(file_id.as_str()).await?;
        if let Some(upload_id) = fmd
            .upload_id
            .as_deref()
            .filter(|id| is_managed_multipart_upload(Some(id)))
        {
            let e_tag = self
                .store
                .complete_multipart_upload(self.bucket(), file_id.as_str(), upload_id, parts)
                .await?;
            debug!(file_id = %file_id, e_tag, "multipart upload completed");
        }
        self.reconcile_from_storage(fmd, Utc::now()).await?.into_finalized()
    }

    async fn abort_file_upload(&self, user_id: UserId, file_id: &str) -> StorageResult<()> {
        let file_id = StorageFileId::parse(file_id)?;
        let rights = self.file_rights(user_id, &file_id).await?;
        if !(rights.delete && rights.write) {
            return Err(StorageError::FileAccessRight {
                access_right: "write/delete",
                file_id: file_id.into_string(),
            });
        }
        let fmd = self.files.get(file_id.as_str()).await?;
        self.abort_managed_upload(&fmd).await?;

        match self.reconcile_from_storage(fmd, Utc::now()).await? {
            Reconciliation::Reconciled(fmd) => {
                info!(file_id = %fmd.file_id, "abort found a stored object, keeping it");
            }
            Reconciliation::StillPending(fmd) | Reconciliation::Orphaned(fmd) => {
                self.files.delete(&[fmd.file_id]).await?;
                info!(file_id = %file_id, "upload aborted");
            }
        }
        Ok(())
    }
}
