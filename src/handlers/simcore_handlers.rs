//! Routes only simcore.s3 serves: search, soft copies and whole-project
//! operations.

use crate::{
    errors::AppError,
    handlers::{AppState, Envelope, UserQuery, split_action},
    models::{FileMetaData, NodeId, ProjectId, UserId},
    services::DeepCopyReport,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::info;

#[derive(Deserialize, Debug)]
pub struct SearchQuery {
    pub user_id: UserId,
    pub startswith: Option<String>,
    pub sha256_checksum: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// `POST /v0/simcore-s3/files/metadata:search`
pub async fn search_files(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Envelope<Vec<FileMetaData>>>, AppError> {
    if query.limit.is_some_and(|limit| limit < 0) || query.offset.is_some_and(|offset| offset < 0) {
        return Err(AppError::bad_request("limit and offset must not be negative"));
    }
    let dsm = state.locations.simcore().await?;
    let files = dsm
        .search_owned_files(
            query.user_id,
            query.startswith,
            query.sha256_checksum,
            query.limit,
            query.offset,
        )
        .await?;
    Ok(Json(Envelope::new(files)))
}

#[derive(Deserialize, Debug)]
pub struct SoftCopyBody {
    pub link_id: String,
}

/// `POST /v0/files/{file_id}:soft-copy`
pub async fn copy_as_soft_link(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    Query(query): Query<UserQuery>,
    Json(body): Json<SoftCopyBody>,
) -> Result<Json<Envelope<FileMetaData>>, AppError> {
    let (file_id, action) = split_action(&segment)?;
    if action != "soft-copy" {
        return Err(AppError::not_found(format!("unknown file action `{action}`")));
    }
    let dsm = state.locations.simcore().await?;
    let link = dsm
        .create_soft_link(query.user_id, file_id, &body.link_id)
        .await?;
    Ok(Json(Envelope::new(link)))
}

#[derive(Deserialize, Debug)]
pub struct DeleteFolderQuery {
    pub user_id: UserId,
    pub node_id: Option<NodeId>,
}

/// `DELETE /v0/simcore-s3/folders/{folder_id}`
///
/// The folder is a project; with `node_id` only that node is removed.
pub async fn delete_folders_of_project(
    State(state): State<AppState>,
    Path(folder_id): Path<ProjectId>,
    Query(query): Query<DeleteFolderQuery>,
) -> Result<StatusCode, AppError> {
    let dsm = state.locations.simcore().await?;
    dsm.delete_project(query.user_id, folder_id, query.node_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Debug)]
pub struct ProjectRef {
    pub uuid: ProjectId,
}

#[derive(Deserialize, Debug)]
pub struct CopyFoldersBody {
    pub source: ProjectRef,
    pub destination: ProjectRef,
    /// Source node id -> destination node id.
    #[serde(default)]
    pub nodes_map: HashMap<NodeId, NodeId>,
}

/// `POST /v0/simcore-s3/folders`: deep copy of a project's data.
pub async fn copy_folders_from_project(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
    Json(body): Json<CopyFoldersBody>,
) -> Result<(StatusCode, Json<Envelope<DeepCopyReport>>), AppError> {
    let dsm = state.locations.simcore().await?;
    let report = dsm
        .deep_copy_project(
            query.user_id,
            body.source.uuid,
            body.destination.uuid,
            &body.nodes_map,
        )
        .await?;
    info!(
        src = %body.source.uuid,
        dst = %body.destination.uuid,
        copied = report.copied.len(),
        "project data copied"
    );
    Ok((StatusCode::CREATED, Json(Envelope::new(report))))
}
