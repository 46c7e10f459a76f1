//! File routes under `/v0/locations/{location_id}/files`.
//!
//! File ids contain slashes and are sent percent-encoded as a single path
//! segment. Upload completion and abort are `POST {file_id}:complete` and
//! `POST {file_id}:abort`.

use crate::{
    errors::AppError,
    handlers::{AppState, Envelope, UserQuery, encode_segment, split_action},
    models::{FileMetaData, LinkType, LocationId, ProjectId, UploadedPart, UserId},
    services::StorageError,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

#[derive(Deserialize, Debug)]
pub struct ListFilesQuery {
    pub user_id: UserId,
    #[serde(default)]
    pub uuid_filter: String,
    pub project_id: Option<ProjectId>,
    #[serde(default = "default_true")]
    pub expand_dirs: bool,
}

fn default_true() -> bool {
    true
}

/// `GET /v0/locations/{location_id}/files/metadata`
pub async fn list_files_metadata(
    State(state): State<AppState>,
    Path(location_id): Path<LocationId>,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<Envelope<Vec<FileMetaData>>>, AppError> {
    let location = state.location(location_id).await?;
    // older clients only send the project id
    let uuid_filter = match (&query.uuid_filter[..], query.project_id) {
        ("", Some(project_id)) => project_id.to_string(),
        (filter, _) => filter.to_string(),
    };
    let files = location
        .manager()
        .list_files(query.user_id, query.expand_dirs, &uuid_filter, query.project_id)
        .await?;
    Ok(Json(Envelope::new(files)))
}

/// `GET /v0/locations/{location_id}/files/{file_id}/metadata`
///
/// A missing file answers 200 with an empty `data` object, which older
/// clients rely on.
pub async fn get_file_metadata(
    State(state): State<AppState>,
    Path((location_id, file_id)): Path<(LocationId, String)>,
    Query(query): Query<UserQuery>,
) -> Result<Response, AppError> {
    let location = state.location(location_id).await?;
    match location.manager().get_file(query.user_id, &file_id).await {
        Ok(fmd) => Ok(Json(Envelope::new(fmd)).into_response()),
        Err(StorageError::FileMetaDataNotFound { .. }) => {
            debug!(file_id, "file metadata not found, answering an empty envelope");
            Ok(Json(json!({"data": {}, "error": "No result found"})).into_response())
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Deserialize, Debug)]
pub struct DownloadQuery {
    pub user_id: UserId,
    #[serde(default = "default_link_type")]
    pub link_type: LinkType,
}

fn default_link_type() -> LinkType {
    LinkType::Presigned
}

#[derive(Serialize, Debug)]
pub struct DownloadLink {
    pub link: String,
}

/// `GET /v0/locations/{location_id}/files/{file_id}`
pub async fn download_file(
    State(state): State<AppState>,
    Path((location_id, file_id)): Path<(LocationId, String)>,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<Envelope<DownloadLink>>, AppError> {
    let location = state.location(location_id).await?;
    let link = location
        .manager()
        .create_file_download_link(query.user_id, &file_id, query.link_type)
        .await?;
    Ok(Json(Envelope::new(DownloadLink { link })))
}

#[derive(Deserialize, Debug)]
pub struct UploadQuery {
    pub user_id: UserId,
    #[serde(default = "default_link_type")]
    pub link_type: LinkType,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub is_directory: bool,
    pub sha256_checksum: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct UploadActionLinks {
    pub abort_upload: String,
    pub complete_upload: String,
}

#[derive(Serialize, Debug)]
pub struct FileUploadSchema {
    pub chunk_size: u64,
    pub urls: Vec<String>,
    pub links: UploadActionLinks,
}

/// `PUT /v0/locations/{location_id}/files/{file_id}`
pub async fn upload_file(
    State(state): State<AppState>,
    Path((location_id, file_id)): Path<(LocationId, String)>,
    Query(query): Query<UploadQuery>,
) -> Result<Json<Envelope<FileUploadSchema>>, AppError> {
    let location = state.location(location_id).await?;
    let links = location
        .manager()
        .create_file_upload_links(
            query.user_id,
            &file_id,
            query.link_type,
            query.file_size,
            query.is_directory,
            query.sha256_checksum,
        )
        .await?;

    let base = format!(
        "/v0/locations/{location_id}/files/{}",
        encode_segment(&file_id)
    );
    Ok(Json(Envelope::new(FileUploadSchema {
        chunk_size: links.chunk_size,
        urls: links.urls,
        links: UploadActionLinks {
            abort_upload: format!("{base}:abort?user_id={}", query.user_id),
            complete_upload: format!("{base}:complete?user_id={}", query.user_id),
        },
    })))
}

#[derive(Deserialize, Debug, Default)]
pub struct CompleteUploadBody {
    #[serde(default)]
    pub parts: Vec<UploadedPart>,
}

/// `POST /v0/locations/{location_id}/files/{file_id}:complete` and
/// `POST /v0/locations/{location_id}/files/{file_id}:abort`
pub async fn file_action(
    State(state): State<AppState>,
    Path((location_id, segment)): Path<(LocationId, String)>,
    Query(query): Query<UserQuery>,
    body: Option<Json<CompleteUploadBody>>,
) -> Result<Response, AppError> {
    let (file_id, action) = split_action(&segment)?;
    let location = state.location(location_id).await?;
    match action {
        "complete" => {
            let body = body.map(|Json(body)| body).unwrap_or_default();
            let fmd = location
                .manager()
                .complete_file_upload(file_id, query.user_id, &body.parts)
                .await?;
            info!(file_id, user_id = query.user_id, "upload completed");
            Ok(Json(Envelope::new(fmd)).into_response())
        }
        "abort" => {
            location
                .manager()
                .abort_file_upload(query.user_id, file_id)
                .await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        other => Err(AppError::not_found(format!("unknown file action `{other}`"))),
    }
}

/// `DELETE /v0/locations/{location_id}/files/{file_id}`
pub async fn delete_file(
    State(state): State<AppState>,
    Path((location_id, file_id)): Path<(LocationId, String)>,
    Query(query): Query<UserQuery>,
) -> Result<StatusCode, AppError> {
    let location = state.location(location_id).await?;
    location
        .manager()
        .delete_file(query.user_id, &file_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
