//! Location-level routes: the location list, datasets, path browsing and
//! catalog synchronisation.

use crate::{
    constants::SIMCORE_S3_ID,
    errors::AppError,
    handlers::{AppState, Envelope, UserQuery, split_action},
    models::{DatasetMetaData, FileMetaData, LocationId, PathsPage, UserId},
};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const DEFAULT_PATHS_PAGE_SIZE: usize = 50;

#[derive(Serialize, Debug)]
pub struct LocationInfo {
    pub id: LocationId,
    pub name: &'static str,
}

/// `GET /v0/locations`: the locations the user may use.
pub async fn list_locations(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Envelope<Vec<LocationInfo>>>, AppError> {
    let mut locations = Vec::new();
    for location_id in state.locations.locations() {
        let location = state.location(location_id).await?;
        match location.manager().authorized(query.user_id).await {
            Ok(true) => locations.push(LocationInfo {
                id: location.location_id(),
                name: location.location_name(),
            }),
            Ok(false) => {}
            Err(err) => debug!(location_id, error = %err, "location not authorized"),
        }
    }
    Ok(Json(Envelope::new(locations)))
}

/// `GET /v0/locations/{location_id}/datasets`
pub async fn list_datasets(
    State(state): State<AppState>,
    Path(location_id): Path<LocationId>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Envelope<Vec<DatasetMetaData>>>, AppError> {
    let location = state.location(location_id).await?;
    let datasets = location.manager().list_datasets(query.user_id).await?;
    Ok(Json(Envelope::new(datasets)))
}

#[derive(Deserialize, Debug)]
pub struct DatasetFilesQuery {
    pub user_id: UserId,
    #[serde(default = "default_true")]
    pub expand_dirs: bool,
}

fn default_true() -> bool {
    true
}

/// `GET /v0/locations/{location_id}/datasets/{dataset_id}/metadata`
pub async fn list_dataset_files(
    State(state): State<AppState>,
    Path((location_id, dataset_id)): Path<(LocationId, String)>,
    Query(query): Query<DatasetFilesQuery>,
) -> Result<Json<Envelope<Vec<FileMetaData>>>, AppError> {
    let location = state.location(location_id).await?;
    let files = location
        .manager()
        .list_files_in_dataset(query.user_id, &dataset_id, query.expand_dirs)
        .await?;
    Ok(Json(Envelope::new(files)))
}

#[derive(Deserialize, Debug)]
pub struct PathsQuery {
    pub user_id: UserId,
    pub file_filter: Option<String>,
    pub cursor: Option<String>,
    pub size: Option<usize>,
}

/// `GET /v0/locations/{location_id}/paths`
pub async fn list_paths(
    State(state): State<AppState>,
    Path(location_id): Path<LocationId>,
    Query(query): Query<PathsQuery>,
) -> Result<Json<PathsPage>, AppError> {
    let location = state.location(location_id).await?;
    let page = location
        .manager()
        .list_paths(
            query.user_id,
            query.file_filter.as_deref(),
            query.cursor.as_deref(),
            query.size.unwrap_or(DEFAULT_PATHS_PAGE_SIZE),
        )
        .await?;
    Ok(Json(page))
}

#[derive(Serialize, Debug)]
pub struct PathSize {
    pub path: String,
    pub size: u64,
}

/// `POST /v0/locations/{location_id}/paths/{path}:size`
pub async fn compute_path_size(
    State(state): State<AppState>,
    Path((location_id, segment)): Path<(LocationId, String)>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Envelope<PathSize>>, AppError> {
    let (path, action) = split_action(&segment)?;
    if action != "size" {
        return Err(AppError::not_found(format!("unknown path action `{action}`")));
    }
    let location = state.location(location_id).await?;
    let size = location
        .manager()
        .compute_path_size(query.user_id, path)
        .await?;
    Ok(Json(Envelope::new(PathSize {
        path: path.to_string(),
        size,
    })))
}

#[derive(Deserialize, Debug)]
pub struct SyncQuery {
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Serialize, Debug)]
pub struct SyncReport {
    pub removed: Vec<String>,
    pub dry_run: bool,
}

/// `POST /v0/locations/{location_id}:sync`
pub async fn synchronise_meta_data_table(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<Envelope<SyncReport>>, AppError> {
    let (location_id, action) = split_action(&segment)?;
    let location_id: LocationId = location_id
        .parse()
        .map_err(|_| AppError::bad_request(format!("invalid location id `{location_id}`")))?;
    if action != "sync" {
        return Err(AppError::not_found(format!("unknown location action `{action}`")));
    }
    if location_id != SIMCORE_S3_ID {
        return Err(AppError::bad_request("only simcore.s3 can be synchronised"));
    }
    let location = state.location(location_id).await?;
    let removed = location
        .as_simcore()?
        .synchronise_meta_data_table(query.dry_run)
        .await?;
    info!(removed = removed.len(), dry_run = query.dry_run, "catalog synchronised");
    Ok(Json(Envelope::new(SyncReport {
        removed,
        dry_run: query.dry_run,
    })))
}
