//! Defines routes for the storage API.
//!
//! ## Structure
//! - **Locations**
//!   - `GET    /v0/locations` -> locations the user may use
//!   - `POST   /v0/locations/{location_id}:sync` -> drop catalog rows without objects
//!   - `GET    /v0/locations/{location_id}/datasets`
//!   - `GET    /v0/locations/{location_id}/datasets/{dataset_id}/metadata`
//!   - `GET    /v0/locations/{location_id}/paths` -> paginated browsing
//!   - `POST   /v0/locations/{location_id}/paths/{path}:size`
//!
//! - **Files** (`file_id` is one percent-encoded segment)
//!   - `GET    /v0/locations/{location_id}/files/metadata`
//!   - `GET    /v0/locations/{location_id}/files/{file_id}/metadata`
//!   - `GET    /v0/locations/{location_id}/files/{file_id}` -> download link
//!   - `PUT    /v0/locations/{location_id}/files/{file_id}` -> upload links
//!   - `POST   /v0/locations/{location_id}/files/{file_id}:complete|:abort`
//!   - `DELETE /v0/locations/{location_id}/files/{file_id}`
//!   - `POST   /v0/files/{file_id}:soft-copy`
//!
//! - **simcore.s3 only**
//!   - `POST   /v0/simcore-s3/files/metadata:search`
//!   - `POST   /v0/simcore-s3/folders` -> deep copy a project
//!   - `DELETE /v0/simcore-s3/folders/{folder_id}` -> delete a project or node
//!
//! - **In-memory backend** (mounted under [`MEMORY_STORE_PREFIX`] in `memory` mode)
//!   - `PUT    /s3/{bucket}/{*key}` -> follow an upload link
//!   - `GET    /s3/{bucket}/{*key}` -> follow a download link

use crate::handlers::{
    AppState,
    file_handlers::{
        delete_file, download_file, file_action, get_file_metadata, list_files_metadata,
        upload_file,
    },
    health_handlers::{healthz, readyz},
    location_handlers::{
        compute_path_size, list_dataset_files, list_datasets, list_locations, list_paths,
        synchronise_meta_data_table,
    },
    object_handlers::{get_object, upload_object},
    simcore_handlers::{
        copy_as_soft_link, copy_folders_from_project, delete_folders_of_project, search_files,
    },
};
use crate::s3::MemoryObjectStore;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Path prefix the in-memory store's links point below.
pub const MEMORY_STORE_PREFIX: &str = "/s3";

/// Build and return the router of the storage API.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Location-level routes
        .route("/v0/locations", get(list_locations))
        .route("/v0/locations/{location_id}", post(synchronise_meta_data_table))
        .route("/v0/locations/{location_id}/datasets", get(list_datasets))
        .route(
            "/v0/locations/{location_id}/datasets/{dataset_id}/metadata",
            get(list_dataset_files),
        )
        .route("/v0/locations/{location_id}/paths", get(list_paths))
        .route("/v0/locations/{location_id}/paths/{path}", post(compute_path_size))
        // File-level routes
        .route(
            "/v0/locations/{location_id}/files/metadata",
            get(list_files_metadata),
        )
        .route(
            "/v0/locations/{location_id}/files/{file_id}/metadata",
            get(get_file_metadata),
        )
        .route(
            "/v0/locations/{location_id}/files/{file_id}",
            get(download_file)
                .put(upload_file)
                .post(file_action)
                .delete(delete_file),
        )
        .route("/v0/files/{file_id}", post(copy_as_soft_link))
        // simcore.s3 routes
        .route("/v0/simcore-s3/files/metadata:search", post(search_files))
        .route("/v0/simcore-s3/folders", post(copy_folders_from_project))
        .route("/v0/simcore-s3/folders/{folder_id}", delete(delete_folders_of_project))
}

/// The full application: routes plus state.
pub fn app(state: AppState) -> Router {
    routes().with_state(state)
}

/// Routes answering the links handed out by a [`MemoryObjectStore`].
pub fn object_routes(store: MemoryObjectStore) -> Router {
    Router::new()
        .route("/{bucket}/{*key}", get(get_object).put(upload_object))
        .layer(DefaultBodyLimit::disable())
        .with_state(store)
}

/// The application plus the object routes of the in-memory backend.
pub fn app_with_memory_store(state: AppState, store: MemoryObjectStore) -> Router {
    app(state).nest(MEMORY_STORE_PREFIX, object_routes(store))
}
