//! Object endpoints of the in-memory backend.
//!
//! In `memory` mode the presigned links point back at this service, so these
//! handlers play the part of the S3 endpoint: `PUT` stores a whole object or
//! one multipart part, `GET` returns the bytes.

use crate::{errors::AppError, s3::MemoryObjectStore, services::StorageError};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

/// Query params carried by presigned links.
#[derive(Debug, Deserialize)]
pub struct ObjectLinkQuery {
    #[serde(rename = "partNumber")]
    pub part_number: Option<i32>,
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
}

/// Upload an object, or one part of a multipart upload, to `/{bucket}/{*key}`.
pub async fn upload_object(
    State(store): State<MemoryObjectStore>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<ObjectLinkQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let size = body.len();
    let e_tag = match (query.part_number, query.upload_id) {
        (Some(number), Some(upload_id)) => {
            debug!(%bucket, %key, number, %upload_id, size, "storing upload part");
            store.upload_part(&upload_id, number, body).await
        }
        (None, None) => {
            debug!(%bucket, %key, size, "storing object");
            store.put_object(&bucket, &key, body).await
        }
        _ => {
            return Err(AppError::bad_request(
                "partNumber and uploadId go together",
            ));
        }
    }
    .map_err(StorageError::from)?;

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&e_tag) {
        headers.insert(header::ETAG, value);
    }
    Ok((StatusCode::OK, headers))
}

/// Download an object `/{bucket}/{*key}`.
pub async fn get_object(
    State(store): State<MemoryObjectStore>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let data = store
        .get_object_bytes(&bucket, &key)
        .await
        .map_err(StorageError::from)?;

    let mut response = Response::new(Body::from(data));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok(response)
}
