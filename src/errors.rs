use crate::{s3::ObjectStoreError, services::StorageError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// Error returned by the HTTP handlers.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

fn status_of(err: &StorageError) -> StatusCode {
    match err {
        StorageError::FileMetaDataNotFound { .. }
        | StorageError::ProjectNotFound { .. }
        | StorageError::LocationNotFound(_)
        | StorageError::ObjectStore(ObjectStoreError::KeyNotFound { .. }) => StatusCode::NOT_FOUND,
        StorageError::FileAccessRight { .. } | StorageError::ProjectAccessRight { .. } => {
            StatusCode::FORBIDDEN
        }
        StorageError::LinkAlreadyExists { .. }
        | StorageError::InvalidFileIdentifier { .. }
        | StorageError::FileTooLarge { .. }
        | StorageError::InvalidCursor(_) => StatusCode::UNPROCESSABLE_ENTITY,
        StorageError::ObjectStore(ObjectStoreError::Access { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        StorageError::DatCoreCredentialsMissing { .. } => StatusCode::UNAUTHORIZED,
        StorageError::NotSupported { .. } => StatusCode::NOT_IMPLEMENTED,
        StorageError::DatCoreAdapter(_) | StorageError::Sqlx(_) | StorageError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = status_of(&err);
        if status.is_server_error() {
            error!(error = %err, status = status.as_u16(), "request failed");
        }
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_onto_http_statuses() {
        let cases = [
            (StorageError::file_not_found("a/b/c"), StatusCode::NOT_FOUND),
            (
                ObjectStoreError::not_found("bucket", "key").into(),
                StatusCode::NOT_FOUND,
            ),
            (
                StorageError::FileAccessRight {
                    access_right: "read",
                    file_id: "a/b/c".into(),
                },
                StatusCode::FORBIDDEN,
            ),
            (
                StorageError::LinkAlreadyExists {
                    file_id: "a/b/c".into(),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ObjectStoreError::access("connection reset").into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                StorageError::DatCoreCredentialsMissing { user_id: 3 },
                StatusCode::UNAUTHORIZED,
            ),
            (
                StorageError::NotSupported {
                    location: "datcore",
                    operation: "abort_file_upload",
                },
                StatusCode::NOT_IMPLEMENTED,
            ),
            (
                StorageError::DatCoreAdapter("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status, expected);
        }
    }
}
