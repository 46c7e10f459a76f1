use crate::{models::LocationId, s3::ObjectStoreError};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file `{file_id}` not found")]
    FileMetaDataNotFound { file_id: String },
    #[error("insufficient `{access_right}` rights on file `{file_id}`")]
    FileAccessRight {
        access_right: &'static str,
        file_id: String,
    },
    #[error("insufficient `{access_right}` rights on project `{project_id}`")]
    ProjectAccessRight {
        access_right: &'static str,
        project_id: String,
    },
    #[error("project `{project_id}` not found")]
    ProjectNotFound { project_id: String },
    #[error("link `{file_id}` already exists")]
    LinkAlreadyExists { file_id: String },
    #[error("invalid file identifier `{identifier}`: {details}")]
    InvalidFileIdentifier { identifier: String, details: String },
    #[error("missing datcore credentials for user {user_id}")]
    DatCoreCredentialsMissing { user_id: i64 },
    #[error("operation `{operation}` is not supported by location `{location}`")]
    NotSupported {
        location: &'static str,
        operation: &'static str,
    },
    #[error("location {0} not found")]
    LocationNotFound(LocationId),
    #[error("file size {size} exceeds the maximum of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },
    #[error("invalid cursor `{0}`")]
    InvalidCursor(String),
    #[error("datcore adapter error: {0}")]
    DatCoreAdapter(String),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn file_not_found(file_id: impl ToString) -> Self {
        StorageError::FileMetaDataNotFound {
            file_id: file_id.to_string(),
        }
    }

    pub fn project_not_found(project_id: impl ToString) -> Self {
        StorageError::ProjectNotFound {
            project_id: project_id.to_string(),
        }
    }

    /// True when the underlying object is missing from the store.
    pub fn is_object_not_found(&self) -> bool {
        matches!(self, StorageError::ObjectStore(err) if err.is_not_found())
    }
}
