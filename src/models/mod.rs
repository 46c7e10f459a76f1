//! Core data models for the data storage manager.
//!
//! The catalog entity (`FileMetaData`) maps to the `file_meta_data` table via
//! `sqlx::FromRow`; everything here serializes as JSON via `serde`.

pub mod access_rights;
pub mod dataset;
pub mod file_id;
pub mod file_meta_data;
pub mod paths;
pub mod upload;

use uuid::Uuid;

pub type UserId = i64;
pub type GroupId = i64;
pub type WorkspaceId = i64;
pub type LocationId = i64;
pub type ProjectId = Uuid;
pub type NodeId = Uuid;

pub use access_rights::AccessRights;
pub use dataset::DatasetMetaData;
pub use file_id::StorageFileId;
pub use file_meta_data::FileMetaData;
pub use paths::{PathMetaData, PathsPage};
pub use upload::{LinkType, MultipartUploadLinks, UploadLinks, UploadedPart};
