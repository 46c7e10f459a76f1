//! Object-store client abstraction.
//!
//! `ObjectStore` is the seam between the storage managers and an
//! S3-compatible backend. Failures collapse into two kinds, a missing key and
//! everything else, so callers can build one retry/fallback policy without
//! knowing the SDK's error hierarchy.

pub mod aws;
pub mod memory;

use crate::{
    constants::{
        MAX_OBJECT_BYTE_SIZE, MULTIPART_MAX_NUMBER_OF_PARTS, MULTIPART_PART_SIZE_LADDER,
    },
    models::{MultipartUploadLinks, UploadedPart},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use thiserror::Error;

pub use aws::S3ObjectStore;
pub use memory::MemoryObjectStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    KeyNotFound { bucket: String, key: String },
    #[error("object store access error: {message}")]
    Access { message: String },
}

impl ObjectStoreError {
    pub fn access(message: impl Into<String>) -> Self {
        ObjectStoreError::Access {
            message: message.into(),
        }
    }

    pub fn not_found(bucket: &str, key: &str) -> Self {
        ObjectStoreError::KeyNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjectStoreError::KeyNotFound { .. })
    }
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Authoritative facts about a stored object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub key: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
    pub e_tag: String,
}

#[derive(Clone, Debug, Default)]
pub struct ListObjectsParams {
    pub prefix: String,
    /// Group keys below the next `/` into common prefixes.
    pub delimited: bool,
    pub continuation_token: Option<String>,
    pub max_keys: usize,
}

#[derive(Clone, Debug, Default)]
pub struct ObjectPage {
    pub objects: Vec<ObjectMetadata>,
    pub common_prefixes: Vec<String>,
    pub next_continuation_token: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn bucket_exists(&self, bucket: &str) -> ObjectStoreResult<bool>;

    async fn create_single_presigned_upload_link(
        &self,
        bucket: &str,
        key: &str,
        expiration: Duration,
    ) -> ObjectStoreResult<String>;

    /// Initiate a multipart upload and presign one link per part.
    async fn create_multipart_upload_links(
        &self,
        bucket: &str,
        key: &str,
        file_size: u64,
        expiration: Duration,
    ) -> ObjectStoreResult<MultipartUploadLinks>;

    /// Stitch uploaded parts together; returns the final entity tag.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> ObjectStoreResult<String>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> ObjectStoreResult<()>;

    async fn create_single_presigned_download_link(
        &self,
        bucket: &str,
        key: &str,
        expiration: Duration,
    ) -> ObjectStoreResult<String>;

    /// Fails with `KeyNotFound` when the object does not exist.
    async fn get_object_metadata(&self, bucket: &str, key: &str)
    -> ObjectStoreResult<ObjectMetadata>;

    async fn list_objects(
        &self,
        bucket: &str,
        params: ListObjectsParams,
    ) -> ObjectStoreResult<ObjectPage>;

    /// Server-side copy, no bytes pass through this process.
    async fn copy_object(&self, bucket: &str, src_key: &str, dst_key: &str)
    -> ObjectStoreResult<()>;

    async fn delete_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<()>;

    async fn delete_objects_by_prefix(&self, bucket: &str, prefix: &str) -> ObjectStoreResult<()>;

    async fn upload_file(&self, bucket: &str, key: &str, path: &Path) -> ObjectStoreResult<()>;

    /// Every object below `prefix`, stopping once `limit` objects are collected.
    async fn list_all_objects(
        &self,
        bucket: &str,
        prefix: &str,
        limit: Option<usize>,
    ) -> ObjectStoreResult<Vec<ObjectMetadata>> {
        let mut collected = Vec::new();
        let mut continuation_token = None;
        loop {
            let page = self
                .list_objects(
                    bucket,
                    ListObjectsParams {
                        prefix: prefix.to_string(),
                        delimited: false,
                        continuation_token,
                        max_keys: 1000,
                    },
                )
                .await?;
            collected.extend(page.objects);
            if let Some(limit) = limit {
                if collected.len() >= limit {
                    collected.truncate(limit);
                    return Ok(collected);
                }
            }
            match page.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => return Ok(collected),
            }
        }
    }

    /// Metadata of a "directory": summed size and newest modification of the
    /// objects below `prefix`. An empty listing counts as not found.
    async fn get_directory_metadata(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> ObjectStoreResult<ObjectMetadata> {
        let objects = self.list_all_objects(bucket, prefix, None).await?;
        let last_modified = objects
            .iter()
            .map(|o| o.last_modified)
            .max()
            .ok_or_else(|| ObjectStoreError::not_found(bucket, prefix))?;
        Ok(ObjectMetadata {
            key: prefix.trim_end_matches('/').to_string(),
            size: objects.iter().map(|o| o.size).sum(),
            last_modified,
            e_tag: String::new(),
        })
    }
}

/// Part size for a multipart upload of `file_size` bytes: the first ladder
/// entry that keeps the number of parts under the S3 limit.
pub fn compute_chunk_size(file_size: u64) -> Option<u64> {
    if file_size > MAX_OBJECT_BYTE_SIZE {
        return None;
    }
    MULTIPART_PART_SIZE_LADDER
        .iter()
        .copied()
        .find(|chunk| file_size.div_ceil(*chunk) < MULTIPART_MAX_NUMBER_OF_PARTS)
}

pub fn compute_num_file_chunks(file_size: u64, chunk_size: u64) -> u64 {
    file_size.div_ceil(chunk_size).max(1)
}

/// Byte range of a local file sent as one multipart part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilePart {
    pub number: i32,
    pub offset: u64,
    pub length: u64,
}

/// How to send a local file of `file_size` bytes: `None` for a single
/// request, otherwise the parts of a multipart upload once the file is
/// larger than `single_request_limit`.
pub fn plan_file_parts(
    file_size: u64,
    single_request_limit: u64,
) -> ObjectStoreResult<Option<Vec<FilePart>>> {
    if file_size <= single_request_limit {
        return Ok(None);
    }
    let chunk_size = compute_chunk_size(file_size)
        .ok_or_else(|| ObjectStoreError::access(format!("EntityTooLarge: {file_size}")))?;
    let mut parts = Vec::new();
    let mut offset = 0;
    while offset < file_size {
        let number = i32::try_from(parts.len() + 1)
            .map_err(|_| ObjectStoreError::access("part number overflow"))?;
        let length = chunk_size.min(file_size - offset);
        parts.push(FilePart {
            number,
            offset,
            length,
        });
        offset += length;
    }
    Ok(Some(parts))
}

/// `s3://bucket/key` with the key percent-quoted (slashes kept).
pub fn compute_s3_url(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket, quote_key(key))
}

fn quote_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Compute a synthetic "common prefix" for delimited listings.
///
/// Returns Some(prefix) if the key lies below a deeper `/` than the requested
/// prefix, otherwise None.
pub(crate) fn compute_common_prefix(key: &str, requested_prefix: &str) -> Option<String> {
    let after_prefix = key.strip_prefix(requested_prefix)?;
    after_prefix
        .find('/')
        .map(|pos| format!("{}{}", requested_prefix, &after_prefix[..=pos]))
}
