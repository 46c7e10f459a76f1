//! In-process object store used by tests and the `memory` backend mode.
//!
//! Presigned links are plain URLs below `base_url`; the bytes themselves are
//! injected with [`MemoryObjectStore::put_object`] and
//! [`MemoryObjectStore::upload_part`], standing in for a client that follows
//! the links.

use crate::{
    models::{MultipartUploadLinks, UploadedPart},
    s3::{
        ListObjectsParams, ObjectMetadata, ObjectPage, ObjectStore, ObjectStoreError,
        ObjectStoreResult, compute_chunk_size, compute_common_prefix, compute_num_file_chunks,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    e_tag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingMultipart {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, StoredObject>,
}

#[derive(Debug, Default)]
struct State {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, PendingMultipart>,
    offline: bool,
    latency: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct MemoryObjectStore {
    base_url: String,
    state: Arc<RwLock<State>>,
}

fn entity_tag(data: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(data))
}

impl MemoryObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            state: Arc::new(RwLock::new(State::default())),
        }
    }

    pub async fn create_bucket(&self, bucket: &str) {
        self.state
            .write()
            .await
            .buckets
            .entry(bucket.to_string())
            .or_default();
    }

    /// Simulate a backend outage: every call fails with an access error.
    pub async fn set_offline(&self, offline: bool) {
        self.state.write().await.offline = offline;
    }

    /// Delay every call, to exercise caller-side timeouts.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.write().await.latency = latency;
    }

    /// Store bytes under `key`, as a client following an upload link would.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
    ) -> ObjectStoreResult<String> {
        self.gate().await?;
        let data = data.into();
        let object = StoredObject {
            e_tag: entity_tag(&data),
            data,
            last_modified: Utc::now(),
        };
        let e_tag = object.e_tag.clone();
        let mut state = self.state.write().await;
        bucket_mut(&mut state, bucket)?.insert(key.to_string(), object);
        Ok(e_tag)
    }

    /// Store one part of a multipart upload; returns the part's entity tag.
    pub async fn upload_part(
        &self,
        upload_id: &str,
        number: i32,
        data: impl Into<Bytes>,
    ) -> ObjectStoreResult<String> {
        self.gate().await?;
        let data = data.into();
        let part = StoredObject {
            e_tag: entity_tag(&data),
            data,
            last_modified: Utc::now(),
        };
        let e_tag = part.e_tag.clone();
        let mut state = self.state.write().await;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| ObjectStoreError::access(format!("NoSuchUpload: {upload_id}")))?;
        upload.parts.insert(number, part);
        Ok(e_tag)
    }

    pub async fn get_object_bytes(&self, bucket: &str, key: &str) -> ObjectStoreResult<Bytes> {
        self.gate().await?;
        let state = self.state.read().await;
        bucket_ref(&state, bucket)?
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| ObjectStoreError::not_found(bucket, key))
    }

    pub async fn ongoing_multipart_uploads(&self) -> Vec<String> {
        self.state.read().await.uploads.keys().cloned().collect()
    }

    async fn gate(&self) -> ObjectStoreResult<()> {
        let (offline, latency) = {
            let state = self.state.read().await;
            (state.offline, state.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if offline {
            return Err(ObjectStoreError::access("backend offline"));
        }
        Ok(())
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, bucket, key)
    }
}

fn bucket_ref<'a>(
    state: &'a State,
    bucket: &str,
) -> ObjectStoreResult<&'a BTreeMap<String, StoredObject>> {
    state
        .buckets
        .get(bucket)
        .ok_or_else(|| ObjectStoreError::access(format!("NoSuchBucket: {bucket}")))
}

fn bucket_mut<'a>(
    state: &'a mut State,
    bucket: &str,
) -> ObjectStoreResult<&'a mut BTreeMap<String, StoredObject>> {
    state
        .buckets
        .get_mut(bucket)
        .ok_or_else(|| ObjectStoreError::access(format!("NoSuchBucket: {bucket}")))
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> ObjectStoreResult<bool> {
        self.gate().await?;
        Ok(self.state.read().await.buckets.contains_key(bucket))
    }

    async fn create_single_presigned_upload_link(
        &self,
        bucket: &str,
        key: &str,
        expiration: Duration,
    ) -> ObjectStoreResult<String> {
        self.gate().await?;
        bucket_ref(&*self.state.read().await, bucket)?;
        Ok(format!(
            "{}?X-Amz-Expires={}",
            self.object_url(bucket, key),
            expiration.as_secs()
        ))
    }

    async fn create_multipart_upload_links(
        &self,
        bucket: &str,
        key: &str,
        file_size: u64,
        expiration: Duration,
    ) -> ObjectStoreResult<MultipartUploadLinks> {
        self.gate().await?;
        let chunk_size = compute_chunk_size(file_size)
            .ok_or_else(|| ObjectStoreError::access(format!("EntityTooLarge: {file_size}")))?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let mut state = self.state.write().await;
        bucket_ref(&state, bucket)?;
        state.uploads.insert(
            upload_id.clone(),
            PendingMultipart {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        let urls = (1..=compute_num_file_chunks(file_size, chunk_size))
            .map(|number| {
                format!(
                    "{}?partNumber={}&uploadId={}&X-Amz-Expires={}",
                    self.object_url(bucket, key),
                    number,
                    upload_id,
                    expiration.as_secs()
                )
            })
            .collect();
        debug!(bucket, key, %upload_id, "initiated multipart upload");
        Ok(MultipartUploadLinks {
            upload_id,
            chunk_size,
            urls,
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> ObjectStoreResult<String> {
        self.gate().await?;
        let mut state = self.state.write().await;
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| ObjectStoreError::access(format!("NoSuchUpload: {upload_id}")))?;

        let mut data = Vec::new();
        let mut digests = Vec::new();
        for part in parts {
            let stored = upload
                .parts
                .get(&part.number)
                .filter(|p| p.e_tag == part.e_tag)
                .ok_or_else(|| {
                    ObjectStoreError::access(format!("InvalidPart: {}", part.number))
                })?;
            data.extend_from_slice(&stored.data);
            digests.extend_from_slice(&md5::compute(&stored.data).0);
        }
        let e_tag = format!("\"{:x}-{}\"", md5::compute(&digests), parts.len());
        state.uploads.remove(upload_id);
        bucket_mut(&mut state, bucket)?.insert(
            key.to_string(),
            StoredObject {
                data: Bytes::from(data),
                e_tag: e_tag.clone(),
                last_modified: Utc::now(),
            },
        );
        Ok(e_tag)
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> ObjectStoreResult<()> {
        self.gate().await?;
        self.state.write().await.uploads.remove(upload_id);
        Ok(())
    }

    async fn create_single_presigned_download_link(
        &self,
        bucket: &str,
        key: &str,
        expiration: Duration,
    ) -> ObjectStoreResult<String> {
        self.gate().await?;
        Ok(format!(
            "{}?X-Amz-Expires={}&response-content-disposition=attachment",
            self.object_url(bucket, key),
            expiration.as_secs()
        ))
    }

    async fn get_object_metadata(
        &self,
        bucket: &str,
        key: &str,
    ) -> ObjectStoreResult<ObjectMetadata> {
        self.gate().await?;
        let state = self.state.read().await;
        bucket_ref(&state, bucket)?
            .get(key)
            .map(|o| ObjectMetadata {
                key: key.to_string(),
                size: o.data.len() as i64,
                last_modified: o.last_modified,
                e_tag: o.e_tag.clone(),
            })
            .ok_or_else(|| ObjectStoreError::not_found(bucket, key))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        params: ListObjectsParams,
    ) -> ObjectStoreResult<ObjectPage> {
        self.gate().await?;
        let state = self.state.read().await;
        let objects = bucket_ref(&state, bucket)?;
        let max_keys = params.max_keys.clamp(1, 1000);

        let mut page = ObjectPage::default();
        let mut emitted = 0usize;
        let mut last_entry: Option<String> = None;
        let mut truncated = false;

        let candidates = objects.iter().filter(|(key, _)| {
            key.starts_with(&params.prefix)
                && match params.continuation_token.as_deref() {
                    Some(token) => {
                        key.as_str() > token && !(token.ends_with('/') && key.starts_with(token))
                    }
                    None => true,
                }
        });

        for (key, object) in candidates {
            let common = if params.delimited {
                compute_common_prefix(key, &params.prefix)
            } else {
                None
            };
            if let Some(common) = &common {
                if page.common_prefixes.last() == Some(common) {
                    continue;
                }
            }
            if emitted == max_keys {
                truncated = true;
                break;
            }
            emitted += 1;
            match common {
                Some(common) => {
                    last_entry = Some(common.clone());
                    page.common_prefixes.push(common);
                }
                None => {
                    last_entry = Some(key.clone());
                    page.objects.push(ObjectMetadata {
                        key: key.clone(),
                        size: object.data.len() as i64,
                        last_modified: object.last_modified,
                        e_tag: object.e_tag.clone(),
                    });
                }
            }
        }

        if truncated {
            page.next_continuation_token = last_entry;
        }
        Ok(page)
    }

    async fn copy_object(
        &self,
        bucket: &str,
        src_key: &str,
        dst_key: &str,
    ) -> ObjectStoreResult<()> {
        self.gate().await?;
        let mut state = self.state.write().await;
        let objects = bucket_mut(&mut state, bucket)?;
        let source = objects
            .get(src_key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::not_found(bucket, src_key))?;
        objects.insert(
            dst_key.to_string(),
            StoredObject {
                last_modified: Utc::now(),
                ..source
            },
        );
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
        self.gate().await?;
        let mut state = self.state.write().await;
        bucket_mut(&mut state, bucket)?.remove(key);
        Ok(())
    }

    async fn delete_objects_by_prefix(&self, bucket: &str, prefix: &str) -> ObjectStoreResult<()> {
        self.gate().await?;
        let mut state = self.state.write().await;
        bucket_mut(&mut state, bucket)?.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    async fn upload_file(&self, bucket: &str, key: &str, path: &Path) -> ObjectStoreResult<()> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|err| ObjectStoreError::access(format!("reading {}: {err}", path.display())))?;
        self.put_object(bucket, key, data).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> MemoryObjectStore {
        let store = MemoryObjectStore::new("http://s3.local");
        store.create_bucket("b").await;
        store
    }

    #[tokio::test]
    async fn metadata_of_missing_key_is_not_found() {
        let store = store().await;
        let err = store.get_object_metadata("b", "nope").await.unwrap_err();
        assert!(err.is_not_found());

        store.put_object("b", "k", "hello").await.unwrap();
        let meta = store.get_object_metadata("b", "k").await.unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.e_tag, entity_tag(b"hello"));
    }

    #[tokio::test]
    async fn multipart_upload_round_trip() {
        let store = store().await;
        let links = store
            .create_multipart_upload_links("b", "big", 150 * crate::constants::MIB, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(links.urls.len(), 15);

        let e1 = store.upload_part(&links.upload_id, 1, "part-1").await.unwrap();
        let e2 = store.upload_part(&links.upload_id, 2, "part-2").await.unwrap();
        let parts = vec![
            UploadedPart { number: 1, e_tag: e1 },
            UploadedPart { number: 2, e_tag: e2 },
        ];
        let e_tag = store
            .complete_multipart_upload("b", "big", &links.upload_id, &parts)
            .await
            .unwrap();
        assert!(e_tag.ends_with("-2\""));
        assert_eq!(store.get_object_bytes("b", "big").await.unwrap(), "part-1part-2");
        assert!(store.ongoing_multipart_uploads().await.is_empty());
    }

    #[tokio::test]
    async fn delimited_listing_paginates_without_duplicates() {
        let store = store().await;
        for key in ["d/a", "d/b", "d/sub/1", "d/sub/2", "d/z"] {
            store.put_object("b", key, "x").await.unwrap();
        }

        let mut seen = Vec::new();
        let mut token = None;
        loop {
            let page = store
                .list_objects(
                    "b",
                    ListObjectsParams {
                        prefix: "d/".into(),
                        delimited: true,
                        continuation_token: token.clone(),
                        max_keys: 2,
                    },
                )
                .await
                .unwrap();
            seen.extend(page.objects.into_iter().map(|o| o.key));
            seen.extend(page.common_prefixes);
            match page.next_continuation_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["d/a", "d/b", "d/sub/", "d/z"]);
    }

    #[tokio::test]
    async fn offline_backend_reports_access_errors() {
        let store = store().await;
        store.set_offline(true).await;
        let err = store.bucket_exists("b").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::Access { .. }));
    }
}
