//! `ObjectStore` backed by the AWS SDK, for AWS S3 and S3-compatible servers
//! such as MinIO.

use crate::{
    config::S3Settings,
    constants::MAX_SINGLE_LINK_BYTE_SIZE,
    models::{MultipartUploadLinks, UploadedPart},
    s3::{
        FilePart, ListObjectsParams, ObjectMetadata, ObjectPage, ObjectStore, ObjectStoreError,
        ObjectStoreResult, compute_chunk_size, compute_num_file_chunks, plan_file_parts,
    },
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    config::{Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata},
    presigning::PresigningConfig,
    primitives::{ByteStream, Length},
    types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier},
};
use chrono::{DateTime, Utc};
use std::{future::Future, path::Path, time::Duration};
use tracing::{debug, info, warn};

/// Objects removed per `DeleteObjects` request (the S3 maximum).
const DELETE_BATCH_SIZE: usize = 1000;

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    retry_attempts: u32,
    attempt_timeout: Duration,
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("retry_attempts", &self.retry_attempts)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

fn access_error<E>(err: E) -> ObjectStoreError
where
    E: std::error::Error,
{
    ObjectStoreError::access(DisplayErrorContext(&err).to_string())
}

fn to_chrono(value: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    value
        .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

fn presigning_config(expiration: Duration) -> ObjectStoreResult<PresigningConfig> {
    PresigningConfig::expires_in(expiration).map_err(access_error)
}

impl S3ObjectStore {
    pub async fn connect(settings: &S3Settings) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let (Some(access_key), Some(secret_key)) = (&settings.access_key, &settings.secret_key) {
            builder = builder.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "storage-dsm",
            ));
        }
        if let Some(endpoint) = &settings.endpoint {
            // MinIO and friends need path-style addressing
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        info!(endpoint = ?settings.endpoint, region = %settings.region, "s3 client initialised");
        Self {
            client: Client::from_conf(builder.build()),
            retry_attempts: settings.retry_attempts.max(1),
            attempt_timeout: settings.attempt_timeout,
        }
    }

    /// Run `call` with a per-attempt timeout, retrying access errors with
    /// exponential backoff. Missing keys are returned immediately.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> ObjectStoreResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = ObjectStoreResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.attempt_timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ObjectStoreError::access(format!(
                    "{operation} timed out after {:?}",
                    self.attempt_timeout
                ))),
            };
            match outcome {
                Err(ObjectStoreError::Access { message }) if attempt < self.retry_attempts => {
                    warn!(operation, attempt, error = %message, "s3 call failed, retrying");
                    tokio::time::sleep(Duration::from_millis(50 * 2u64.pow(attempt))).await;
                }
                other => return other,
            }
        }
    }

    async fn start_multipart_upload(&self, bucket: &str, key: &str) -> ObjectStoreResult<String> {
        let client = &self.client;
        self.with_retry("create_multipart_upload", move || async move {
            let out = client
                .create_multipart_upload()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(access_error)?;
            out.upload_id()
                .map(str::to_string)
                .ok_or_else(|| ObjectStoreError::access("missing upload id"))
        })
        .await
    }

    /// Send each byte range of `path` as one part. Parts are not retried
    /// under the attempt timeout, which is sized for metadata calls.
    async fn upload_file_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        path: &Path,
        parts: &[FilePart],
    ) -> ObjectStoreResult<Vec<UploadedPart>> {
        let mut uploaded = Vec::with_capacity(parts.len());
        for part in parts {
            let body = ByteStream::read_from()
                .path(path)
                .offset(part.offset)
                .length(Length::Exact(part.length))
                .build()
                .await
                .map_err(access_error)?;
            let out = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part.number)
                .body(body)
                .send()
                .await
                .map_err(access_error)?;
            let e_tag = out.e_tag().map(str::to_string).ok_or_else(|| {
                ObjectStoreError::access(format!("missing entity tag for part {}", part.number))
            })?;
            uploaded.push(UploadedPart {
                number: part.number,
                e_tag,
            });
        }
        Ok(uploaded)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> ObjectStoreResult<bool> {
        let client = &self.client;
        self.with_retry("head_bucket", move || async move {
            match client.head_bucket().bucket(bucket).send().await {
                Ok(_) => Ok(true),
                Err(err) => {
                    let service_err = err.into_service_error();
                    if service_err.is_not_found() {
                        Ok(false)
                    } else {
                        Err(access_error(service_err))
                    }
                }
            }
        })
        .await
    }

    async fn create_single_presigned_upload_link(
        &self,
        bucket: &str,
        key: &str,
        expiration: Duration,
    ) -> ObjectStoreResult<String> {
        let presigned = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config(expiration)?)
            .await
            .map_err(access_error)?;
        Ok(presigned.uri().to_string())
    }

    async fn create_multipart_upload_links(
        &self,
        bucket: &str,
        key: &str,
        file_size: u64,
        expiration: Duration,
    ) -> ObjectStoreResult<MultipartUploadLinks> {
        let chunk_size = compute_chunk_size(file_size)
            .ok_or_else(|| ObjectStoreError::access(format!("EntityTooLarge: {file_size}")))?;
        let upload_id = self.start_multipart_upload(bucket, key).await?;

        let mut urls = Vec::new();
        for part_number in 1..=compute_num_file_chunks(file_size, chunk_size) {
            let part_number = i32::try_from(part_number)
                .map_err(|_| ObjectStoreError::access("part number overflow"))?;
            let presigned = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .presigned(presigning_config(expiration)?)
                .await
                .map_err(access_error)?;
            urls.push(presigned.uri().to_string());
        }
        debug!(bucket, key, %upload_id, parts = urls.len(), "initiated multipart upload");
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
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(p.number)
                            .e_tag(&p.e_tag)
                            .build()
                    })
                    .collect(),
            ))
            .build();
        let client = &self.client;
        self.with_retry("complete_multipart_upload", move || {
            let completed = completed.clone();
            async move {
                let out = client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(access_error)?;
                Ok(out.e_tag().unwrap_or_default().to_string())
            }
        })
        .await
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> ObjectStoreResult<()> {
        let client = &self.client;
        self.with_retry("abort_multipart_upload", move || async move {
            match client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(err) => {
                    let service_err = err.into_service_error();
                    if service_err.is_no_such_upload() {
                        Ok(())
                    } else {
                        Err(access_error(service_err))
                    }
                }
            }
        })
        .await
    }

    async fn create_single_presigned_download_link(
        &self,
        bucket: &str,
        key: &str,
        expiration: Duration,
    ) -> ObjectStoreResult<String> {
        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config(expiration)?)
            .await
            .map_err(access_error)?;
        Ok(presigned.uri().to_string())
    }

    async fn get_object_metadata(
        &self,
        bucket: &str,
        key: &str,
    ) -> ObjectStoreResult<ObjectMetadata> {
        let client = &self.client;
        self.with_retry("head_object", move || async move {
            match client.head_object().bucket(bucket).key(key).send().await {
                Ok(out) => Ok(ObjectMetadata {
                    key: key.to_string(),
                    size: out.content_length().unwrap_or_default(),
                    last_modified: to_chrono(out.last_modified()),
                    e_tag: out.e_tag().unwrap_or_default().to_string(),
                }),
                Err(err) => {
                    let service_err = err.into_service_error();
                    if service_err.is_not_found() {
                        Err(ObjectStoreError::not_found(bucket, key))
                    } else {
                        Err(access_error(service_err))
                    }
                }
            }
        })
        .await
    }

    async fn list_objects(
        &self,
        bucket: &str,
        params: ListObjectsParams,
    ) -> ObjectStoreResult<ObjectPage> {
        let client = &self.client;
        let params = &params;
        self.with_retry("list_objects_v2", move || async move {
            let mut request = client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(&params.prefix)
                .max_keys(params.max_keys.clamp(1, 1000) as i32);
            if params.delimited {
                request = request.delimiter("/");
            }
            if let Some(token) = &params.continuation_token {
                request = request.continuation_token(token);
            }
            let response = request.send().await.map_err(access_error)?;

            let objects = response
                .contents()
                .iter()
                .map(|obj| ObjectMetadata {
                    key: obj.key().unwrap_or_default().to_string(),
                    size: obj.size().unwrap_or_default(),
                    last_modified: to_chrono(obj.last_modified()),
                    e_tag: obj.e_tag().unwrap_or_default().to_string(),
                })
                .collect();
            let common_prefixes = response
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix().map(str::to_string))
                .collect();
            let next_continuation_token = if response.is_truncated() == Some(true) {
                response.next_continuation_token().map(str::to_string)
            } else {
                None
            };
            Ok(ObjectPage {
                objects,
                common_prefixes,
                next_continuation_token,
            })
        })
        .await
    }

    async fn copy_object(
        &self,
        bucket: &str,
        src_key: &str,
        dst_key: &str,
    ) -> ObjectStoreResult<()> {
        let client = &self.client;
        let copy_source = format!("{bucket}/{src_key}");
        let copy_source = &copy_source;
        self.with_retry("copy_object", move || async move {
            match client
                .copy_object()
                .bucket(bucket)
                .copy_source(copy_source)
                .key(dst_key)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(err) => {
                    let service_err = err.into_service_error();
                    if service_err.code() == Some("NoSuchKey") {
                        Err(ObjectStoreError::not_found(bucket, src_key))
                    } else {
                        Err(access_error(service_err))
                    }
                }
            }
        })
        .await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
        let client = &self.client;
        self.with_retry("delete_object", move || async move {
            client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map(|_| ())
                .map_err(access_error)
        })
        .await
    }

    async fn delete_objects_by_prefix(&self, bucket: &str, prefix: &str) -> ObjectStoreResult<()> {
        let keys: Vec<String> = self
            .list_all_objects(bucket, prefix, None)
            .await?
            .into_iter()
            .map(|o| o.key)
            .collect();
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            let identifiers = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build().map_err(access_error))
                .collect::<ObjectStoreResult<Vec<_>>>()?;
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .quiet(true)
                .build()
                .map_err(access_error)?;
            let client = &self.client;
            let delete = &delete;
            self.with_retry("delete_objects", move || async move {
                client
                    .delete_objects()
                    .bucket(bucket)
                    .delete(delete.clone())
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(access_error)
            })
            .await?;
        }
        debug!(bucket, prefix, removed = keys.len(), "deleted objects by prefix");
        Ok(())
    }

    async fn upload_file(&self, bucket: &str, key: &str, path: &Path) -> ObjectStoreResult<()> {
        let file_size = tokio::fs::metadata(path).await.map_err(access_error)?.len();
        let Some(parts) = plan_file_parts(file_size, MAX_SINGLE_LINK_BYTE_SIZE)? else {
            let body = ByteStream::from_path(path).await.map_err(access_error)?;
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(access_error)?;
            return Ok(());
        };

        let upload_id = self.start_multipart_upload(bucket, key).await?;
        let uploaded = match self
            .upload_file_parts(bucket, key, &upload_id, path, &parts)
            .await
        {
            Ok(uploaded) => uploaded,
            Err(err) => {
                if let Err(abort_err) = self.abort_multipart_upload(bucket, key, &upload_id).await {
                    warn!(bucket, key, %upload_id, error = %abort_err, "could not abort multipart upload");
                }
                return Err(err);
            }
        };
        self.complete_multipart_upload(bucket, key, &upload_id, &uploaded)
            .await?;
        info!(bucket, key, file_size, parts = uploaded.len(), "uploaded file in parts");
        Ok(())
    }
}
