//! HTTP client of the datcore adapter, the service fronting the external
//! dataset backend. Every call carries the user's API key and secret.

use crate::{
    db::DatCoreCredentials,
    models::DatasetMetaData,
    services::error::{StorageError, StorageResult},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Method, RequestBuilder, Url};
use serde::{Deserialize, de::DeserializeOwned};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

const DATASETS_PAGE_SIZE: usize = 100;

/// One file of a dataset, as returned by the legacy listing.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct DatCoreFile {
    pub path: String,
    pub dataset_id: String,
    pub name: String,
    pub package_id: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct PackageFile {
    pub package_id: String,
    pub name: String,
    pub display_path: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct DatasetItem {
    id: String,
    display_name: String,
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(default)]
    total: Option<i64>,
}

#[derive(Deserialize)]
struct DownloadLink {
    link: String,
}

fn adapter_error(err: reqwest::Error) -> StorageError {
    if err.is_timeout() {
        StorageError::DatCoreAdapter(format!("datcore adapter timed out: {err}"))
    } else if let Some(status) = err.status() {
        StorageError::DatCoreAdapter(format!("forwarded call failed with status {status}"))
    } else {
        StorageError::DatCoreAdapter(format!("unexpected request error: {err}"))
    }
}

#[derive(Clone, Debug)]
pub struct DatCoreAdapterClient {
    base_url: String,
    http: reqwest::Client,
}

impl DatCoreAdapterClient {
    pub fn new(base_url: &str, timeout: Duration) -> StorageResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(adapter_error)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn request(&self, credentials: &DatCoreCredentials, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-datcore-api-key", &credentials.api_key)
            .header("x-datcore-api-secret", &credentials.api_secret)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        credentials: &DatCoreCredentials,
        path: &str,
        query: &[(&str, String)],
    ) -> StorageResult<T> {
        self.request(credentials, Method::GET, path)
            .query(query)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(adapter_error)?
            .json()
            .await
            .map_err(adapter_error)
    }

    pub async fn check_service_health(&self) -> bool {
        match self
            .http
            .get(format!("{}/ready", self.base_url))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "datcore adapter not ready");
                false
            }
        }
    }

    /// Whether the credentials are accepted by the backend.
    pub async fn check_user_can_connect(&self, credentials: &DatCoreCredentials) -> bool {
        if credentials.api_key.is_empty() || credentials.api_secret.is_empty() {
            return false;
        }
        self.get_json::<serde_json::Value>(credentials, "/user/profile", &[])
            .await
            .is_ok()
    }

    /// All datasets of the user, walking the pages until an empty one.
    pub async fn list_all_datasets(
        &self,
        credentials: &DatCoreCredentials,
    ) -> StorageResult<Vec<DatasetMetaData>> {
        let mut datasets = Vec::new();
        let mut page = 1usize;
        loop {
            let response: Page<DatasetItem> = self
                .get_json(
                    credentials,
                    "/datasets",
                    &[("page", page.to_string()), ("size", DATASETS_PAGE_SIZE.to_string())],
                )
                .await?;
            if response.items.is_empty() {
                break;
            }
            debug!(page, received = response.items.len(), total = ?response.total, "datasets page");
            datasets.extend(response.items.into_iter().map(|item| DatasetMetaData {
                dataset_id: item.id,
                display_name: item.display_name,
            }));
            if response
                .total
                .is_some_and(|total| datasets.len() as i64 >= total)
            {
                break;
            }
            page += 1;
        }
        Ok(datasets)
    }

    pub async fn list_dataset_files(
        &self,
        credentials: &DatCoreCredentials,
        dataset_id: &str,
    ) -> StorageResult<Vec<DatCoreFile>> {
        self.get_json(credentials, &format!("/datasets/{dataset_id}/files_legacy"), &[])
            .await
    }

    pub async fn get_package_files(
        &self,
        credentials: &DatCoreCredentials,
        package_id: &str,
    ) -> StorageResult<Vec<PackageFile>> {
        self.get_json(credentials, &format!("/packages/{package_id}/files"), &[])
            .await
    }

    pub async fn get_file_download_link(
        &self,
        credentials: &DatCoreCredentials,
        file_id: &str,
    ) -> StorageResult<String> {
        let link: DownloadLink = self
            .get_json(credentials, &format!("/files/{file_id}"), &[])
            .await?;
        Ok(link.link)
    }

    pub async fn delete_file(&self, credentials: &DatCoreCredentials, file_id: &str) -> StorageResult<()> {
        self.request(credentials, Method::DELETE, &format!("/files/{file_id}"))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(adapter_error)?;
        Ok(())
    }

    /// Stream `link` into `dir`, naming the file after the link's last path
    /// segment. Returns the written path.
    pub async fn download(&self, link: &str, dir: &Path) -> StorageResult<PathBuf> {
        let url = Url::parse(link)
            .map_err(|err| StorageError::DatCoreAdapter(format!("invalid download link: {err}")))?;
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| StorageError::DatCoreAdapter(format!("no file name in `{link}`")))?
            .to_string();
        let target = dir.join(&file_name);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(adapter_error)?;
        let body = response.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other));
        let reader = StreamReader::new(body);
        tokio::pin!(reader);
        let mut file = File::create(&target).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        if written == 0 {
            warn!(file_name, "downloaded an empty file from datcore");
        }
        debug!(file_name, written, "datcore download complete");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::Query,
        http::{HeaderMap, StatusCode},
        routing::get,
    };
    use serde_json::json;
    use std::collections::HashMap;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn credentials() -> DatCoreCredentials {
        DatCoreCredentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
        }
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("x-datcore-api-key").is_some_and(|v| v == "key")
            && headers.get("x-datcore-api-secret").is_some_and(|v| v == "secret")
    }

    #[tokio::test]
    async fn datasets_are_collected_across_pages() {
        let router = Router::new().route(
            "/datasets",
            get(
                |headers: HeaderMap, Query(query): Query<HashMap<String, String>>| async move {
                    if !authorized(&headers) {
                        return Err(StatusCode::UNAUTHORIZED);
                    }
                    let items = match query.get("page").map(String::as_str) {
                        Some("1") => json!([{"id": "N:dataset:1", "display_name": "one"}]),
                        Some("2") => json!([{"id": "N:dataset:2", "display_name": "two"}]),
                        _ => json!([]),
                    };
                    Ok(Json(json!({"items": items})))
                },
            ),
        );
        let client = DatCoreAdapterClient::new(&serve(router).await, Duration::from_secs(5)).unwrap();

        let datasets = client.list_all_datasets(&credentials()).await.unwrap();
        let ids: Vec<&str> = datasets.iter().map(|d| d.dataset_id.as_str()).collect();
        assert_eq!(ids, vec!["N:dataset:1", "N:dataset:2"]);

        let wrong = DatCoreCredentials {
            api_key: "other".into(),
            api_secret: "secret".into(),
        };
        assert!(matches!(
            client.list_all_datasets(&wrong).await,
            Err(StorageError::DatCoreAdapter(_))
        ));
        assert!(!client.check_user_can_connect(&wrong).await);
    }

    #[tokio::test]
    async fn downloads_follow_the_link_file_name() {
        let router = Router::new()
            .route("/ready", get(|| async { "ok" }))
            .route("/blobs/report.csv", get(|| async { "a,b\n1,2\n" }));
        let base = serve(router).await;
        let client = DatCoreAdapterClient::new(&base, Duration::from_secs(5)).unwrap();
        assert!(client.check_service_health().await);

        let dir = tempfile::tempdir().unwrap();
        let path = client
            .download(&format!("{base}/blobs/report.csv"), dir.path())
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("report.csv"));
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "a,b\n1,2\n");
    }

    #[tokio::test]
    async fn unreachable_adapters_are_unhealthy() {
        let client = DatCoreAdapterClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        assert!(!client.check_service_health().await);
        assert!(matches!(
            client.get_file_download_link(&credentials(), "N:package:1").await,
            Err(StorageError::DatCoreAdapter(_))
        ));
    }
}
