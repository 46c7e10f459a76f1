#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use sqlx::SqlitePool;
use storage_dsm::{
    config::StorageSettings,
    db::connect_in_memory,
    handlers::AppState,
    models::{FileMetaData, LinkType, NodeId, ProjectId, UserId},
    routes::routes,
    s3::MemoryObjectStore,
    services::{DataManager, DataManagerProvider, Location, SimcoreS3DataManager, UploadCleaner},
};
use uuid::Uuid;

pub const BUCKET: &str = "simcore";
/// Scheme and host of the links the in-memory store hands out.
pub const STORE_ORIGIN: &str = "http://s3.local";

/// A service wired against an in-memory database and object store.
pub struct Harness {
    pub pool: Arc<SqlitePool>,
    pub store: MemoryObjectStore,
    pub dsm: Arc<SimcoreS3DataManager>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(StorageSettings::new(BUCKET)).await
    }

    pub async fn with_settings(settings: StorageSettings) -> Self {
        let pool = Arc::new(connect_in_memory().await.unwrap());
        let store = MemoryObjectStore::new(format!("{STORE_ORIGIN}{}", routes::MEMORY_STORE_PREFIX));
        store.create_bucket(BUCKET).await;
        let dsm = Arc::new(SimcoreS3DataManager::new(
            pool.clone(),
            Arc::new(store.clone()),
            settings,
        ));
        Self { pool, store, dsm }
    }

    pub fn cleaner(&self) -> UploadCleaner {
        UploadCleaner::new(self.dsm.clone(), self.pool.clone())
    }

    pub fn app(&self) -> Router {
        let mut locations = DataManagerProvider::new();
        locations.register_location(Location::SimcoreS3(self.dsm.clone()));
        routes::app_with_memory_store(
            AppState {
                db: self.pool.clone(),
                store: Arc::new(self.store.clone()),
                locations: Arc::new(locations),
                bucket: BUCKET.to_string(),
            },
            self.store.clone(),
        )
    }

    /// A project owned by `owner` with one node.
    pub async fn project(&self, owner: UserId) -> (ProjectId, NodeId) {
        let project = Uuid::new_v4();
        let node = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO projects (uuid, name, prj_owner, access_rights, workbench)
             VALUES (?, 'study', ?, '{}', ?)",
        )
        .bind(project)
        .bind(owner)
        .bind(format!(r#"{{"{node}": {{"label": "solver"}}}}"#))
        .execute(&*self.pool)
        .await
        .unwrap();
        (project, node)
    }

    /// Replace the per-group grants of a project.
    pub async fn share(&self, project: ProjectId, access_rights: &str) {
        sqlx::query("UPDATE projects SET access_rights = ? WHERE uuid = ?")
            .bind(access_rights)
            .bind(project)
            .execute(&*self.pool)
            .await
            .unwrap();
    }

    pub async fn join_group(&self, user_id: UserId, gid: i64) {
        sqlx::query("INSERT INTO user_to_groups (uid, gid) VALUES (?, ?)")
            .bind(user_id)
            .bind(gid)
            .execute(&*self.pool)
            .await
            .unwrap();
    }

    /// Full upload: links, bytes through the link, completion.
    pub async fn upload(&self, user_id: UserId, file_id: &str, data: &'static [u8]) -> FileMetaData {
        self.dsm
            .create_file_upload_links(user_id, file_id, LinkType::Presigned, data.len() as u64, false, None)
            .await
            .unwrap();
        self.store.put_object(BUCKET, file_id, data).await.unwrap();
        self.dsm.complete_file_upload(file_id, user_id, &[]).await.unwrap()
    }

    /// A directory upload holding `count` small files.
    pub async fn directory(&self, user_id: UserId, dir_id: &str, count: usize) {
        self.dsm
            .create_file_upload_links(user_id, dir_id, LinkType::S3, 0, true, None)
            .await
            .unwrap();
        for i in 0..count {
            self.store
                .put_object(BUCKET, &format!("{dir_id}/f{i:03}.txt"), &b"x"[..])
                .await
                .unwrap();
        }
        self.dsm.complete_file_upload(dir_id, user_id, &[]).await.unwrap();
    }

    pub async fn object_exists(&self, key: &str) -> bool {
        self.store.get_object_bytes(BUCKET, key).await.is_ok()
    }
}
