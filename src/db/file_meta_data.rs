//! Repository over the `file_meta_data` catalog table.

use crate::{
    db::is_unique_violation,
    models::{FileMetaData, NodeId, ProjectId, UserId},
    services::error::{StorageError, StorageResult},
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;

const FMD_COLUMNS: &str = "file_id, location_id, location_name, bucket_name, object_name, \
     project_id, node_id, user_id, created_at, last_modified, file_size, entity_tag, \
     sha256_checksum, upload_id, upload_expires_at, is_soft_link, is_directory";

/// Selection used by listings and searches.
///
/// Scope: when `user_id` and/or `project_ids` are set, a row matches if it is
/// a project-less row owned by the user or belongs to one of the projects.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub user_id: Option<UserId>,
    pub project_ids: Option<Vec<ProjectId>>,
    pub file_id_prefix: Option<String>,
    pub partial_file_id: Option<String>,
    pub sha256_checksum: Option<String>,
    pub is_directory: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Clone)]
pub struct FileMetaDataRepository {
    db: Arc<SqlitePool>,
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn like_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl FileMetaDataRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    pub async fn get(&self, file_id: &str) -> StorageResult<FileMetaData> {
        sqlx::query_as::<_, FileMetaData>(&format!(
            "SELECT {FMD_COLUMNS} FROM file_meta_data WHERE file_id = ?"
        ))
        .bind(file_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::file_not_found(file_id),
            other => StorageError::Sqlx(other),
        })
    }

    pub async fn try_get(&self, file_id: &str) -> StorageResult<Option<FileMetaData>> {
        match self.get(file_id).await {
            Ok(fmd) => Ok(Some(fmd)),
            Err(StorageError::FileMetaDataNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn exists(&self, file_id: &str) -> StorageResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM file_meta_data WHERE file_id = ?")
                .bind(file_id)
                .fetch_optional(&*self.db)
                .await?;
        Ok(found.is_some())
    }

    /// Insert or replace the whole row keyed on `file_id`.
    pub async fn upsert(&self, fmd: &FileMetaData) -> StorageResult<FileMetaData> {
        self.write_row(fmd, true).await
    }

    /// Strict insert; an existing `file_id` yields `LinkAlreadyExists`.
    pub async fn insert(&self, fmd: &FileMetaData) -> StorageResult<FileMetaData> {
        match self.write_row(fmd, false).await {
            Err(StorageError::Sqlx(err)) if is_unique_violation(&err) => {
                Err(StorageError::LinkAlreadyExists {
                    file_id: fmd.file_id.clone(),
                })
            }
            other => other,
        }
    }

    async fn write_row(&self, fmd: &FileMetaData, replace: bool) -> StorageResult<FileMetaData> {
        let on_conflict = if replace {
            "ON CONFLICT(file_id) DO UPDATE SET
                location_id = excluded.location_id,
                location_name = excluded.location_name,
                bucket_name = excluded.bucket_name,
                object_name = excluded.object_name,
                project_id = excluded.project_id,
                node_id = excluded.node_id,
                user_id = excluded.user_id,
                created_at = excluded.created_at,
                last_modified = excluded.last_modified,
                file_size = excluded.file_size,
                entity_tag = excluded.entity_tag,
                sha256_checksum = excluded.sha256_checksum,
                upload_id = excluded.upload_id,
                upload_expires_at = excluded.upload_expires_at,
                is_soft_link = excluded.is_soft_link,
                is_directory = excluded.is_directory"
        } else {
            ""
        };
        let sql = format!(
            "INSERT INTO file_meta_data ({FMD_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             {on_conflict}
             RETURNING {FMD_COLUMNS}"
        );
        let row = sqlx::query_as::<_, FileMetaData>(&sql)
            .bind(&fmd.file_id)
            .bind(fmd.location_id)
            .bind(&fmd.location_name)
            .bind(&fmd.bucket_name)
            .bind(&fmd.object_name)
            .bind(fmd.project_id)
            .bind(fmd.node_id)
            .bind(fmd.user_id)
            .bind(fmd.created_at)
            .bind(fmd.last_modified)
            .bind(fmd.file_size)
            .bind(&fmd.entity_tag)
            .bind(&fmd.sha256_checksum)
            .bind(&fmd.upload_id)
            .bind(fmd.upload_expires_at)
            .bind(fmd.is_soft_link)
            .bind(fmd.is_directory)
            .fetch_one(&*self.db)
            .await?;
        Ok(row)
    }

    /// Rows matching `filter`, oldest first.
    pub async fn list_filtered(&self, filter: &ListFilter) -> StorageResult<Vec<FileMetaData>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {FMD_COLUMNS} FROM file_meta_data WHERE 1 = 1"
        ));

        match (filter.user_id, filter.project_ids.as_deref()) {
            (None, None) => {}
            (user_id, project_ids) => {
                builder.push(" AND (0 = 1");
                if let Some(user_id) = user_id {
                    builder.push(" OR (project_id IS NULL AND user_id = ");
                    builder.push_bind(user_id);
                    builder.push(")");
                }
                if let Some(ids) = project_ids.filter(|ids| !ids.is_empty()) {
                    builder.push(" OR project_id IN (");
                    let mut separated = builder.separated(", ");
                    for id in ids {
                        separated.push_bind(*id);
                    }
                    separated.push_unseparated(")");
                }
                builder.push(")");
            }
        }

        if let Some(prefix) = &filter.file_id_prefix {
            builder.push(" AND file_id LIKE ");
            builder.push_bind(format!("{}%", like_escape(prefix)));
            builder.push(" ESCAPE '\\'");
        }
        if let Some(partial) = &filter.partial_file_id {
            builder.push(" AND file_id LIKE ");
            builder.push_bind(format!("%{}%", like_escape(partial)));
            builder.push(" ESCAPE '\\'");
        }
        if let Some(sha256) = &filter.sha256_checksum {
            builder.push(" AND sha256_checksum = ");
            builder.push_bind(sha256.clone());
        }
        if let Some(is_directory) = filter.is_directory {
            builder.push(" AND is_directory = ");
            builder.push_bind(is_directory);
        }

        builder.push(" ORDER BY created_at ASC, file_id ASC LIMIT ");
        builder.push_bind(filter.limit.unwrap_or(-1));
        if let Some(offset) = filter.offset {
            builder.push(" OFFSET ");
            builder.push_bind(offset);
        }

        let rows = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    /// All rows of a project, or of one node of it.
    pub async fn list_for_project(
        &self,
        project_id: ProjectId,
        node_id: Option<NodeId>,
    ) -> StorageResult<Vec<FileMetaData>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {FMD_COLUMNS} FROM file_meta_data WHERE project_id = "
        ));
        builder.push_bind(project_id);
        if let Some(node_id) = node_id {
            builder.push(" AND node_id = ");
            builder.push_bind(node_id);
        }
        builder.push(" ORDER BY file_id ASC");
        let rows = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    /// Pending rows whose upload window closed before `before`.
    pub async fn list_expired(&self, before: DateTime<Utc>) -> StorageResult<Vec<FileMetaData>> {
        let rows = sqlx::query_as::<_, FileMetaData>(&format!(
            "SELECT {FMD_COLUMNS} FROM file_meta_data
             WHERE upload_expires_at IS NOT NULL AND upload_expires_at < ?
             ORDER BY upload_expires_at ASC"
        ))
        .bind(before)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Finalised rows of one location, in `file_id` order.
    pub async fn list_finalized(&self, location_id: i64) -> StorageResult<Vec<FileMetaData>> {
        let rows = sqlx::query_as::<_, FileMetaData>(&format!(
            "SELECT {FMD_COLUMNS} FROM file_meta_data
             WHERE upload_expires_at IS NULL AND location_id = ?
             ORDER BY file_id ASC"
        ))
        .bind(location_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// The registered directory rows among `candidates`, innermost first
    /// when `candidates` is ordered that way.
    pub async fn find_directories(&self, candidates: &[String]) -> StorageResult<Vec<FileMetaData>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {FMD_COLUMNS} FROM file_meta_data WHERE is_directory = 1 AND file_id IN ("
        ));
        let mut separated = builder.separated(", ");
        for id in candidates {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");
        let mut rows: Vec<FileMetaData> = builder.build_query_as().fetch_all(&*self.db).await?;
        rows.sort_by_key(|row| {
            candidates
                .iter()
                .position(|c| *c == row.file_id)
                .unwrap_or(usize::MAX)
        });
        Ok(rows)
    }

    /// Other rows pointing at the same physical object.
    pub async fn count_links_to_object(
        &self,
        bucket_name: &str,
        object_name: &str,
        excluding_file_id: &str,
    ) -> StorageResult<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM file_meta_data
             WHERE bucket_name = ? AND object_name = ? AND file_id != ?",
        )
        .bind(bucket_name)
        .bind(object_name)
        .bind(excluding_file_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    pub async fn delete(&self, file_ids: &[String]) -> StorageResult<u64> {
        if file_ids.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM file_meta_data WHERE file_id IN (");
        let mut separated = builder.separated(", ");
        for id in file_ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");
        let result = builder.build().execute(&*self.db).await?;
        Ok(result.rows_affected())
    }

    /// Delete one row and, in the same transaction, mark the size of its
    /// enclosing directory row (if any) as unknown.
    pub async fn delete_and_invalidate_directory(
        &self,
        file_id: &str,
        directory_file_id: Option<&str>,
    ) -> StorageResult<u64> {
        let mut tx = self.db.begin().await?;
        let result = sqlx::query("DELETE FROM file_meta_data WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        if let Some(directory) = directory_file_id {
            sqlx::query(
                "UPDATE file_meta_data SET file_size = -1 WHERE file_id = ? AND is_directory = 1",
            )
            .bind(directory)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_all_for_project(&self, project_id: ProjectId) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM file_meta_data WHERE project_id = ?")
            .bind(project_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_all_for_node(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
    ) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM file_meta_data WHERE project_id = ? AND node_id = ?")
            .bind(project_id)
            .bind(node_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> StorageResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM file_meta_data")
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::connect_in_memory, models::StorageFileId};
    use chrono::Duration;
    use uuid::Uuid;

    async fn repo() -> FileMetaDataRepository {
        FileMetaDataRepository::new(Arc::new(connect_in_memory().await.unwrap()))
    }

    fn pending(file_id: &str, user_id: UserId) -> FileMetaData {
        let id = StorageFileId::parse(file_id).unwrap();
        let now = Utc::now();
        FileMetaData::new_pending(&id, "bucket", user_id, None, false, now, now + Duration::hours(1))
    }

    #[tokio::test]
    async fn upsert_replaces_the_whole_row() {
        let repo = repo().await;
        let project = Uuid::new_v4();
        let file_id = format!("{project}/{}/a.txt", Uuid::new_v4());

        let first = repo.upsert(&pending(&file_id, 1)).await.unwrap();
        let mut second = pending(&file_id, 1);
        second.upload_expires_at = first.upload_expires_at.map(|t| t + Duration::minutes(5));
        second.sha256_checksum = Some("abc".into());
        let stored = repo.upsert(&second).await.unwrap();

        assert_eq!(repo.count().await.unwrap(), 1);
        assert_eq!(stored.upload_expires_at, second.upload_expires_at);
        assert_eq!(stored.sha256_checksum.as_deref(), Some("abc"));
        assert_eq!(stored.project_id, Some(project));
    }

    #[tokio::test]
    async fn strict_insert_refuses_existing_ids() {
        let repo = repo().await;
        let fmd = pending("api/x/file.bin", 1);
        repo.insert(&fmd).await.unwrap();
        assert!(matches!(
            repo.insert(&fmd).await,
            Err(StorageError::LinkAlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn get_missing_row_is_not_found() {
        let repo = repo().await;
        assert!(matches!(
            repo.get("p/n/missing").await,
            Err(StorageError::FileMetaDataNotFound { .. })
        ));
        assert!(!repo.exists("p/n/missing").await.unwrap());
    }

    #[tokio::test]
    async fn list_filtered_scopes_by_owner_and_projects() {
        let repo = repo().await;
        let readable = Uuid::new_v4();
        let hidden = Uuid::new_v4();
        repo.upsert(&pending(&format!("{readable}/{}/a_1.txt", Uuid::new_v4()), 2))
            .await
            .unwrap();
        repo.upsert(&pending(&format!("{hidden}/{}/b.txt", Uuid::new_v4()), 1))
            .await
            .unwrap();
        repo.upsert(&pending("api/mine/c.txt", 1)).await.unwrap();
        repo.upsert(&pending("api/theirs/d.txt", 2)).await.unwrap();

        let filter = ListFilter {
            user_id: Some(1),
            project_ids: Some(vec![readable]),
            ..Default::default()
        };
        let ids: Vec<String> = repo
            .list_filtered(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.file_id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().any(|id| id.starts_with(&readable.to_string())));
        assert!(ids.contains(&"api/mine/c.txt".to_string()));

        let partial = ListFilter {
            partial_file_id: Some("a_1".into()),
            ..filter.clone()
        };
        assert_eq!(repo.list_filtered(&partial).await.unwrap().len(), 1);

        // '_' must not act as a wildcard
        let wildcard = ListFilter {
            partial_file_id: Some("a_2".into()),
            ..filter
        };
        assert!(repo.list_filtered(&wildcard).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_expired_returns_only_overdue_pending_rows() {
        let repo = repo().await;
        let now = Utc::now();

        let mut overdue = pending("api/x/overdue", 1);
        overdue.upload_expires_at = Some(now - Duration::minutes(1));
        repo.upsert(&overdue).await.unwrap();

        repo.upsert(&pending("api/x/fresh", 1)).await.unwrap();

        let mut done = pending("api/x/done", 1);
        done.upload_expires_at = None;
        repo.upsert(&done).await.unwrap();

        let expired = repo.list_expired(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].file_id, "api/x/overdue");
    }

    #[tokio::test]
    async fn deleting_inside_a_directory_invalidates_its_size() {
        let repo = repo().await;
        let mut dir = pending("p/n/dir", 1);
        dir.is_directory = true;
        dir.file_size = 42;
        dir.upload_expires_at = None;
        repo.upsert(&dir).await.unwrap();
        repo.upsert(&pending("p/n/dir/file", 1)).await.unwrap();

        let removed = repo
            .delete_and_invalidate_directory("p/n/dir/file", Some("p/n/dir"))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.get("p/n/dir").await.unwrap().file_size, -1);
    }

    #[tokio::test]
    async fn bulk_deletes_are_scoped() {
        let repo = repo().await;
        let project = Uuid::new_v4();
        let node_a = Uuid::new_v4();
        let node_b = Uuid::new_v4();
        repo.upsert(&pending(&format!("{project}/{node_a}/1"), 1)).await.unwrap();
        repo.upsert(&pending(&format!("{project}/{node_b}/2"), 1)).await.unwrap();
        repo.upsert(&pending("api/x/3", 1)).await.unwrap();

        assert_eq!(repo.delete_all_for_node(project, node_a).await.unwrap(), 1);
        assert_eq!(repo.list_for_project(project, None).await.unwrap().len(), 1);
        assert_eq!(repo.delete_all_for_project(project).await.unwrap(), 1);
        assert_eq!(repo.count().await.unwrap(), 1);
    }
}
