//! Effective access rights of users over projects and files.
//!
//! Rights are never stored; they are derived on every call from the project
//! owner, the project's per-group grants (private workspace) or the grants of
//! its shared workspace. Any ambiguous data denies access.

use crate::{
    db::{FileMetaDataRepository, ProjectRow, ProjectsRepository},
    models::{AccessRights, GroupId, ProjectId, StorageFileId, UserId},
    services::error::{StorageError, StorageResult},
};
use sqlx::{FromRow, SqlitePool};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

#[derive(FromRow)]
struct WorkspaceGrant {
    gid: GroupId,
    read: bool,
    write: bool,
    delete: bool,
}

#[derive(Clone)]
pub struct AccessRightsRepository {
    db: Arc<SqlitePool>,
    projects: ProjectsRepository,
    files: FileMetaDataRepository,
}

impl AccessRightsRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self {
            projects: ProjectsRepository::new(db.clone()),
            files: FileMetaDataRepository::new(db.clone()),
            db,
        }
    }

    async fn user_groups(&self, user_id: UserId) -> StorageResult<Vec<GroupId>> {
        let groups = sqlx::query_scalar("SELECT gid FROM user_to_groups WHERE uid = ?")
            .bind(user_id)
            .fetch_all(&*self.db)
            .await?;
        Ok(groups)
    }

    async fn rights_for_project(
        &self,
        user_id: UserId,
        project: &ProjectRow,
        groups: &[GroupId],
    ) -> StorageResult<AccessRights> {
        if project.prj_owner == user_id {
            return Ok(AccessRights::all());
        }

        match project.workspace_id {
            None => Ok(aggregate_project_grants(project, groups)),
            Some(workspace_id) => {
                let grants = sqlx::query_as::<_, WorkspaceGrant>(
                    "SELECT gid, \"read\", \"write\", \"delete\" FROM workspaces_access_rights
                     WHERE workspace_id = ?",
                )
                .bind(workspace_id)
                .fetch_all(&*self.db)
                .await?;
                Ok(grants
                    .into_iter()
                    .filter(|grant| groups.contains(&grant.gid))
                    .fold(AccessRights::none(), |acc, grant| {
                        acc.merge(AccessRights {
                            read: grant.read,
                            write: grant.write,
                            delete: grant.delete,
                        })
                    }))
            }
        }
    }

    /// Owner gets everything; anybody else gets the OR of the grants of
    /// their groups. A missing project grants nothing.
    pub async fn get_project_access_rights(
        &self,
        user_id: UserId,
        project_id: ProjectId,
    ) -> StorageResult<AccessRights> {
        let Some(project) = self.projects.get(project_id).await? else {
            debug!(%project_id, user_id, "project not found, no access");
            return Ok(AccessRights::none());
        };
        let groups = self.user_groups(user_id).await?;
        self.rights_for_project(user_id, &project, &groups).await
    }

    /// Rights over a file, registered or about to be uploaded.
    pub async fn get_file_access_rights(
        &self,
        user_id: UserId,
        file_id: &StorageFileId,
    ) -> StorageResult<AccessRights> {
        if let Some(fmd) = self.files.try_get(file_id.as_str()).await? {
            return match fmd.project_id {
                Some(project_id) => self.get_project_access_rights(user_id, project_id).await,
                None if fmd.user_id == user_id => Ok(AccessRights::all()),
                None => Ok(AccessRights::none()),
            };
        }

        // not registered yet: infer ownership from the identifier
        if file_id.is_api() {
            return Ok(AccessRights::all());
        }
        if let Some(owner) = file_id.export_owner() {
            return Ok(if owner == user_id {
                AccessRights::all()
            } else {
                AccessRights::none()
            });
        }
        match file_id.project_id() {
            Some(project_id) => self.get_project_access_rights(user_id, project_id).await,
            None => Err(StorageError::InvalidFileIdentifier {
                identifier: file_id.to_string(),
                details: "does not start with a project id".into(),
            }),
        }
    }

    /// Ids of every project `user_id` may read, resolved in one query.
    ///
    /// Mirrors [`Self::get_project_access_rights`]: ownership, then the
    /// project's own grants when it has no workspace, else the workspace
    /// grants. Malformed grant documents grant nothing.
    pub async fn list_readable_project_ids(&self, user_id: UserId) -> StorageResult<Vec<ProjectId>> {
        let readable = sqlx::query_scalar::<_, ProjectId>(READABLE_PROJECTS_SQL)
            .bind(user_id)
            .bind(user_id)
            .bind(user_id)
            .fetch_all(&*self.db)
            .await?;
        debug!(user_id, count = readable.len(), "resolved readable projects");
        Ok(readable)
    }
}

const READABLE_PROJECTS_SQL: &str = r#"
SELECT p.uuid FROM projects p
WHERE p.prj_owner = ?
   OR (
        p.workspace_id IS NULL
        AND json_type(CASE WHEN json_valid(p.access_rights) THEN p.access_rights ELSE '[]' END) = 'object'
        AND NOT EXISTS (
            SELECT 1 FROM json_each(CASE WHEN json_valid(p.access_rights) THEN p.access_rights ELSE '{}' END) bad
            WHERE bad.type <> 'object'
               OR json_type(bad.json, bad.fullkey || '.read') NOT IN ('true', 'false')
               OR json_type(bad.json, bad.fullkey || '.write') NOT IN ('true', 'false')
               OR json_type(bad.json, bad.fullkey || '.delete') NOT IN ('true', 'false')
        )
        AND EXISTS (
            SELECT 1
            FROM json_each(CASE WHEN json_valid(p.access_rights) THEN p.access_rights ELSE '{}' END) grant_
            JOIN user_to_groups g
              ON CAST(CAST(grant_.key AS INTEGER) AS TEXT) = grant_.key
             AND g.gid = CAST(grant_.key AS INTEGER)
            WHERE g.uid = ?
              AND json_extract(grant_.json, grant_.fullkey || '.read') IS 1
        )
      )
   OR (
        p.workspace_id IS NOT NULL
        AND EXISTS (
            SELECT 1
            FROM workspaces_access_rights w
            JOIN user_to_groups g ON g.gid = w.gid
            WHERE w.workspace_id = p.workspace_id
              AND g.uid = ?
              AND w."read" <> 0
        )
      )
"#;

/// OR of the grants in the project's `access_rights` JSON for `groups`.
fn aggregate_project_grants(project: &ProjectRow, groups: &[GroupId]) -> AccessRights {
    let grants: HashMap<String, AccessRights> = match serde_json::from_str(&project.access_rights) {
        Ok(grants) => grants,
        Err(err) => {
            warn!(
                project_id = %project.uuid,
                error = %err,
                "malformed access rights, denying access"
            );
            return AccessRights::none();
        }
    };
    grants
        .iter()
        .filter(|(gid, _)| {
            gid.parse::<GroupId>()
                .map(|gid| groups.contains(&gid))
                .unwrap_or(false)
        })
        .fold(AccessRights::none(), |acc, (_, rights)| acc.merge(*rights))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    struct Fixture {
        pool: Arc<SqlitePool>,
        access: AccessRightsRepository,
    }

    impl Fixture {
        async fn new() -> Self {
            let pool = Arc::new(connect_in_memory().await.unwrap());
            Self {
                access: AccessRightsRepository::new(pool.clone()),
                pool,
            }
        }

        async fn project(&self, owner: UserId, workspace: Option<i64>, rights: &str) -> ProjectId {
            let id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO projects (uuid, name, prj_owner, workspace_id, access_rights)
                 VALUES (?, 'p', ?, ?, ?)",
            )
            .bind(id)
            .bind(owner)
            .bind(workspace)
            .bind(rights)
            .execute(&*self.pool)
            .await
            .unwrap();
            id
        }

        async fn membership(&self, uid: UserId, gid: GroupId) {
            sqlx::query("INSERT INTO user_to_groups (uid, gid) VALUES (?, ?)")
                .bind(uid)
                .bind(gid)
                .execute(&*self.pool)
                .await
                .unwrap();
        }

        async fn workspace_grant(&self, workspace: i64, gid: GroupId, r: bool, w: bool, d: bool) {
            sqlx::query(
                "INSERT INTO workspaces_access_rights (workspace_id, gid, \"read\", \"write\", \"delete\")
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(workspace)
            .bind(gid)
            .bind(r)
            .bind(w)
            .bind(d)
            .execute(&*self.pool)
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn owner_has_full_rights_regardless_of_grants() {
        let fx = Fixture::new().await;
        fx.membership(1, 10).await;
        let project = fx
            .project(1, None, r#"{"10": {"read": true, "write": false, "delete": false}}"#)
            .await;
        assert_eq!(
            fx.access.get_project_access_rights(1, project).await.unwrap(),
            AccessRights::all()
        );
    }

    #[tokio::test]
    async fn group_grants_are_or_aggregated() {
        let fx = Fixture::new().await;
        fx.membership(2, 10).await;
        fx.membership(2, 11).await;
        let project = fx
            .project(
                1,
                None,
                r#"{"10": {"read": true, "write": false, "delete": false},
                    "11": {"read": false, "write": true, "delete": false},
                    "12": {"read": true, "write": true, "delete": true}}"#,
            )
            .await;
        let rights = fx.access.get_project_access_rights(2, project).await.unwrap();
        assert_eq!(
            rights,
            AccessRights {
                read: true,
                write: true,
                delete: false
            }
        );
    }

    #[tokio::test]
    async fn workspace_grants_replace_project_grants() {
        let fx = Fixture::new().await;
        fx.membership(2, 10).await;
        fx.workspace_grant(7, 10, true, false, true).await;
        fx.workspace_grant(7, 99, true, true, true).await;
        // project-level grants are ignored once the project lives in a workspace
        let project = fx
            .project(1, Some(7), r#"{"10": {"read": true, "write": true, "delete": true}}"#)
            .await;
        let rights = fx.access.get_project_access_rights(2, project).await.unwrap();
        assert_eq!(
            rights,
            AccessRights {
                read: true,
                write: false,
                delete: true
            }
        );
    }

    #[tokio::test]
    async fn malformed_grants_deny_access() {
        let fx = Fixture::new().await;
        fx.membership(2, 10).await;
        let project = fx.project(1, None, "{not json").await;
        assert_eq!(
            fx.access.get_project_access_rights(2, project).await.unwrap(),
            AccessRights::none()
        );
        assert_eq!(
            fx.access
                .get_project_access_rights(2, Uuid::new_v4())
                .await
                .unwrap(),
            AccessRights::none()
        );
    }

    #[tokio::test]
    async fn unregistered_files_infer_rights_from_their_id() {
        let fx = Fixture::new().await;
        let project = fx.project(1, None, "{}").await;

        let in_project = StorageFileId::parse(&format!("{project}/{}/f", Uuid::new_v4())).unwrap();
        assert!(fx.access.get_file_access_rights(1, &in_project).await.unwrap().write);
        assert!(!fx.access.get_file_access_rights(2, &in_project).await.unwrap().read);

        let api = StorageFileId::parse("api/abc/f").unwrap();
        assert_eq!(fx.access.get_file_access_rights(2, &api).await.unwrap(), AccessRights::all());

        let export = StorageFileId::parse("exports/2/x.zip").unwrap();
        assert!(fx.access.get_file_access_rights(2, &export).await.unwrap().read);
        assert!(!fx.access.get_file_access_rights(3, &export).await.unwrap().read);

        let junk = StorageFileId::parse("not-a-uuid/node/f").unwrap();
        assert!(matches!(
            fx.access.get_file_access_rights(1, &junk).await,
            Err(StorageError::InvalidFileIdentifier { .. })
        ));
    }

    #[tokio::test]
    async fn registered_project_less_files_belong_to_their_owner() {
        let fx = Fixture::new().await;
        let files = FileMetaDataRepository::new(fx.pool.clone());
        let id = StorageFileId::parse("api/abc/owned.bin").unwrap();
        let now = Utc::now();
        files
            .upsert(&crate::models::FileMetaData::new_pending(
                &id,
                "b",
                5,
                None,
                false,
                now,
                now + Duration::hours(1),
            ))
            .await
            .unwrap();
        assert_eq!(fx.access.get_file_access_rights(5, &id).await.unwrap(), AccessRights::all());
        assert_eq!(fx.access.get_file_access_rights(6, &id).await.unwrap(), AccessRights::none());
    }

    #[tokio::test]
    async fn readable_projects_follow_the_same_rules() {
        let fx = Fixture::new().await;
        fx.membership(2, 10).await;
        fx.membership(2, 20).await;
        fx.workspace_grant(7, 10, true, false, false).await;
        fx.workspace_grant(8, 10, false, true, true).await;
        fx.workspace_grant(8, 99, true, true, true).await;

        let own = fx.project(2, None, "{}").await;
        let shared = fx
            .project(1, None, r#"{"10": {"read": true, "write": false, "delete": false}}"#)
            .await;
        let write_only = fx
            .project(1, None, r#"{"20": {"read": false, "write": true, "delete": false}}"#)
            .await;
        let _hidden = fx.project(1, None, "{}").await;
        let _malformed = fx.project(1, None, "{not json").await;
        let _bad_entry = fx
            .project(
                1,
                None,
                r#"{"10": {"read": true, "write": false, "delete": false}, "20": "rw"}"#,
            )
            .await;
        let _not_a_group = fx
            .project(1, None, r#"{"abc": {"read": true, "write": true, "delete": true}}"#)
            .await;
        let in_workspace = fx.project(1, Some(7), "{}").await;
        // project grants are ignored once the project lives in a workspace
        let _workspace_without_read = fx
            .project(1, Some(8), r#"{"10": {"read": true, "write": true, "delete": true}}"#)
            .await;
        let own_in_workspace = fx.project(2, Some(8), "{}").await;

        let mut readable = fx.access.list_readable_project_ids(2).await.unwrap();
        readable.sort();
        let mut expected = vec![own, shared, in_workspace, own_in_workspace];
        expected.sort();
        assert_eq!(readable, expected);
        assert!(!readable.contains(&write_only));

        let all: Vec<ProjectId> = sqlx::query_scalar("SELECT uuid FROM projects")
            .fetch_all(&*fx.pool)
            .await
            .unwrap();
        for project in all {
            let rights = fx.access.get_project_access_rights(2, project).await.unwrap();
            assert_eq!(rights.read, readable.contains(&project), "project {project}");
        }
    }

    #[tokio::test]
    async fn users_without_groups_read_only_their_own_projects() {
        let fx = Fixture::new().await;
        let own = fx.project(3, None, "{}").await;
        fx.project(1, None, r#"{"10": {"read": true, "write": true, "delete": true}}"#)
            .await;
        assert_eq!(fx.access.list_readable_project_ids(3).await.unwrap(), vec![own]);
    }
}
