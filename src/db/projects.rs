//! Read access to the `projects` table, owned by the projects subsystem.

use crate::{
    models::{ProjectId, UserId, WorkspaceId},
    services::error::StorageResult,
};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};
use std::{collections::HashMap, sync::Arc};
use tracing::warn;

/// A project as far as storage cares about it.
#[derive(Clone, FromRow, Debug)]
pub struct ProjectRow {
    pub uuid: ProjectId,
    pub name: String,
    pub prj_owner: UserId,
    pub workspace_id: Option<WorkspaceId>,
    /// JSON object keyed by group id: `{"<gid>": {"read", "write", "delete"}}`.
    pub access_rights: String,
    /// JSON object keyed by node id: `{"<node_id>": {"label", "outputs", ...}}`.
    pub workbench: String,
}

impl ProjectRow {
    fn workbench_json(&self) -> Option<serde_json::Map<String, Value>> {
        match serde_json::from_str::<Value>(&self.workbench) {
            Ok(Value::Object(map)) => Some(map),
            Ok(_) | Err(_) => {
                warn!(project_id = %self.uuid, "malformed workbench json");
                None
            }
        }
    }

    /// Node id -> label.
    pub fn node_labels(&self) -> HashMap<String, String> {
        self.workbench_json()
            .into_iter()
            .flatten()
            .filter_map(|(node_id, node)| {
                node.get("label")
                    .and_then(Value::as_str)
                    .map(|label| (node_id, label.to_string()))
            })
            .collect()
    }

    /// `(node_id, path)` of the node outputs stored in `location_id`.
    pub fn outputs_in_location(&self, location_id: i64) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (node_id, node) in self.workbench_json().into_iter().flatten() {
            let Some(outputs) = node.get("outputs").and_then(Value::as_object) else {
                continue;
            };
            for output in outputs.values() {
                let store = output.get("store").and_then(|s| {
                    s.as_i64()
                        .or_else(|| s.as_str().and_then(|v| v.parse().ok()))
                });
                if store != Some(location_id) {
                    continue;
                }
                if let Some(path) = output.get("path").and_then(Value::as_str) {
                    out.push((node_id.clone(), path.to_string()));
                }
            }
        }
        out
    }
}

#[derive(Clone)]
pub struct ProjectsRepository {
    db: Arc<SqlitePool>,
}

impl ProjectsRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn get(&self, project_id: ProjectId) -> StorageResult<Option<ProjectRow>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT uuid, name, prj_owner, workspace_id, access_rights, workbench
             FROM projects WHERE uuid = ?",
        )
        .bind(project_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    pub async fn exists(&self, project_id: ProjectId) -> StorageResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM projects WHERE uuid = ?")
            .bind(project_id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(found.is_some())
    }

    /// Projects among `ids` that exist, keyed by id.
    pub async fn get_many(
        &self,
        ids: impl IntoIterator<Item = ProjectId>,
    ) -> StorageResult<HashMap<ProjectId, ProjectRow>> {
        let mut out = HashMap::new();
        for id in ids {
            if out.contains_key(&id) {
                continue;
            }
            if let Some(row) = self.get(id).await? {
                out.insert(id, row);
            }
        }
        Ok(out)
    }
}
