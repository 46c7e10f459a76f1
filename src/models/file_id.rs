//! Logical storage identifiers.
//!
//! A `StorageFileId` doubles as the object key in the bucket. Three shapes are
//! recognised:
//! - `{project_id}/{node_id}/{file_name...}` for workbench files
//! - `api/{uuid}/{file_name...}` for detached API uploads
//! - `exports/{user_id}/{uuid}.zip` for generated exports

use crate::{
    models::{NodeId, ProjectId, UserId},
    services::error::StorageError,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const MAX_FILE_ID_LEN: usize = 1024;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct StorageFileId(String);

impl StorageFileId {
    /// Validate a raw identifier: at least three non-empty `/`-separated
    /// segments, no traversal, no control characters.
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let invalid = |details: &str| StorageError::InvalidFileIdentifier {
            identifier: raw.to_string(),
            details: details.to_string(),
        };

        if raw.is_empty() || raw.len() > MAX_FILE_ID_LEN {
            return Err(invalid("identifier length out of range"));
        }
        if raw.starts_with('/') || raw.ends_with('/') {
            return Err(invalid("leading or trailing '/'"));
        }
        if raw
            .chars()
            .any(|c| c.is_control() || c == '\\')
        {
            return Err(invalid("unsafe characters"));
        }
        let segments: Vec<&str> = raw.split('/').collect();
        if segments.len() < 3 {
            return Err(invalid("expected at least three path segments"));
        }
        if segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
            return Err(invalid("empty or relative path segment"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    fn segment(&self, index: usize) -> Option<&str> {
        self.0.split('/').nth(index)
    }

    /// Project id implied by the first segment, if it is a uuid.
    pub fn project_id(&self) -> Option<ProjectId> {
        self.segment(0).and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Node id implied by the second segment of a project-scoped id.
    pub fn node_id(&self) -> Option<NodeId> {
        self.project_id()?;
        self.segment(1).and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn is_api(&self) -> bool {
        self.0.starts_with("api/")
    }

    /// Owner encoded in an `exports/{user_id}/...` identifier.
    pub fn export_owner(&self) -> Option<UserId> {
        if self.segment(0) != Some("exports") {
            return None;
        }
        self.segment(1).and_then(|s| s.parse().ok())
    }

    /// Everything after `{project_id}/{node_id}/`.
    pub fn file_name(&self) -> &str {
        self.0.splitn(3, '/').nth(2).unwrap_or(&self.0)
    }

    /// Parent "folders" of this id, innermost first, stopping at the
    /// three-segment minimum.
    pub fn ancestors(&self) -> Vec<StorageFileId> {
        let mut out = Vec::new();
        let mut current = self.0.as_str();
        while let Some((parent, _)) = current.rsplit_once('/') {
            if parent.split('/').count() < 3 {
                break;
            }
            out.push(StorageFileId(parent.to_string()));
            current = parent;
        }
        out
    }

    /// Object-store prefix covering everything below this id.
    pub fn as_prefix(&self) -> String {
        format!("{}/", self.0)
    }
}

impl fmt::Display for StorageFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StorageFileId {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StorageFileId> for String {
    fn from(value: StorageFileId) -> Self {
        value.0
    }
}

impl AsRef<str> for StorageFileId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_project_scoped_ids() {
        let project = Uuid::new_v4();
        let node = Uuid::new_v4();
        let id = StorageFileId::parse(&format!("{project}/{node}/outputs/data.csv")).unwrap();
        assert_eq!(id.project_id(), Some(project));
        assert_eq!(id.node_id(), Some(node));
        assert_eq!(id.file_name(), "outputs/data.csv");
        assert!(!id.is_api());
    }

    #[test]
    fn recognises_api_and_export_ids() {
        let api = StorageFileId::parse(&format!("api/{}/file.bin", Uuid::new_v4())).unwrap();
        assert!(api.is_api());
        assert_eq!(api.project_id(), None);

        let export = StorageFileId::parse(&format!("exports/42/{}.zip", Uuid::new_v4())).unwrap();
        assert_eq!(export.export_owner(), Some(42));
    }

    #[test]
    fn rejects_malformed_ids() {
        for raw in ["", "a/b", "/a/b/c", "a/b/c/", "a//b/c", "a/../b/c", "a/b\\c/d"] {
            assert!(
                matches!(
                    StorageFileId::parse(raw),
                    Err(StorageError::InvalidFileIdentifier { .. })
                ),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn ancestors_stop_at_the_node_level() {
        let id = StorageFileId::parse("p/n/dir/sub/file.txt").unwrap();
        let ancestors: Vec<String> = id.ancestors().into_iter().map(String::from).collect();
        assert_eq!(ancestors, vec!["p/n/dir/sub", "p/n/dir"]);
    }
}
