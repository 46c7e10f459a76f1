//! Directory-browsing results and their opaque cursors.

use crate::{
    models::{FileMetaData, LocationId},
    services::error::StorageError,
};
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};

/// One entry of a `list_paths` page: either a folder-like path or a file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PathMetaData {
    pub path: String,

    /// Same path with project/node ids replaced by their names.
    pub display_path: String,

    pub location_id: LocationId,

    /// Present when the path is a concrete file.
    pub file_meta_data: Option<FileMetaData>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PathsPage {
    pub items: Vec<PathMetaData>,
    pub next_cursor: Option<String>,

    /// Total number of entries, when the source can count them.
    pub total: Option<i64>,
}

/// Position within a paginated listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathCursor {
    /// Offset into catalog results.
    Offset(i64),
    /// Object-store continuation token.
    Continuation(String),
}

impl PathCursor {
    pub fn encode(&self) -> String {
        let raw = match self {
            PathCursor::Offset(offset) => format!("offset:{offset}"),
            PathCursor::Continuation(token) => format!("token:{token}"),
        };
        general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(cursor: &str) -> Result<Self, StorageError> {
        let invalid = || StorageError::InvalidCursor(cursor.to_string());
        let bytes = general_purpose::URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|_| invalid())?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
        if let Some(offset) = raw.strip_prefix("offset:") {
            return offset
                .parse::<i64>()
                .ok()
                .filter(|o| *o >= 0)
                .map(PathCursor::Offset)
                .ok_or_else(invalid);
        }
        if let Some(token) = raw.strip_prefix("token:") {
            return Ok(PathCursor::Continuation(token.to_string()));
        }
        Err(invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_survive_encoding() {
        for cursor in [
            PathCursor::Offset(40),
            PathCursor::Continuation("p/n/dir/file-0042".into()),
        ] {
            assert_eq!(PathCursor::decode(&cursor.encode()).unwrap(), cursor);
        }
    }

    #[test]
    fn garbage_cursors_are_rejected() {
        assert!(matches!(
            PathCursor::decode("not base64 at all!"),
            Err(StorageError::InvalidCursor(_))
        ));
        let negative = general_purpose::URL_SAFE_NO_PAD.encode("offset:-3");
        assert!(PathCursor::decode(&negative).is_err());
    }
}
