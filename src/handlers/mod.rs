//! HTTP handlers. They parse the request, pick the storage location and hand
//! over to the data managers; no storage logic lives here.

pub mod file_handlers;
pub mod health_handlers;
pub mod location_handlers;
pub mod object_handlers;
pub mod simcore_handlers;

use crate::{
    errors::AppError,
    models::{LocationId, UserId},
    s3::ObjectStore,
    services::{DataManagerProvider, Location},
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub store: Arc<dyn ObjectStore>,
    pub locations: Arc<DataManagerProvider>,
    pub bucket: String,
}

impl AppState {
    pub async fn location(&self, location_id: LocationId) -> Result<Location, AppError> {
        Ok(self.locations.get(location_id).await?)
    }
}

/// `{"data": ...}` response body.
#[derive(Serialize, Debug)]
pub struct Envelope<T> {
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

#[derive(Deserialize, Debug)]
pub struct UserQuery {
    pub user_id: UserId,
}

/// Split `{target}:{action}` path segments such as `a/b/c:abort`.
pub(crate) fn split_action(segment: &str) -> Result<(&str, &str), AppError> {
    segment
        .rsplit_once(':')
        .filter(|(target, action)| !target.is_empty() && !action.is_empty())
        .ok_or_else(|| AppError::not_found(format!("no action in `{segment}`")))
}

/// Percent-encode one path segment.
pub(crate) fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_split_on_the_last_colon() {
        assert_eq!(split_action("p/n/a:b.txt:abort").unwrap(), ("p/n/a:b.txt", "abort"));
        assert!(split_action("p/n/file").is_err());
        assert!(split_action(":sync").is_err());
    }

    #[test]
    fn segments_encode_slashes() {
        assert_eq!(encode_segment("p/n/my file.txt"), "p%2Fn%2Fmy%20file.txt");
    }
}
