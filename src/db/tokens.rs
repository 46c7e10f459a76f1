//! Per-user credentials for the external dataset service.

use crate::{models::UserId, services::error::StorageResult};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::warn;

const DATCORE_TOKEN_SERVICE: &str = "pennsieve";

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DatCoreCredentials {
    #[serde(rename = "token_key")]
    pub api_key: String,
    #[serde(rename = "token_secret")]
    pub api_secret: String,
}

#[derive(Clone)]
pub struct TokensRepository {
    db: Arc<SqlitePool>,
}

impl TokensRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// The user's datcore API key and secret, if registered and well-formed.
    pub async fn get_datcore_credentials(
        &self,
        user_id: UserId,
    ) -> StorageResult<Option<DatCoreCredentials>> {
        let token_data: Option<String> = sqlx::query_scalar(
            "SELECT token_data FROM tokens WHERE user_id = ? AND token_service = ?
             ORDER BY token_id DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(DATCORE_TOKEN_SERVICE)
        .fetch_optional(&*self.db)
        .await?;

        Ok(token_data.and_then(|data| match serde_json::from_str(&data) {
            Ok(credentials) => Some(credentials),
            Err(err) => {
                warn!(user_id, error = %err, "malformed datcore token data");
                None
            }
        }))
    }
}
