//! Consumed interfaces of services this subsystem does not own: the journal
//! data store, the user directory, and the device-token store. Each is a
//! trait seam with an HTTP implementation; tests substitute in-memory fakes.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::db::models::SyncChange;
use crate::error::{AppError, AppResult};

/// The journal data store. Sync changes are persisted here; the delta log
/// this subsystem keeps is reconciliation metadata, not the data itself.
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn persist_change(&self, user_id: &str, change: &SyncChange) -> AppResult<()>;

    /// Owning user of an entity, `None` when the entity is unknown.
    async fn owner_of(&self, entity_kind: &str, entity_id: &str) -> AppResult<Option<String>>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn email_of(&self, user_id: &str) -> AppResult<Option<String>>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceToken {
    pub platform: String,
    pub token: String,
    #[serde(default)]
    pub registered_at: Option<String>,
}

#[async_trait]
pub trait DeviceTokenStore: Send + Sync {
    async fn tokens_for(&self, user_id: &str) -> AppResult<Vec<DeviceToken>>;
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

pub struct HttpEntryStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEntryStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: http_client(Duration::from_secs(5)),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl EntryStore for HttpEntryStore {
    async fn persist_change(&self, user_id: &str, change: &SyncChange) -> AppResult<()> {
        let url = format!(
            "{}/internal/entities/{}/{}",
            self.base_url, change.entity_kind, change.entity_id
        );
        let response = self
            .client
            .put(&url)
            .json(&serde_json::json!({
                "userId": user_id,
                "changeId": change.change_id,
                "operation": change.operation,
                "payload": change.payload,
            }))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else if response.status().is_server_error() {
            Err(AppError::ServiceUnavailable(format!(
                "entry store returned {}",
                response.status()
            )))
        } else {
            Err(AppError::BadRequest(format!(
                "entry store rejected change {}: {}",
                change.change_id,
                response.status()
            )))
        }
    }

    async fn owner_of(&self, entity_kind: &str, entity_id: &str) -> AppResult<Option<String>> {
        let url = format!(
            "{}/internal/entities/{}/{}/owner",
            self.base_url, entity_kind, entity_id
        );
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(AppError::ServiceUnavailable(format!(
                "entry store returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct OwnerResponse {
            owner_id: String,
        }
        let body: OwnerResponse = response.json().await?;
        Ok(Some(body.owner_id))
    }
}

pub struct HttpUserDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUserDirectory {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: http_client(Duration::from_secs(5)),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn email_of(&self, user_id: &str) -> AppResult<Option<String>> {
        let url = format!("{}/internal/users/{}", self.base_url, user_id);
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(AppError::ServiceUnavailable(format!(
                "user directory returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct UserResponse {
            email: Option<String>,
        }
        let body: UserResponse = response.json().await?;
        Ok(body.email)
    }
}

pub struct HttpDeviceTokenStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDeviceTokenStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: http_client(Duration::from_secs(5)),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl DeviceTokenStore for HttpDeviceTokenStore {
    async fn tokens_for(&self, user_id: &str) -> AppResult<Vec<DeviceToken>> {
        let url = format!("{}/internal/users/{}/device-tokens", self.base_url, user_id);
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(AppError::ServiceUnavailable(format!(
                "device-token store returned {}",
                response.status()
            )));
        }

        let tokens: Vec<DeviceToken> = response.json().await?;
        Ok(tokens)
    }
}
