//! Opaque external collaborators.
//!
//! Media storage, message history, and token issuance live behind REST
//! services this crate only consumes. The traits are the seams; [`HttpApi`]
//! is the production implementation of all of them.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::{AuthToken, StoredMessage, TurnCredentials};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;

/// Source of the current bearer token. Expiry is the issuer's business; the
/// caller only checks it.
pub trait AuthTokenProvider: Send + Sync {
    fn current_token(&self) -> Option<AuthToken>;
}

/// Upload a blob, get back a stable URL to reference in messages.
#[async_trait]
pub trait MediaUploadService: Send + Sync {
    async fn upload(&self, data: Vec<u8>, file_name: &str, mime_type: &str) -> Result<String>;
}

/// Fetch/delete persisted conversation history.
#[async_trait]
pub trait MessageStoreService: Send + Sync {
    async fn fetch(&self, user_id: &str, peer_id: &str) -> Result<Vec<StoredMessage>>;
    async fn delete(&self, message_id: &str) -> Result<()>;
}

/// Token holder fed from the outside (login flow, refresh, FFI host).
pub struct StaticTokenProvider {
    token: Mutex<Option<AuthToken>>,
}

impl StaticTokenProvider {
    pub fn new(token: &str, expires_at: i64) -> Self {
        Self {
            token: Mutex::new(Some(AuthToken {
                token: token.to_string(),
                expires_at,
            })),
        }
    }

    pub fn empty() -> Self {
        Self {
            token: Mutex::new(None),
        }
    }

    pub fn set_token(&self, token: &str, expires_at: i64) {
        *self.token.lock() = Some(AuthToken {
            token: token.to_string(),
            expires_at,
        });
    }

    pub fn clear(&self) {
        *self.token.lock() = None;
    }
}

impl AuthTokenProvider for StaticTokenProvider {
    fn current_token(&self) -> Option<AuthToken> {
        self.token.lock().clone()
    }
}

// ============================================================================
// HTTP implementation
// ============================================================================

pub struct HttpApi {
    client: Client,
    base_url: String,
    tokens: Arc<dyn AuthTokenProvider>,
}

impl HttpApi {
    pub fn new(config: &ClientConfig, tokens: Arc<dyn AuthTokenProvider>) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.use_tls) // For development
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.http_url(),
            tokens,
        })
    }

    fn auth_header(&self) -> Result<String> {
        match self.tokens.current_token() {
            Some(token) if !token.is_expired() => Ok(format!("Bearer {}", token.token)),
            _ => Err(Error::AuthExpired),
        }
    }

    pub async fn get_turn_credentials(&self) -> Result<TurnCredentials> {
        let auth = self.auth_header()?;
        let resp = self
            .client
            .get(format!("{}/api/v1/turn/credentials", self.base_url))
            .header("Authorization", auth)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Http(format!(
                "TURN credential fetch failed: {}",
                resp.status()
            )));
        }

        let creds: TurnCredentials = resp.json().await?;
        Ok(creds)
    }
}

#[async_trait]
impl MediaUploadService for HttpApi {
    async fn upload(&self, data: Vec<u8>, file_name: &str, mime_type: &str) -> Result<String> {
        let auth = self.auth_header()?;

        let part = reqwest::multipart::Part::bytes(data)
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(|e| Error::Http(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(format!("{}/api/v1/files/upload", self.base_url))
            .header("Authorization", auth)
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Http(format!("Upload failed: {}", resp.status())));
        }

        let data: serde_json::Value = resp.json().await?;
        Ok(data["url"].as_str().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl MessageStoreService for HttpApi {
    async fn fetch(&self, user_id: &str, peer_id: &str) -> Result<Vec<StoredMessage>> {
        let auth = self.auth_header()?;

        let resp = self
            .client
            .get(format!(
                "{}/api/v1/messages/{}/{}",
                self.base_url, user_id, peer_id
            ))
            .header("Authorization", auth)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Http(format!("History fetch failed: {}", resp.status())));
        }

        let messages: Vec<StoredMessage> = resp.json().await?;
        Ok(messages)
    }

    async fn delete(&self, message_id: &str) -> Result<()> {
        let auth = self.auth_header()?;

        let resp = self
            .client
            .delete(format!("{}/api/v1/messages/{}", self.base_url, message_id))
            .header("Authorization", auth)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Http(format!("Delete failed: {}", resp.status())));
        }
        Ok(())
    }
}
