// REST collaborator for palaver
// History, directory, send, and session endpoints; authenticated by a
// session cookie held in the HTTP client's cookie store.

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::models::{Contact, Identity, SendPayload, WireMessage};

/// The request/response surface the engine consumes. Implemented by
/// `HttpApi` in production and by scripted fakes in tests.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `GET /auth/check`: resolve the current session to an identity.
    async fn check_session(&self) -> Result<Identity>;

    /// `POST /auth/logout`: invalidate the session.
    async fn logout(&self) -> Result<()>;

    /// `GET /messages/users`: the known contacts.
    async fn fetch_contacts(&self) -> Result<Vec<Contact>>;

    /// `GET /messages/{contactId}`: full history, oldest first.
    async fn fetch_history(&self, contact_id: &str) -> Result<Vec<WireMessage>>;

    /// `POST /messages/send/{contactId}`: returns the accepted message
    /// with its server-assigned id and timestamp.
    async fn send_message(&self, contact_id: &str, payload: &SendPayload) -> Result<WireMessage>;
}

// The server wraps the accepted message in an envelope.
#[derive(Deserialize)]
struct SendEnvelope {
    message: WireMessage,
}

pub struct HttpApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(HttpApi {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SyncError::Unauthenticated);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!("Server rejected request with status {}: {}", status, message);
            return Err(SyncError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn check_session(&self) -> Result<Identity> {
        let response = self.client.get(self.url("/auth/check")).send().await?;
        let response = Self::check_status(response).await?;
        let identity = response.json::<Identity>().await?;
        debug!("Session check resolved to identity {}", identity.id);
        Ok(identity)
    }

    async fn logout(&self) -> Result<()> {
        let response = self.client.post(self.url("/auth/logout")).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn fetch_contacts(&self) -> Result<Vec<Contact>> {
        let response = self.client.get(self.url("/messages/users")).send().await?;
        let response = Self::check_status(response).await?;
        let contacts = response.json::<Vec<Contact>>().await?;
        debug!("Fetched {} contacts", contacts.len());
        Ok(contacts)
    }

    async fn fetch_history(&self, contact_id: &str) -> Result<Vec<WireMessage>> {
        let response = self
            .client
            .get(self.url(&format!("/messages/{}", contact_id)))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let messages = response.json::<Vec<WireMessage>>().await?;
        debug!("Fetched {} messages for contact {}", messages.len(), contact_id);
        Ok(messages)
    }

    async fn send_message(&self, contact_id: &str, payload: &SendPayload) -> Result<WireMessage> {
        let response = self
            .client
            .post(self.url(&format!("/messages/send/{}", contact_id)))
            .json(payload)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let envelope = response.json::<SendEnvelope>().await?;
        Ok(envelope.message)
    }
}
