use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ConversationRecord, MessageRecord, NewMessageRequest, ParticipantRecord,
        ReadMarkerRequest, UpdateMessageRequest,
    },
};

/// CRUD surface of the relational store, as seen by the engine. The engine
/// never touches rows directly; everything durable goes through here.
#[async_trait]
pub trait PersistenceApi: Send + Sync {
    async fn get_conversation(&self, id: &ConversationId) -> Result<ConversationRecord>;

    /// Persists a composed message; the returned record carries the durable
    /// id and the authoritative server-clock `created_at`.
    async fn insert_message(&self, request: NewMessageRequest) -> Result<MessageRecord>;

    async fn update_message(&self, id: &MessageId, content: &str) -> Result<MessageRecord>;

    async fn delete_message(&self, id: &MessageId) -> Result<()>;

    async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<MessageRecord>>;

    async fn list_participants(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ParticipantRecord>>;

    async fn touch_last_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// `PersistenceApi` over the platform's HTTP API.
pub struct HttpPersistence {
    http: Client,
    base_url: String,
}

impl HttpPersistence {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

/// Rejections come back as the shared `ApiError` envelope so callers can
/// match on the code (a concurrent-delete race is `not_found`, not a hard
/// failure). Transport failures stay plain `reqwest` errors.
async fn checked(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error = response
        .json::<ApiError>()
        .await
        .unwrap_or_else(|_| ApiError::new(code_for(status), status.to_string()));
    Err(anyhow::Error::new(error))
}

fn code_for(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthorized,
        StatusCode::FORBIDDEN => ErrorCode::Forbidden,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ErrorCode::RateLimited,
        s if s.is_client_error() => ErrorCode::Validation,
        _ => ErrorCode::Internal,
    }
}

#[async_trait]
impl PersistenceApi for HttpPersistence {
    async fn get_conversation(&self, id: &ConversationId) -> Result<ConversationRecord> {
        let base_url = &self.base_url;
        let response = self
            .http
            .get(format!("{base_url}/conversations/{id}"))
            .send()
            .await?;
        checked(response)
            .await?
            .json()
            .await
            .with_context(|| format!("failed to fetch conversation {id}"))
    }

    async fn insert_message(&self, request: NewMessageRequest) -> Result<MessageRecord> {
        let base_url = &self.base_url;
        let response = self
            .http
            .post(format!("{base_url}/messages"))
            .json(&request)
            .send()
            .await?;
        checked(response)
            .await?
            .json()
            .await
            .context("failed to persist message")
    }

    async fn update_message(&self, id: &MessageId, content: &str) -> Result<MessageRecord> {
        let base_url = &self.base_url;
        let response = self
            .http
            .patch(format!("{base_url}/messages/{id}"))
            .json(&UpdateMessageRequest {
                content: content.to_string(),
            })
            .send()
            .await?;
        checked(response)
            .await?
            .json()
            .await
            .with_context(|| format!("failed to update message {id}"))
    }

    async fn delete_message(&self, id: &MessageId) -> Result<()> {
        let base_url = &self.base_url;
        let response = self
            .http
            .delete(format!("{base_url}/messages/{id}"))
            .send()
            .await?;
        checked(response)
            .await
            .with_context(|| format!("failed to delete message {id}"))?;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<MessageRecord>> {
        let base_url = &self.base_url;
        let response = self
            .http
            .get(format!("{base_url}/conversations/{conversation_id}/messages"))
            .send()
            .await?;
        checked(response)
            .await?
            .json()
            .await
            .with_context(|| format!("failed to list messages for {conversation_id}"))
    }

    async fn list_participants(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ParticipantRecord>> {
        let base_url = &self.base_url;
        let response = self
            .http
            .get(format!(
                "{base_url}/conversations/{conversation_id}/participants"
            ))
            .send()
            .await?;
        checked(response)
            .await?
            .json()
            .await
            .with_context(|| format!("failed to list participants for {conversation_id}"))
    }

    async fn touch_last_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let base_url = &self.base_url;
        let response = self
            .http
            .post(format!(
                "{base_url}/conversations/{conversation_id}/read_marker"
            ))
            .json(&ReadMarkerRequest {
                user_id: user_id.clone(),
                last_read_at: at,
            })
            .send()
            .await?;
        checked(response)
            .await
            .with_context(|| format!("failed to move read marker in {conversation_id}"))?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/persistence_tests.rs"]
mod tests;
