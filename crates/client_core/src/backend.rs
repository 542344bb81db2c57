use std::collections::BTreeSet;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{MessageId, UserId},
    error::ApiError,
    protocol::{
        ConversationSummary, LoginRequest, LoginResponse, MessagePage, MessagePayload, Pagination,
        SendMessageRequest,
    },
};

use crate::error::{ClientError, Result};

/// Request/response half of the messaging API.
#[async_trait]
pub trait MessagingBackend: Send + Sync {
    async fn login(&self, username: &str) -> Result<UserId>;
    async fn conversations(&self, user_id: UserId) -> Result<Vec<ConversationSummary>>;
    async fn thread(
        &self,
        user_id: UserId,
        other_user_id: UserId,
        pagination: Pagination,
    ) -> Result<MessagePage>;
    async fn send(
        &self,
        user_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> Result<MessagePayload>;
    async fn mark_read(&self, user_id: UserId, message_id: MessageId) -> Result<()>;
    async fn delete(&self, user_id: UserId, message_id: MessageId) -> Result<()>;
    async fn online_users(&self) -> Result<BTreeSet<UserId>>;
}

pub struct HttpBackend {
    http: Client,
    server_url: String,
}

impl HttpBackend {
    pub fn new(server_url: impl Into<String>) -> Self {
        let server_url: String = server_url.into();
        Self {
            http: Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[async_trait]
impl MessagingBackend for HttpBackend {
    async fn login(&self, username: &str) -> Result<UserId> {
        let response = self
            .http
            .post(format!("{}/login", self.server_url))
            .json(&LoginRequest {
                username: username.to_string(),
            })
            .send()
            .await?;
        let body: LoginResponse = decode(response).await?;
        Ok(body.user_id)
    }

    async fn conversations(&self, user_id: UserId) -> Result<Vec<ConversationSummary>> {
        let response = self
            .http
            .get(format!("{}/messages/conversations", self.server_url))
            .query(&[("user_id", user_id.0)])
            .send()
            .await?;
        decode(response).await
    }

    async fn thread(
        &self,
        user_id: UserId,
        other_user_id: UserId,
        pagination: Pagination,
    ) -> Result<MessagePage> {
        let (page, limit) = pagination.resolve();
        let response = self
            .http
            .get(format!("{}/messages/user/{}", self.server_url, other_user_id.0))
            .query(&[
                ("user_id", user_id.0),
                ("page", i64::from(page)),
                ("limit", i64::from(limit)),
            ])
            .send()
            .await?;
        decode(response).await
    }

    async fn send(
        &self,
        user_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> Result<MessagePayload> {
        let response = self
            .http
            .post(format!("{}/messages/send", self.server_url))
            .query(&[("user_id", user_id.0)])
            .json(&SendMessageRequest {
                receiver_id,
                content: content.to_string(),
            })
            .send()
            .await?;
        decode(response).await
    }

    async fn mark_read(&self, user_id: UserId, message_id: MessageId) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/messages/{}/read", self.server_url, message_id.0))
            .query(&[("user_id", user_id.0)])
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn delete(&self, user_id: UserId, message_id: MessageId) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/messages/{}", self.server_url, message_id.0))
            .query(&[("user_id", user_id.0)])
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn online_users(&self) -> Result<BTreeSet<UserId>> {
        let response = self
            .http
            .get(format!("{}/presence", self.server_url))
            .send()
            .await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let response = check(response).await?;
    Ok(response.json().await?)
}

/// Turns a non-success status into `ClientError::Api` when the body is a
/// structured `ApiError`, or `Transport` otherwise.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(ClientError::Api(api_error)),
        Err(_) => Err(ClientError::Transport(format!("{status}: {body}"))),
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
