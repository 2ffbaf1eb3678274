//! Conversation API client
//!
//! [`ConversationApi`] is the seam between the widget and the backend; the
//! session only talks to the trait. [`HttpConversationApi`] is the reqwest
//! implementation against `/api/v1`.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use shared_types::{
    ApiMessage, ConversationMessages, CreateConversationResponse, DataEnvelope, ReactionRequest,
    SendMessageData, SendMessageRequest, TaskStatus, TaskStatusData, HEADER_SESSION_ID,
    HEADER_USER_EMAIL,
};

use crate::error::ApiError;
use crate::identity::ConversationIdentity;

#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// `POST /conversations/`
    async fn create_conversation(
        &self,
        who: &ConversationIdentity,
    ) -> Result<CreateConversationResponse, ApiError>;

    /// `GET /conversations/{id}/`
    async fn fetch_messages(
        &self,
        who: &ConversationIdentity,
        conversation_id: &str,
    ) -> Result<Vec<ApiMessage>, ApiError>;

    /// `POST /conversations/{id}/send-message/`, returning the task id that
    /// will eventually carry the reply.
    async fn send_message(
        &self,
        who: &ConversationIdentity,
        conversation_id: &str,
        text: &str,
    ) -> Result<String, ApiError>;

    /// `GET /conversations/ai-response-receiver/?task_id=`
    async fn task_status(
        &self,
        who: &ConversationIdentity,
        task_id: &str,
    ) -> Result<TaskStatus, ApiError>;

    /// `POST /conversations/{id}/send-reaction/{message_id}/`
    async fn send_reaction(
        &self,
        who: &ConversationIdentity,
        conversation_id: &str,
        message_id: &str,
        reaction: &ReactionRequest,
    ) -> Result<(), ApiError>;

    /// `POST /conversations/{id}/email-conversation/`
    async fn email_conversation(
        &self,
        who: &ConversationIdentity,
        conversation_id: &str,
    ) -> Result<(), ApiError>;
}

/// Fetch messages, treating a missing conversation id as "no data" without a call.
pub async fn fetch_messages_if_any<A: ConversationApi + ?Sized>(
    api: &A,
    who: &ConversationIdentity,
    conversation_id: Option<&str>,
) -> Result<Option<Vec<ApiMessage>>, ApiError> {
    match conversation_id {
        Some(id) => api.fetch_messages(who, id).await.map(Some),
        None => Ok(None),
    }
}

// ============================================================================
// HttpConversationApi
// ============================================================================

/// HTTP client for the conversation backend.
#[derive(Debug, Clone)]
pub struct HttpConversationApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpConversationApi {
    /// `base_url` includes the version prefix, e.g. `https://host/api/v1`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // --------------------------------------------------------------------
    // Private HTTP helpers
    // --------------------------------------------------------------------

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        who: &ConversationIdentity,
    ) -> reqwest::RequestBuilder {
        with_identity_headers(
            self.http.request(method, format!("{}{}", self.base_url, path)),
            who,
        )
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let resp = check_status(req.send().await?).await?;
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn send_ok(&self, req: reqwest::RequestBuilder) -> Result<(), ApiError> {
        check_status(req.send().await?).await?;
        Ok(())
    }
}

/// Attach `X-User-Email` / `X-Session-ID` when the identity carries them.
pub(crate) fn with_identity_headers(
    mut req: reqwest::RequestBuilder,
    who: &ConversationIdentity,
) -> reqwest::RequestBuilder {
    if let Some(email) = who.email.as_deref() {
        req = req.header(HEADER_USER_EMAIL, email);
    }
    if let Some(session_id) = who.session_id.as_deref() {
        req = req.header(HEADER_SESSION_ID, session_id);
    }
    req
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::Server {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn create_conversation(
        &self,
        who: &ConversationIdentity,
    ) -> Result<CreateConversationResponse, ApiError> {
        self.send_json(self.request(reqwest::Method::POST, "/conversations/", who))
            .await
    }

    async fn fetch_messages(
        &self,
        who: &ConversationIdentity,
        conversation_id: &str,
    ) -> Result<Vec<ApiMessage>, ApiError> {
        let path = format!("/conversations/{conversation_id}/");
        let data: ConversationMessages = self
            .send_json(self.request(reqwest::Method::GET, &path, who))
            .await?;
        Ok(data.messages)
    }

    async fn send_message(
        &self,
        who: &ConversationIdentity,
        conversation_id: &str,
        text: &str,
    ) -> Result<String, ApiError> {
        let path = format!("/conversations/{conversation_id}/send-message/");
        let req = self
            .request(reqwest::Method::POST, &path, who)
            .json(&SendMessageRequest {
                text: text.to_string(),
            });
        let envelope: DataEnvelope<SendMessageData> = self.send_json(req).await?;
        envelope
            .data
            .and_then(|d| d.task_id)
            .filter(|id| !id.is_empty())
            .ok_or(ApiError::MissingField("data.task_id"))
    }

    async fn task_status(
        &self,
        who: &ConversationIdentity,
        task_id: &str,
    ) -> Result<TaskStatus, ApiError> {
        let req = self
            .request(
                reqwest::Method::GET,
                "/conversations/ai-response-receiver/",
                who,
            )
            .query(&[("task_id", task_id)]);
        let envelope: DataEnvelope<TaskStatusData> = self.send_json(req).await?;
        envelope
            .data
            .and_then(|d| d.status)
            .map(|raw| TaskStatus::parse(&raw))
            .ok_or(ApiError::MissingField("data.status"))
    }

    async fn send_reaction(
        &self,
        who: &ConversationIdentity,
        conversation_id: &str,
        message_id: &str,
        reaction: &ReactionRequest,
    ) -> Result<(), ApiError> {
        let path = format!("/conversations/{conversation_id}/send-reaction/{message_id}/");
        self.send_ok(self.request(reqwest::Method::POST, &path, who).json(reaction))
            .await
    }

    async fn email_conversation(
        &self,
        who: &ConversationIdentity,
        conversation_id: &str,
    ) -> Result<(), ApiError> {
        let path = format!("/conversations/{conversation_id}/email-conversation/");
        self.send_ok(self.request(reqwest::Method::POST, &path, who))
            .await
    }
}
