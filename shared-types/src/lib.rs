//! Shared types between the widget core and its host
//!
//! Two families live here:
//! - wire records exchanged with the conversation backend (`/api/v1`)
//! - view types the widget publishes to whatever renders it
//!
//! View types export to TypeScript so a browser host can consume snapshots
//! without re-declaring them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use ts_rs::TS;

// ============================================================================
// Identifiers
// ============================================================================

/// Message identifier.
///
/// `Local` ids are minted by the widget for optimistic rows and error notes;
/// they never reach the backend and are superseded by the next canonical list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
#[ts(export, export_to = "grantbot.ts")]
pub enum MessageId {
    Server(String),
    Local(String),
}

impl MessageId {
    pub fn local() -> Self {
        Self::Local(format!("local-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Server(id) | Self::Local(id) => id,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

// ============================================================================
// View Types
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "grantbot.ts")]
pub enum Sender {
    User,
    Bot,
}

/// Chat message for UI display
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "grantbot.ts")]
pub struct Message {
    pub id: MessageId,
    pub sender: Sender,
    pub text: String,
    /// Display time, `HH:MM`
    pub time: String,
    pub created_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub query_type: Option<String>,
    pub query_count: Option<i64>,
    pub like: bool,
    pub dislike: bool,
    pub reason_to_dislike: Option<String>,
}

impl Message {
    /// A widget-authored message stamped with the current time.
    pub fn local(sender: Sender, text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::local(),
            sender,
            text: text.into(),
            time: format_clock(now),
            created_at: Some(now),
            url: None,
            query_type: None,
            query_count: None,
            like: false,
            dislike: false,
            reason_to_dislike: None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.id.is_provisional()
    }
}

/// Dislike feedback being written for one message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "grantbot.ts")]
pub struct FeedbackDraft {
    pub message_index: usize,
    pub message_id: MessageId,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "grantbot.ts")]
pub enum NoticeKind {
    Success,
    Error,
}

/// Short-lived status line (email transcript results)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "grantbot.ts")]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
}

/// Everything a renderer needs to draw the widget.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, TS)]
#[ts(export, export_to = "grantbot.ts")]
pub struct ChatSnapshot {
    pub open: bool,
    pub conversation_id: Option<String>,
    pub messages: Vec<Message>,
    pub typing: bool,
    pub email_mode: bool,
    pub banner: Option<String>,
    pub notice: Option<Notice>,
    pub feedback: Option<FeedbackDraft>,
}

// ============================================================================
// Wire Types
// ============================================================================

/// `POST /conversations/` response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateConversationResponse {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub greeting_message: Option<String>,
}

/// `GET /conversations/{id}/` response
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ConversationMessages {
    #[serde(default)]
    pub messages: Vec<ApiMessage>,
}

/// Message record as stored by the backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiMessage {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub liked: Option<bool>,
    #[serde(default)]
    pub reason_to_dislike: Option<String>,
    #[serde(default)]
    pub query_type: Option<String>,
    #[serde(default)]
    pub query_count: Option<i64>,
}

impl ApiMessage {
    pub fn sender(&self) -> Sender {
        if self.role.eq_ignore_ascii_case("user") {
            Sender::User
        } else {
            Sender::Bot
        }
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        self.created_at.as_deref().and_then(parse_timestamp)
    }

    pub fn into_message(self) -> Message {
        let created_at = self.created_at_utc();
        let sender = self.sender();
        let (like, dislike) = match self.liked {
            Some(true) => (true, false),
            Some(false) => (false, true),
            None => (false, false),
        };
        Message {
            id: MessageId::Server(self.id),
            sender,
            text: self.text.unwrap_or_default(),
            time: created_at.map(format_clock).unwrap_or_default(),
            created_at,
            url: self.url,
            query_type: self.query_type,
            query_count: self.query_count,
            like,
            dislike,
            reason_to_dislike: if dislike { self.reason_to_dislike } else { None },
        }
    }
}

/// `{ "data": ... }` wrapper used by the task endpoints and the report API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct DataEnvelope<T> {
    #[serde(default)]
    pub data: Option<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendMessageData {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatusData {
    #[serde(default)]
    pub status: Option<String>,
}

/// Backend task state as reported by the AI response receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Success,
    Failed(String),
    Other(String),
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "success" => Self::Success,
            "failure" | "failed" | "error" | "revoked" => Self::Failed(raw.to_string()),
            _ => Self::Other(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReactionRequest {
    pub liked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_to_dislike: Option<String>,
}

/// Grant report payload (`data` of the report endpoint)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Report {
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "vec_or_null")]
    pub report: Vec<ReportGrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportGrant {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub opportunity_title: Option<String>,
    #[serde(default, deserialize_with = "vec_or_null")]
    pub interests: Vec<String>,
    #[serde(default, deserialize_with = "vec_or_null")]
    pub eligibilities: Vec<String>,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub amount_low: Option<serde_json::Value>,
    #[serde(default)]
    pub amount_high: Option<serde_json::Value>,
}

// ============================================================================
// Constants
// ============================================================================

pub const HEADER_USER_EMAIL: &str = "X-User-Email";
pub const HEADER_SESSION_ID: &str = "X-Session-ID";

// ============================================================================
// Helpers
// ============================================================================

/// Format a timestamp the way chat rows show it (`HH:MM`, local time).
pub fn format_clock(at: DateTime<Utc>) -> String {
    at.with_timezone(&chrono::Local).format("%H:%M").to_string()
}

/// Parse backend timestamps: RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS[.f]` read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Str(String),
    Int(i64),
    Float(f64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Str(s) => s,
            RawId::Int(n) => n.to_string(),
            RawId::Float(n) => n.to_string(),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(RawId::into_string)
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(RawId::into_string))
}

fn vec_or_null<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// Tests
// ============================================================================
