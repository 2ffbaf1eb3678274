//! GrantBot widget core
//!
//! Conversation state for the GrantBot chat widget: identity continuity,
//! the conversation API client, task polling and reconciliation of
//! optimistic messages with the server's list. Rendering is left to the
//! host, which subscribes to [`session::ChatSession`] snapshots.

pub mod api;
pub mod config;
pub mod conversation;
pub mod error;
pub mod greeting;
pub mod identity;
pub mod poller;
pub mod reactions;
pub mod report;
pub mod session;

pub use api::{ConversationApi, HttpConversationApi};
pub use error::{ApiError, ChatError, StoreError};
pub use identity::{FileStore, IdentityStore, KeyValueStore, MemoryStore};
pub use report::{ReportClient, ReportOutcome};
pub use session::{ChatSession, SessionOptions};
