//! Identity store - who the visitor is and which conversation belongs to them
//!
//! The browser widget kept these values in `localStorage`. Here the same keys
//! live behind [`KeyValueStore`], and every read or write goes through
//! [`IdentityStore`] so the rest of the widget only sees a
//! [`ConversationIdentity`] value.
//!
//! A stored conversation is trusted only when its linkage key still matches
//! the identity it was created under:
//! - session mode: `conversationId + sessionId`
//! - email mode: `conversationId + email`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use shared_types::CreateConversationResponse;

use crate::error::StoreError;

pub const KEY_EMAIL: &str = "email";
pub const KEY_SESSION_ID: &str = "sessionId";
pub const KEY_CONVERSATION_ID: &str = "conversationId";
pub const KEY_CONVERSATION_SESSION_LINK: &str = "conversationIdSessionId";
pub const KEY_CONVERSATION_EMAIL_LINK: &str = "conversationIdEmail";
pub const KEY_IS_EMAIL_CONVERSATION: &str = "isEmailConversation";
pub const KEY_GREETING_MESSAGE: &str = "greetingMessage";

// ============================================================================
// Storage backends
// ============================================================================

/// String key/value persistence, shaped like browser `localStorage`.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

/// Process-lifetime store, used by tests and embedders that persist elsewhere.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }
}

/// JSON file store. The whole map is rewritten on each mutation through a
/// temp file + rename so a crash never leaves a torn file behind.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl FileStore {
    /// Open the store at `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.values)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        if self.values.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Identifiers attached to every backend call and used to find the conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationIdentity {
    pub email: Option<String>,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
}

/// Which identifier a conversation was created under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMode {
    /// Anonymous visitor; the backend issued a session id.
    Session,
    /// Visitor identified by email; no session id.
    Email,
}

impl IdentityMode {
    /// Read the persisted flag. Only an explicit `"false"` means session mode.
    fn from_flag(flag: Option<&str>) -> Self {
        match flag {
            Some("false") => Self::Session,
            _ => Self::Email,
        }
    }

    fn flag(self) -> &'static str {
        match self {
            Self::Session => "false",
            Self::Email => "true",
        }
    }
}

/// Key binding a conversation to the identity it was created under.
pub fn linkage_key(conversation_id: &str, discriminator: Option<&str>) -> String {
    format!("{conversation_id}{}", discriminator.unwrap_or_default())
}

/// Does the stored linkage key still match the current identity?
pub fn validate_conversation(
    identity: &ConversationIdentity,
    conversation_id: Option<&str>,
    stored_linkage: Option<&str>,
    mode: IdentityMode,
) -> bool {
    let Some(conversation_id) = conversation_id else {
        return false;
    };
    let discriminator = match mode {
        IdentityMode::Session => identity.session_id.as_deref(),
        IdentityMode::Email => identity.email.as_deref(),
    };
    stored_linkage == Some(linkage_key(conversation_id, discriminator).as_str())
}

/// Mediates all reads and writes of persisted identity state.
pub struct IdentityStore<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> IdentityStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Current identity as persisted.
    pub fn identity(&self) -> ConversationIdentity {
        ConversationIdentity {
            email: self.non_empty(KEY_EMAIL),
            session_id: self.non_empty(KEY_SESSION_ID),
            conversation_id: self.non_empty(KEY_CONVERSATION_ID),
        }
    }

    /// Apply an email handed to the page (e.g. `?email=` on the embed URL).
    ///
    /// An email identity takes precedence over an anonymous session, so the
    /// stored session id is dropped whenever one is supplied.
    pub fn resolve_identity(
        &mut self,
        query_email: Option<&str>,
    ) -> Result<ConversationIdentity, StoreError> {
        if let Some(email) = query_email.map(str::trim).filter(|e| !e.is_empty()) {
            self.store.set(KEY_EMAIL, email)?;
            self.store.remove(KEY_SESSION_ID)?;
        }
        Ok(self.identity())
    }

    /// Startup sequence: resolve the identity, then drop the stored
    /// conversation if it no longer belongs to that identity.
    pub fn restore(
        &mut self,
        query_email: Option<&str>,
    ) -> Result<ConversationIdentity, StoreError> {
        let identity = self.resolve_identity(query_email)?;
        let mode = self.mode();
        let link_key = match mode {
            IdentityMode::Session => KEY_CONVERSATION_SESSION_LINK,
            IdentityMode::Email => KEY_CONVERSATION_EMAIL_LINK,
        };
        let stored_link = self.store.get(link_key);

        if validate_conversation(
            &identity,
            identity.conversation_id.as_deref(),
            stored_link.as_deref(),
            mode,
        ) {
            return Ok(identity);
        }

        if identity.conversation_id.is_some() {
            tracing::info!(
                conversation_id = identity.conversation_id.as_deref().unwrap_or_default(),
                ?mode,
                "Stored conversation no longer matches identity; discarding"
            );
        }
        self.purge_conversation()?;
        Ok(self.identity())
    }

    /// Forget the conversation and everything derived from it. `email` survives.
    pub fn purge_conversation(&mut self) -> Result<(), StoreError> {
        for key in [
            KEY_CONVERSATION_ID,
            KEY_SESSION_ID,
            KEY_CONVERSATION_SESSION_LINK,
            KEY_CONVERSATION_EMAIL_LINK,
            KEY_IS_EMAIL_CONVERSATION,
            KEY_GREETING_MESSAGE,
        ] {
            self.store.remove(key)?;
        }
        Ok(())
    }

    /// Persist a freshly created conversation and its linkage key.
    pub fn record_conversation(
        &mut self,
        created: &CreateConversationResponse,
    ) -> Result<ConversationIdentity, StoreError> {
        let email = self.non_empty(KEY_EMAIL);
        let session_id = created.session_id.as_deref().filter(|s| !s.is_empty());

        self.store.remove(KEY_CONVERSATION_SESSION_LINK)?;
        self.store.remove(KEY_CONVERSATION_EMAIL_LINK)?;

        let mode = match session_id {
            Some(session_id) => {
                self.store.set(KEY_SESSION_ID, session_id)?;
                self.store.set(
                    KEY_CONVERSATION_SESSION_LINK,
                    &linkage_key(&created.id, Some(session_id)),
                )?;
                IdentityMode::Session
            }
            None => {
                self.store.remove(KEY_SESSION_ID)?;
                self.store.set(
                    KEY_CONVERSATION_EMAIL_LINK,
                    &linkage_key(&created.id, email.as_deref()),
                )?;
                IdentityMode::Email
            }
        };

        match created.greeting_message.as_deref() {
            Some(greeting) if !greeting.trim().is_empty() => {
                self.store.set(KEY_GREETING_MESSAGE, greeting)?
            }
            _ => self.store.remove(KEY_GREETING_MESSAGE)?,
        }
        self.store.set(KEY_CONVERSATION_ID, &created.id)?;
        self.store.set(KEY_IS_EMAIL_CONVERSATION, mode.flag())?;

        Ok(self.identity())
    }

    pub fn mode(&self) -> IdentityMode {
        IdentityMode::from_flag(self.store.get(KEY_IS_EMAIL_CONVERSATION).as_deref())
    }

    /// Email transcripts are offered only for conversations created by email.
    pub fn is_email_conversation(&self) -> bool {
        self.store.get(KEY_IS_EMAIL_CONVERSATION).as_deref() == Some("true")
    }

    pub fn greeting_message(&self) -> Option<String> {
        self.non_empty(KEY_GREETING_MESSAGE)
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    fn non_empty(&self, key: &str) -> Option<String> {
        self.store.get(key).filter(|v| !v.is_empty())
    }
}
