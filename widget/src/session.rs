//! Chat session - drives the conversation engine against the backend
//!
//! `ChatSession` owns the IO: it takes the engine lock, asks for a ticket,
//! releases the lock, awaits the backend, then re-takes the lock to report
//! the outcome. The lock is never held across an await, so a renderer can run
//! several operations concurrently (send while a poll is running, like while
//! a refetch is in flight) and the engine's tickets sort out which results
//! still apply.
//!
//! Every state change is published as a [`ChatSnapshot`] on a watch channel.

use std::sync::Arc;
use std::time::Duration;

use shared_types::{ChatSnapshot, Notice, NoticeKind};
use tokio::sync::{watch, Mutex};

use crate::api::{fetch_messages_if_any, ConversationApi};
use crate::conversation::{Conversation, PollProgress, RefetchTicket, BANNER_ERROR_TEXT};
use crate::error::ChatError;
use crate::greeting::pick_greeting;
use crate::identity::{ConversationIdentity, IdentityStore, KeyValueStore};
use crate::poller::{PollPolicy, PollStop, PollTicket};
use crate::reactions::PendingReaction;

pub const EMAIL_SENT_TEXT: &str = "Email sent successfully on your email!";

/// Timing knobs for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub poll: PollPolicy,
    /// Delay before the greeting appears in a brand-new conversation.
    pub greeting_delay: Duration,
    /// How long an email notice stays visible.
    pub notice_ttl: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            greeting_delay: Duration::from_millis(500),
            notice_ttl: Duration::from_secs(4),
        }
    }
}

struct SessionState<S: KeyValueStore> {
    conversation: Conversation,
    identity: IdentityStore<S>,
    open: bool,
    /// An open is in progress; further opens are no-ops until it finishes.
    opening: bool,
    banner: Option<String>,
    notice: Option<Notice>,
    notice_serial: u64,
}

pub struct ChatSession<A, S: KeyValueStore> {
    api: Arc<A>,
    state: Arc<Mutex<SessionState<S>>>,
    snapshot: Arc<watch::Sender<ChatSnapshot>>,
    options: SessionOptions,
}

impl<A, S: KeyValueStore> Clone for ChatSession<A, S> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            state: Arc::clone(&self.state),
            snapshot: Arc::clone(&self.snapshot),
            options: self.options,
        }
    }
}

impl<A, S> ChatSession<A, S>
where
    A: ConversationApi + 'static,
    S: KeyValueStore + 'static,
{
    /// Create a session with a greeting drawn from the pool.
    pub fn new(api: A, store: S, options: SessionOptions) -> Self {
        let (snapshot, _) = watch::channel(ChatSnapshot::default());
        Self {
            api: Arc::new(api),
            state: Arc::new(Mutex::new(SessionState {
                conversation: Conversation::new(pick_greeting(), options.poll),
                identity: IdentityStore::new(store),
                open: false,
                opening: false,
                banner: None,
                notice: None,
                notice_serial: 0,
            })),
            snapshot: Arc::new(snapshot),
            options,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshot.borrow().clone()
    }

    pub async fn identity(&self) -> ConversationIdentity {
        self.state.lock().await.identity.identity()
    }

    pub async fn active_task(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .conversation
            .active_task()
            .map(str::to_string)
    }

    /// Resolve the visitor's identity and load whichever stored conversation
    /// still belongs to it.
    pub async fn restore(&self, query_email: Option<&str>) -> Result<ConversationIdentity, ChatError> {
        let mut state = self.state.lock().await;
        let identity = state.identity.restore(query_email)?;
        let greeting = state.identity.greeting_message();
        state
            .conversation
            .reset(identity.conversation_id.clone(), greeting);
        self.publish(&state);
        Ok(identity)
    }

    // ------------------------------------------------------------------------
    // Open / refresh
    // ------------------------------------------------------------------------

    /// Open the widget, creating a conversation when none is stored.
    ///
    /// Creation failure sets the banner and leaves the widget closed; calling
    /// again retries.
    pub async fn open_chat(&self) -> Result<(), ChatError> {
        let (who, existing) = {
            let mut state = self.state.lock().await;
            if state.open || state.opening {
                return Ok(());
            }
            state.opening = true;
            let who = state.identity.identity();
            if state.conversation.conversation_id() != who.conversation_id.as_deref() {
                let greeting = state.identity.greeting_message();
                state
                    .conversation
                    .reset(who.conversation_id.clone(), greeting);
            }
            (who.clone(), who.conversation_id)
        };

        let result = match existing {
            Some(conversation_id) => self.open_existing(who, conversation_id).await,
            None => self.open_new(who).await,
        };
        self.state.lock().await.opening = false;
        result
    }

    async fn open_existing(
        &self,
        who: ConversationIdentity,
        conversation_id: String,
    ) -> Result<(), ChatError> {
        let ticket = {
            let mut state = self.state.lock().await;
            state.open = true;
            state.banner = None;
            state.conversation.reveal_greeting();
            self.publish(&state);
            state.conversation.begin_hydrate()
        };
        tracing::info!(conversation_id = %conversation_id, "Opening stored conversation");

        let result = fetch_messages_if_any(self.api.as_ref(), &who, Some(&conversation_id)).await;
        let mut state = self.state.lock().await;
        let outcome = match result {
            Ok(records) => state
                .conversation
                .apply_canonical(ticket, records.unwrap_or_default()),
            Err(e) => {
                state.conversation.refetch_failed(ticket, &e)?;
                state.banner = Some(BANNER_ERROR_TEXT.to_string());
                Err(e.into())
            }
        };
        self.publish(&state);
        outcome
    }

    async fn open_new(&self, who: ConversationIdentity) -> Result<(), ChatError> {
        let created = match self.api.create_conversation(&who).await {
            Ok(created) => created,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create conversation");
                let mut state = self.state.lock().await;
                state.banner = Some(BANNER_ERROR_TEXT.to_string());
                self.publish(&state);
                return Err(e.into());
            }
        };

        {
            let mut state = self.state.lock().await;
            state.identity.record_conversation(&created)?;
            let greeting = state.identity.greeting_message();
            state.conversation.reset(Some(created.id.clone()), greeting);
            state.open = true;
            state.banner = None;
            self.publish(&state);
        }
        tracing::info!(
            conversation_id = %created.id,
            session = created.session_id.is_some(),
            "Conversation created"
        );

        tokio::time::sleep(self.options.greeting_delay).await;
        let mut state = self.state.lock().await;
        if state.conversation.conversation_id() == Some(created.id.as_str()) {
            state.conversation.reveal_greeting();
            self.publish(&state);
        }
        Ok(())
    }

    pub async fn close_chat(&self) {
        let mut state = self.state.lock().await;
        state.open = false;
        self.publish(&state);
    }

    /// Start over with a new conversation. Any active poll is cancelled once
    /// the new conversation exists; a failed refresh leaves it running.
    pub async fn refresh(&self) -> Result<(), ChatError> {
        let who = self.state.lock().await.identity.identity();

        let created = match self.api.create_conversation(&who).await {
            Ok(created) => created,
            Err(e) => {
                tracing::error!(error = %e, "Failed to refresh conversation");
                let mut state = self.state.lock().await;
                state.banner = Some(BANNER_ERROR_TEXT.to_string());
                self.publish(&state);
                return Err(e.into());
            }
        };

        let mut state = self.state.lock().await;
        state.identity.record_conversation(&created)?;
        if let Some(task_id) = state.conversation.active_task() {
            tracing::debug!(task_id = %task_id, "Cancelling poll for refresh");
        }
        let greeting = state.identity.greeting_message();
        state.conversation.reset(Some(created.id.clone()), greeting);
        state.conversation.reveal_greeting();
        state.banner = None;
        self.publish(&state);
        tracing::info!(conversation_id = %created.id, "Conversation refreshed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Send -> poll -> refetch
    // ------------------------------------------------------------------------

    /// Send a message and wait until its reply is reconciled (or an error
    /// row has been appended).
    pub async fn send(&self, text: &str) -> Result<(), ChatError> {
        let (send, who) = {
            let mut state = self.state.lock().await;
            let send = state.conversation.begin_send(text)?;
            self.publish(&state);
            (send, state.identity.identity())
        };
        tracing::debug!(conversation_id = %send.conversation_id, seq = send.seq, "Sending message");

        let task_id = match self
            .api
            .send_message(&who, &send.conversation_id, &send.text)
            .await
        {
            Ok(task_id) => task_id,
            Err(e) => {
                let mut state = self.state.lock().await;
                state.conversation.send_failed(&send, &e)?;
                self.publish(&state);
                return Err(e.into());
            }
        };

        let ticket = {
            let mut state = self.state.lock().await;
            let ticket = state.conversation.send_accepted(&send, &task_id);
            self.publish(&state);
            ticket?
        };
        tracing::debug!(task_id = %task_id, "Polling task");

        self.poll(ticket, who, send.conversation_id).await
    }

    async fn poll(
        &self,
        ticket: PollTicket,
        who: ConversationIdentity,
        conversation_id: String,
    ) -> Result<(), ChatError> {
        let mut delay = self.options.poll.interval;
        loop {
            tokio::time::sleep(delay).await;
            if !self.state.lock().await.conversation.is_active_poll(&ticket) {
                return Err(ChatError::Stale);
            }

            let outcome = self.api.task_status(&who, ticket.task_id()).await;
            let progress = {
                let mut state = self.state.lock().await;
                let progress = state.conversation.poll_observed(&ticket, outcome);
                self.publish(&state);
                progress
            };

            match progress {
                PollProgress::Stale => return Err(ChatError::Stale),
                PollProgress::Wait(next) => delay = next,
                PollProgress::Refetch(refetch) => {
                    tracing::info!(task_id = %ticket.task_id(), "Task settled");
                    return self.refetch(refetch, &who, &conversation_id).await;
                }
                PollProgress::Stopped(PollStop::TimedOut { attempts }) => {
                    return Err(ChatError::PollTimedOut {
                        task_id: ticket.task_id().to_string(),
                        attempts,
                    })
                }
                PollProgress::Stopped(PollStop::Failed { reason }) => {
                    return Err(ChatError::PollFailed {
                        task_id: ticket.task_id().to_string(),
                        reason,
                    })
                }
            }
        }
    }

    async fn refetch(
        &self,
        ticket: RefetchTicket,
        who: &ConversationIdentity,
        conversation_id: &str,
    ) -> Result<(), ChatError> {
        let result = self.api.fetch_messages(who, conversation_id).await;
        let mut state = self.state.lock().await;
        let outcome = match result {
            Ok(records) => {
                let count = records.len();
                let applied = state.conversation.apply_canonical(ticket, records);
                if applied.is_ok() {
                    tracing::debug!(conversation_id, count, "Applied canonical message list");
                }
                applied
            }
            Err(e) => state
                .conversation
                .refetch_failed(ticket, &e)
                .and(Err(e.into())),
        };
        self.publish(&state);
        outcome
    }

    // ------------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------------

    /// Like the message at `index` of the visible list.
    pub async fn like(&self, index: usize) -> Result<(), ChatError> {
        let (reaction, who, conversation_id) = {
            let state = self.state.lock().await;
            let reaction = state.conversation.prepare_like(index)?;
            let conversation_id = current_conversation(&state.conversation)?;
            (reaction, state.identity.identity(), conversation_id)
        };
        self.submit_reaction(reaction, who, conversation_id).await
    }

    /// Open the feedback draft for the message at `index`.
    pub async fn dislike(&self, index: usize) -> Result<(), ChatError> {
        let mut state = self.state.lock().await;
        state.conversation.open_dislike(index)?;
        self.publish(&state);
        Ok(())
    }

    pub async fn edit_feedback(&self, text: &str) -> Result<(), ChatError> {
        let mut state = self.state.lock().await;
        state.conversation.edit_feedback(text)?;
        self.publish(&state);
        Ok(())
    }

    pub async fn cancel_feedback(&self) {
        let mut state = self.state.lock().await;
        if state.conversation.cancel_feedback().is_some() {
            self.publish(&state);
        }
    }

    /// Send the open dislike draft. The draft stays open if the call fails.
    pub async fn submit_feedback(&self) -> Result<(), ChatError> {
        let (reaction, who, conversation_id) = {
            let state = self.state.lock().await;
            let reaction = state.conversation.prepare_feedback()?;
            let conversation_id = current_conversation(&state.conversation)?;
            (reaction, state.identity.identity(), conversation_id)
        };
        self.submit_reaction(reaction, who, conversation_id).await
    }

    async fn submit_reaction(
        &self,
        reaction: PendingReaction,
        who: ConversationIdentity,
        conversation_id: String,
    ) -> Result<(), ChatError> {
        if let Err(e) = self
            .api
            .send_reaction(&who, &conversation_id, reaction.server_id(), &reaction.request)
            .await
        {
            tracing::warn!(
                message_id = %reaction.server_id(),
                liked = reaction.request.liked,
                error = %e,
                "Reaction failed"
            );
            return Err(e.into());
        }

        let mut state = self.state.lock().await;
        if !state.conversation.commit_reaction(&reaction) {
            tracing::debug!(message_id = %reaction.server_id(), "Reacted message no longer listed");
        }
        self.publish(&state);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Email transcript
    // ------------------------------------------------------------------------

    /// Email the transcript to the visitor. Only email-mode conversations
    /// offer this. The resulting notice expires after `notice_ttl`.
    pub async fn email_transcript(&self) -> Result<(), ChatError> {
        let (who, conversation_id) = {
            let state = self.state.lock().await;
            if !state.identity.is_email_conversation() {
                return Err(ChatError::Validation("not an email conversation"));
            }
            (
                state.identity.identity(),
                current_conversation(&state.conversation)?,
            )
        };

        let result = self.api.email_conversation(&who, &conversation_id).await;
        let (notice, outcome) = match result {
            Ok(()) => (
                Notice {
                    kind: NoticeKind::Success,
                    text: EMAIL_SENT_TEXT.to_string(),
                },
                Ok(()),
            ),
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Email transcript failed");
                (
                    Notice {
                        kind: NoticeKind::Error,
                        text: BANNER_ERROR_TEXT.to_string(),
                    },
                    Err(ChatError::from(e)),
                )
            }
        };

        let serial = {
            let mut state = self.state.lock().await;
            state.notice_serial += 1;
            state.notice = Some(notice);
            self.publish(&state);
            state.notice_serial
        };

        let session = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(session.options.notice_ttl).await;
            let mut state = session.state.lock().await;
            if state.notice_serial == serial {
                state.notice = None;
                session.publish(&state);
            }
        });

        outcome
    }

    fn publish(&self, state: &SessionState<S>) {
        let mut snapshot = ChatSnapshot {
            open: state.open,
            email_mode: state.identity.is_email_conversation(),
            banner: state.banner.clone(),
            notice: state.notice.clone(),
            ..ChatSnapshot::default()
        };
        state.conversation.fill_snapshot(&mut snapshot);
        self.snapshot.send_replace(snapshot);
    }
}

fn current_conversation(conversation: &Conversation) -> Result<String, ChatError> {
    conversation
        .conversation_id()
        .map(str::to_string)
        .ok_or(ChatError::Validation("no conversation"))
}
