//! Conversation reconciliation engine
//!
//! Single source of truth for what the visitor sees. Everything here is
//! synchronous: the session performs the IO and reports each completion back
//! with the ticket it was issued, and the engine decides whether that result
//! still applies.
//!
//! Send lifecycle:
//! 1. [`Conversation::begin_send`] appends an optimistic user row (local id)
//! 2. [`Conversation::send_accepted`] hands the task id to the poller, or
//!    [`Conversation::send_failed`] appends the bot error row
//! 3. [`Conversation::poll_observed`] advances the poller; success issues a
//!    settling [`RefetchTicket`]
//! 4. [`Conversation::apply_canonical`] replaces the list wholesale
//!
//! Optimistic rows of sends that are still waiting for their task id survive
//! a replacement; every other local row is dropped in favour of the server's.

use std::collections::BTreeMap;
use std::time::Duration;

use shared_types::{
    ApiMessage, ChatSnapshot, FeedbackDraft, Message, MessageId, Sender, TaskStatus,
};

use crate::error::{ApiError, ChatError};
use crate::poller::{PollPolicy, PollStep, PollStop, PollTicket, TaskPoller};
use crate::reactions::{PendingReaction, ReactionManager};

/// Bot row appended when a message could not be processed.
pub const SEND_ERROR_TEXT: &str =
    "Sorry, there was an error processing your request. Please try again.";

/// Banner shown when a conversation cannot be created or loaded.
pub const BANNER_ERROR_TEXT: &str = "An error occurred. Please try again.";

/// A send waiting for its task id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingSend {
    pub seq: u64,
    epoch: u64,
    pub conversation_id: String,
    pub text: String,
}

/// Permission to replace the message list with a fetched canonical one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefetchTicket {
    serial: u64,
    settling: bool,
}

/// Outcome of feeding a status query to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollProgress {
    Stale,
    Wait(Duration),
    Refetch(RefetchTicket),
    Stopped(PollStop),
}

#[derive(Debug)]
pub struct Conversation {
    conversation_id: Option<String>,
    messages: Vec<Message>,
    greeting_text: String,
    greeting: Option<Message>,
    epoch: u64,
    next_seq: u64,
    latest_polled_seq: u64,
    /// seq -> local id of the optimistic row
    in_flight: BTreeMap<u64, MessageId>,
    poller: TaskPoller,
    refetch_serial: u64,
    settling: Option<u64>,
    reactions: ReactionManager,
}

impl Conversation {
    pub fn new(greeting_text: impl Into<String>, policy: PollPolicy) -> Self {
        Self {
            conversation_id: None,
            messages: Vec::new(),
            greeting_text: greeting_text.into(),
            greeting: None,
            epoch: 0,
            next_seq: 0,
            latest_polled_seq: 0,
            in_flight: BTreeMap::new(),
            poller: TaskPoller::new(policy),
            refetch_serial: 0,
            settling: None,
            reactions: ReactionManager::new(),
        }
    }

    // --------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Canonical list plus optimistic rows, without the greeting.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// What the renderer shows: greeting (once revealed) followed by the list.
    pub fn visible_messages(&self) -> Vec<Message> {
        self.greeting
            .iter()
            .cloned()
            .chain(self.messages.iter().cloned())
            .collect()
    }

    /// True while a send awaits its task id, a task is polling, or the
    /// settling refetch is outstanding.
    pub fn typing(&self) -> bool {
        !self.in_flight.is_empty() || self.poller.is_polling() || self.settling.is_some()
    }

    pub fn active_task(&self) -> Option<&str> {
        self.poller.task_id()
    }

    pub fn feedback(&self) -> Option<&FeedbackDraft> {
        self.reactions.draft()
    }

    pub fn greeting_text(&self) -> &str {
        &self.greeting_text
    }

    /// Fill the conversation-owned fields of a snapshot.
    pub fn fill_snapshot(&self, snapshot: &mut ChatSnapshot) {
        snapshot.conversation_id = self.conversation_id.clone();
        snapshot.messages = self.visible_messages();
        snapshot.typing = self.typing();
        snapshot.feedback = self.reactions.draft().cloned();
    }

    // --------------------------------------------------------------------
    // Initialization
    // --------------------------------------------------------------------

    /// Point the engine at `conversation_id`, dropping all local state.
    ///
    /// Results still in flight for the previous conversation become stale.
    /// `greeting_override` (the backend's greeting for this conversation)
    /// replaces the pooled greeting when present.
    pub fn reset(&mut self, conversation_id: Option<String>, greeting_override: Option<String>) {
        self.epoch += 1;
        self.refetch_serial += 1;
        self.settling = None;
        self.in_flight.clear();
        self.poller.cancel();
        self.reactions.clear();
        self.messages.clear();
        self.greeting = None;
        self.conversation_id = conversation_id;
        if let Some(greeting) = greeting_override.filter(|g| !g.trim().is_empty()) {
            self.greeting_text = greeting;
        }
    }

    pub fn reveal_greeting(&mut self) {
        if self.greeting.is_none() {
            self.greeting = Some(Message::local(Sender::Bot, self.greeting_text.clone()));
        }
    }

    /// Ticket for a non-settling fetch (hydration on open).
    pub fn begin_hydrate(&mut self) -> RefetchTicket {
        RefetchTicket {
            serial: self.refetch_serial,
            settling: false,
        }
    }

    // --------------------------------------------------------------------
    // Send lifecycle
    // --------------------------------------------------------------------

    /// Append the optimistic row and register the send. Blank input and a
    /// missing conversation are silent no-ops.
    pub fn begin_send(&mut self, text: &str) -> Result<OutgoingSend, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::Validation("empty message"));
        }
        let conversation_id = self
            .conversation_id
            .clone()
            .ok_or(ChatError::Validation("no conversation"))?;

        self.next_seq += 1;
        let optimistic = Message::local(Sender::User, text);
        self.in_flight.insert(self.next_seq, optimistic.id.clone());
        self.messages.push(optimistic);

        Ok(OutgoingSend {
            seq: self.next_seq,
            epoch: self.epoch,
            conversation_id,
            text: text.to_string(),
        })
    }

    /// The backend accepted the send and returned a task id.
    ///
    /// If a later send is still polling, its settle will bring this reply
    /// too, so this task is not polled. A task id that arrives after the later
    /// send has already stopped polling is polled on its own.
    pub fn send_accepted(
        &mut self,
        send: &OutgoingSend,
        task_id: &str,
    ) -> Result<PollTicket, ChatError> {
        if send.epoch != self.epoch {
            return Err(ChatError::Stale);
        }
        self.in_flight.remove(&send.seq);
        if send.seq < self.latest_polled_seq && self.poller.is_polling() {
            return Err(ChatError::Stale);
        }
        self.latest_polled_seq = self.latest_polled_seq.max(send.seq);
        // An outstanding settle refetch would now miss this task's reply.
        self.refetch_serial += 1;
        self.settling = None;
        Ok(self.poller.start(task_id))
    }

    pub fn send_failed(&mut self, send: &OutgoingSend, error: &ApiError) -> Result<(), ChatError> {
        if send.epoch != self.epoch {
            return Err(ChatError::Stale);
        }
        tracing::error!(
            conversation_id = %send.conversation_id,
            error = %error,
            "Message send failed"
        );
        self.in_flight.remove(&send.seq);
        self.messages.push(Message::local(Sender::Bot, SEND_ERROR_TEXT));
        Ok(())
    }

    /// Feed one status query outcome.
    pub fn poll_observed(
        &mut self,
        ticket: &PollTicket,
        outcome: Result<TaskStatus, ApiError>,
    ) -> PollProgress {
        match self.poller.observe(ticket, outcome) {
            PollStep::Stale => PollProgress::Stale,
            PollStep::Continue(delay) => PollProgress::Wait(delay),
            PollStep::Settled => {
                self.refetch_serial += 1;
                self.settling = Some(self.refetch_serial);
                PollProgress::Refetch(RefetchTicket {
                    serial: self.refetch_serial,
                    settling: true,
                })
            }
            PollStep::Stopped(stop) => {
                tracing::error!(task_id = %ticket.task_id(), ?stop, "Stopped polling task");
                self.messages.push(Message::local(Sender::Bot, SEND_ERROR_TEXT));
                PollProgress::Stopped(stop)
            }
        }
    }

    pub fn is_active_poll(&self, ticket: &PollTicket) -> bool {
        self.poller.is_current(ticket)
    }

    // --------------------------------------------------------------------
    // Canonical list
    // --------------------------------------------------------------------

    pub fn is_current(&self, ticket: &RefetchTicket) -> bool {
        ticket.serial == self.refetch_serial
    }

    /// Replace the list with the server's version.
    pub fn apply_canonical(
        &mut self,
        ticket: RefetchTicket,
        records: Vec<ApiMessage>,
    ) -> Result<(), ChatError> {
        if !self.is_current(&ticket) {
            return Err(ChatError::Stale);
        }
        if ticket.settling {
            self.settling = None;
        }

        let mut next: Vec<Message> = records.into_iter().map(ApiMessage::into_message).collect();
        let waiting: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| self.in_flight.values().any(|id| *id == m.id))
            .cloned()
            .collect();
        next.extend(waiting);
        self.messages = next;

        if let Some(draft) = self.reactions.draft() {
            if !self.messages.iter().any(|m| m.id == draft.message_id) {
                self.reactions.clear();
            }
        }
        Ok(())
    }

    pub fn refetch_failed(
        &mut self,
        ticket: RefetchTicket,
        error: &ApiError,
    ) -> Result<(), ChatError> {
        if !self.is_current(&ticket) {
            return Err(ChatError::Stale);
        }
        tracing::error!(error = %error, settling = ticket.settling, "Conversation refetch failed");
        if ticket.settling {
            self.settling = None;
            self.messages.push(Message::local(Sender::Bot, SEND_ERROR_TEXT));
        }
        Ok(())
    }

    // --------------------------------------------------------------------
    // Reactions (indices refer to `visible_messages`)
    // --------------------------------------------------------------------

    pub fn prepare_like(&self, index: usize) -> Result<PendingReaction, ChatError> {
        self.reactions.prepare_like(&self.visible_messages(), index)
    }

    pub fn open_dislike(&mut self, index: usize) -> Result<(), ChatError> {
        let visible = self.visible_messages();
        self.reactions.open_dislike(&visible, index)
    }

    pub fn edit_feedback(&mut self, text: impl Into<String>) -> Result<(), ChatError> {
        self.reactions.edit_draft(text)
    }

    pub fn cancel_feedback(&mut self) -> Option<FeedbackDraft> {
        self.reactions.cancel_draft()
    }

    pub fn prepare_feedback(&self) -> Result<PendingReaction, ChatError> {
        self.reactions.prepare_feedback()
    }

    pub fn commit_reaction(&mut self, reaction: &PendingReaction) -> bool {
        self.reactions.commit(&mut self.messages, reaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Conversation {
        let mut conversation = Conversation::new(
            "Hello from the pool",
            PollPolicy {
                interval: Duration::from_millis(500),
                max_attempts: 10,
                max_consecutive_errors: 2,
            },
        );
        conversation.reset(Some("c1".to_string()), None);
        conversation
    }

    fn record(id: &str, role: &str, text: &str) -> ApiMessage {
        ApiMessage {
            id: id.to_string(),
            role: role.to_string(),
            text: Some(text.to_string()),
            created_at: Some("2025-03-02T10:15:00Z".to_string()),
            url: None,
            liked: None,
            reason_to_dislike: None,
            query_type: None,
            query_count: None,
        }
    }

    #[test]
    fn test_blank_send_changes_nothing() {
        let mut conversation = engine();
        for text in ["", "   ", "\n\t"] {
            assert!(matches!(
                conversation.begin_send(text),
                Err(ChatError::Validation(_))
            ));
        }
        assert!(conversation.messages().is_empty());
        assert!(!conversation.typing());
    }

    #[test]
    fn test_send_without_conversation_is_noop() {
        let mut conversation = Conversation::new("hi", PollPolicy::default());
        assert!(conversation.begin_send("hello").is_err());
        assert!(conversation.messages().is_empty());
    }

    #[test]
    fn test_optimistic_row_then_canonical_replacement() {
        let mut conversation = engine();
        let send = conversation.begin_send("Find me a grant").unwrap();

        assert_eq!(conversation.messages().len(), 1);
        assert!(conversation.messages()[0].is_provisional());
        assert!(conversation.typing());

        let ticket = conversation.send_accepted(&send, "t1").unwrap();
        assert!(conversation.typing());
        let PollProgress::Refetch(refetch) =
            conversation.poll_observed(&ticket, Ok(TaskStatus::Success))
        else {
            panic!("expected refetch");
        };
        assert!(conversation.typing(), "typing holds until the refetch lands");

        conversation
            .apply_canonical(
                refetch,
                vec![
                    record("1", "user", "Find me a grant"),
                    record("2", "assistant", "Try the Rural Arts fund"),
                ],
            )
            .unwrap();

        let messages = conversation.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| !m.is_provisional()));
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[0].text, "Find me a grant");
        assert_eq!(messages[0].time.len(), 5);
        assert!(!conversation.typing());
        assert_eq!(conversation.active_task(), None);
    }

    #[test]
    fn test_send_failure_appends_error_and_clears_typing() {
        let mut conversation = engine();
        let send = conversation.begin_send("hello").unwrap();
        conversation
            .send_failed(&send, &ApiError::MissingField("data.task_id"))
            .unwrap();

        let messages = conversation.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].sender, Sender::Bot);
        assert_eq!(messages[1].text, SEND_ERROR_TEXT);
        assert!(!conversation.typing());
    }

    #[test]
    fn test_superseded_poll_does_not_touch_newer_send() {
        let mut conversation = engine();
        let send_a = conversation.begin_send("first").unwrap();
        let ticket_a = conversation.send_accepted(&send_a, "task-a").unwrap();
        let send_b = conversation.begin_send("second").unwrap();
        let ticket_b = conversation.send_accepted(&send_b, "task-b").unwrap();

        let before = conversation.messages().to_vec();
        assert_eq!(
            conversation.poll_observed(&ticket_a, Ok(TaskStatus::Success)),
            PollProgress::Stale
        );
        assert_eq!(conversation.messages(), before.as_slice());
        assert!(conversation.typing());
        assert_eq!(conversation.active_task(), Some("task-b"));

        assert!(matches!(
            conversation.poll_observed(&ticket_b, Ok(TaskStatus::Pending)),
            PollProgress::Wait(_)
        ));
    }

    #[test]
    fn test_late_task_id_while_newer_send_polls_is_not_polled() {
        let mut conversation = engine();
        let send_a = conversation.begin_send("first").unwrap();
        let send_b = conversation.begin_send("second").unwrap();

        conversation.send_accepted(&send_b, "task-b").unwrap();
        assert!(matches!(
            conversation.send_accepted(&send_a, "task-a"),
            Err(ChatError::Stale)
        ));
        assert_eq!(conversation.active_task(), Some("task-b"));
        assert!(conversation.typing());
    }

    #[test]
    fn test_task_id_after_newer_send_settled_is_still_polled() {
        let mut conversation = engine();
        let send_a = conversation.begin_send("A").unwrap();
        let send_b = conversation.begin_send("B").unwrap();

        let ticket_b = conversation.send_accepted(&send_b, "task-b").unwrap();
        let PollProgress::Refetch(refetch_b) =
            conversation.poll_observed(&ticket_b, Ok(TaskStatus::Success))
        else {
            panic!("expected refetch");
        };
        conversation
            .apply_canonical(
                refetch_b,
                vec![
                    record("1", "user", "A"),
                    record("2", "user", "B"),
                    record("3", "assistant", "reply B"),
                ],
            )
            .unwrap();
        assert!(conversation.typing(), "A still awaits its task id");

        let ticket_a = conversation.send_accepted(&send_a, "task-a").unwrap();
        assert_eq!(conversation.active_task(), Some("task-a"));
        assert!(conversation.typing());

        let PollProgress::Refetch(refetch_a) =
            conversation.poll_observed(&ticket_a, Ok(TaskStatus::Success))
        else {
            panic!("expected refetch");
        };
        conversation
            .apply_canonical(
                refetch_a,
                vec![
                    record("1", "user", "A"),
                    record("2", "user", "B"),
                    record("3", "assistant", "reply B"),
                    record("4", "assistant", "reply A"),
                ],
            )
            .unwrap();

        assert!(conversation.messages().iter().all(|m| !m.is_provisional()));
        assert_eq!(conversation.messages().len(), 4);
        assert!(!conversation.typing());
    }

    #[test]
    fn test_new_poll_invalidates_outstanding_settle_refetch() {
        let mut conversation = engine();
        let send_a = conversation.begin_send("first").unwrap();
        let ticket_a = conversation.send_accepted(&send_a, "task-a").unwrap();
        let PollProgress::Refetch(refetch_a) =
            conversation.poll_observed(&ticket_a, Ok(TaskStatus::Success))
        else {
            panic!("expected refetch");
        };

        let send_b = conversation.begin_send("second").unwrap();
        conversation.send_accepted(&send_b, "task-b").unwrap();

        assert!(matches!(
            conversation.apply_canonical(refetch_a, vec![record("1", "user", "first")]),
            Err(ChatError::Stale)
        ));
        assert_eq!(conversation.messages().len(), 2);
        assert!(conversation.typing());
    }

    #[test]
    fn test_in_flight_optimistic_row_survives_replacement() {
        let mut conversation = engine();
        let hydrate = conversation.begin_hydrate();
        let _send = conversation.begin_send("still sending").unwrap();

        conversation
            .apply_canonical(hydrate, vec![record("1", "assistant", "Earlier reply")])
            .unwrap();

        let messages = conversation.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text, "still sending");
        assert!(messages[1].is_provisional());
    }

    #[test]
    fn test_poll_stop_appends_error_and_clears_typing() {
        let mut conversation = engine();
        let send = conversation.begin_send("hello").unwrap();
        let ticket = conversation.send_accepted(&send, "t1").unwrap();

        let err = || Err(ApiError::Network("down".into()));
        assert!(matches!(
            conversation.poll_observed(&ticket, err()),
            PollProgress::Wait(_)
        ));
        assert!(matches!(
            conversation.poll_observed(&ticket, err()),
            PollProgress::Stopped(PollStop::Failed { .. })
        ));
        assert!(!conversation.typing());
        assert_eq!(
            conversation.messages().last().map(|m| m.text.as_str()),
            Some(SEND_ERROR_TEXT)
        );
    }

    #[test]
    fn test_settle_refetch_failure_clears_typing() {
        let mut conversation = engine();
        let send = conversation.begin_send("hello").unwrap();
        let ticket = conversation.send_accepted(&send, "t1").unwrap();
        let PollProgress::Refetch(refetch) =
            conversation.poll_observed(&ticket, Ok(TaskStatus::Success))
        else {
            panic!("expected refetch");
        };

        conversation
            .refetch_failed(refetch, &ApiError::Server {
                status: 500,
                body: String::new(),
            })
            .unwrap();
        assert!(!conversation.typing());
    }

    #[test]
    fn test_reset_makes_everything_in_flight_stale() {
        let mut conversation = engine();
        let send = conversation.begin_send("hello").unwrap();
        let hydrate = conversation.begin_hydrate();

        conversation.reset(Some("c2".to_string()), Some("Fresh start".to_string()));

        assert!(matches!(
            conversation.send_accepted(&send, "t1"),
            Err(ChatError::Stale)
        ));
        assert!(matches!(
            conversation.apply_canonical(hydrate, vec![]),
            Err(ChatError::Stale)
        ));
        assert!(!conversation.typing());
        assert_eq!(conversation.greeting_text(), "Fresh start");
        assert_eq!(conversation.conversation_id(), Some("c2"));
    }

    #[test]
    fn test_greeting_prefixes_visible_list_and_shifts_indices() {
        let mut conversation = engine();
        let hydrate = conversation.begin_hydrate();
        conversation
            .apply_canonical(hydrate, vec![record("9", "assistant", "Reply")])
            .unwrap();
        conversation.reveal_greeting();

        let visible = conversation.visible_messages();
        assert_eq!(visible[0].text, "Hello from the pool");
        assert!(conversation.prepare_like(0).is_err());

        let like = conversation.prepare_like(1).unwrap();
        assert!(conversation.commit_reaction(&like));
        assert!(conversation.messages()[0].like);
    }

    #[test]
    fn test_draft_dropped_when_target_disappears() {
        let mut conversation = engine();
        let hydrate = conversation.begin_hydrate();
        conversation
            .apply_canonical(hydrate, vec![record("9", "assistant", "Reply")])
            .unwrap();
        conversation.open_dislike(0).unwrap();
        assert!(conversation.feedback().is_some());

        let refetch = conversation.begin_hydrate();
        conversation
            .apply_canonical(refetch, vec![record("10", "assistant", "Other")])
            .unwrap();
        assert!(conversation.feedback().is_none());
    }
}
