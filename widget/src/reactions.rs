//! Reaction manager - like / dislike feedback on bot replies
//!
//! Reactions are committed in two steps: `prepare_*` validates and builds the
//! request, the session sends it, and only a successful response is applied
//! with [`ReactionManager::commit`]. A failed call therefore leaves the
//! message exactly as it was.

use shared_types::{FeedbackDraft, Message, MessageId, ReactionRequest, Sender};

use crate::error::ChatError;

/// A validated reaction waiting for the backend to accept it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReaction {
    pub message_id: MessageId,
    pub request: ReactionRequest,
}

impl PendingReaction {
    /// Server-side id used in the reaction URL.
    pub fn server_id(&self) -> &str {
        self.message_id.as_str()
    }
}

#[derive(Debug, Default)]
pub struct ReactionManager {
    draft: Option<FeedbackDraft>,
}

impl ReactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draft(&self) -> Option<&FeedbackDraft> {
        self.draft.as_ref()
    }

    pub fn prepare_like(
        &self,
        messages: &[Message],
        index: usize,
    ) -> Result<PendingReaction, ChatError> {
        let message = reactable(messages, index)?;
        if message.like {
            return Err(ChatError::Validation("message already liked"));
        }
        Ok(PendingReaction {
            message_id: message.id.clone(),
            request: ReactionRequest {
                liked: true,
                reason_to_dislike: None,
            },
        })
    }

    /// Open the feedback draft for `index`, replacing any draft already open.
    pub fn open_dislike(&mut self, messages: &[Message], index: usize) -> Result<(), ChatError> {
        let message = reactable(messages, index)?;
        if message.dislike {
            return Err(ChatError::Validation("message already disliked"));
        }
        self.draft = Some(FeedbackDraft {
            message_index: index,
            message_id: message.id.clone(),
            text: String::new(),
        });
        Ok(())
    }

    pub fn edit_draft(&mut self, text: impl Into<String>) -> Result<(), ChatError> {
        let draft = self
            .draft
            .as_mut()
            .ok_or(ChatError::Validation("no feedback draft open"))?;
        draft.text = text.into();
        Ok(())
    }

    pub fn cancel_draft(&mut self) -> Option<FeedbackDraft> {
        self.draft.take()
    }

    /// Build the dislike request for the open draft. The draft stays open
    /// until [`commit`](Self::commit) so a failed submit can be retried.
    pub fn prepare_feedback(&self) -> Result<PendingReaction, ChatError> {
        let draft = self
            .draft
            .as_ref()
            .ok_or(ChatError::Validation("no feedback draft open"))?;
        Ok(PendingReaction {
            message_id: draft.message_id.clone(),
            request: ReactionRequest {
                liked: false,
                reason_to_dislike: Some(draft.text.clone()),
            },
        })
    }

    /// Apply an accepted reaction. The message is located by id because the
    /// list may have been replaced while the call was in flight.
    pub fn commit(&mut self, messages: &mut [Message], reaction: &PendingReaction) -> bool {
        if !reaction.request.liked
            && self
                .draft
                .as_ref()
                .is_some_and(|d| d.message_id == reaction.message_id)
        {
            self.draft = None;
        }

        let Some(message) = messages.iter_mut().find(|m| m.id == reaction.message_id) else {
            return false;
        };
        apply_reaction(message, &reaction.request);
        true
    }

    pub fn clear(&mut self) {
        self.draft = None;
    }
}

/// Set one side of the like/dislike pair and clear the other.
pub fn apply_reaction(message: &mut Message, request: &ReactionRequest) {
    if request.liked {
        message.like = true;
        message.dislike = false;
        message.reason_to_dislike = None;
    } else {
        message.like = false;
        message.dislike = true;
        message.reason_to_dislike = request.reason_to_dislike.clone();
    }
}

fn reactable(messages: &[Message], index: usize) -> Result<&Message, ChatError> {
    let message = messages
        .get(index)
        .ok_or(ChatError::Validation("no message at index"))?;
    if message.sender != Sender::Bot || message.id.is_provisional() {
        return Err(ChatError::Validation("message cannot be rated"));
    }
    Ok(message)
}
