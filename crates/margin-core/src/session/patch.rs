//! Patch proposal review state
//!
//! A proposal is keyed by the id of the message that carries its review card.
//! Status moves one way, from pending to accepted or rejected. The only
//! mutation allowed on a pending proposal is a feedback refinement, which
//! swaps the text and bumps the revision.

use std::collections::HashMap;

use super::types::{ChatMessage, MessageId, PatchAnchor, PatchKind, PatchReview, PatchStatus};

/// A candidate edit awaiting review
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchProposal {
    pub message_id: MessageId,
    pub kind: PatchKind,
    pub anchor: PatchAnchor,
    pub text: String,
    pub status: PatchStatus,
    pub error: Option<String>,
    pub revision: u32,
}

impl PatchProposal {
    pub fn new(kind: PatchKind, anchor: PatchAnchor, text: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            kind,
            anchor,
            text: text.into(),
            status: PatchStatus::Pending,
            error: None,
            revision: 0,
        }
    }

    /// Rebuild a proposal from a persisted review card
    pub fn from_message(message: &ChatMessage) -> Option<Self> {
        let review = message.patch.as_ref()?;
        Some(Self {
            message_id: message.id.clone(),
            kind: review.kind,
            anchor: review.anchor.clone(),
            text: review.text.clone(),
            status: review.status,
            error: review.error.clone(),
            revision: review.revision,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == PatchStatus::Pending
    }

    pub fn review(&self) -> PatchReview {
        PatchReview {
            kind: self.kind,
            anchor: self.anchor.clone(),
            text: self.text.clone(),
            status: self.status,
            error: self.error.clone(),
            revision: self.revision,
        }
    }

    /// The history message carrying this proposal's review card
    pub fn to_message(&self) -> ChatMessage {
        let mut message = ChatMessage::patch_card(self.review());
        message.id = self.message_id.clone();
        message
    }
}

/// Everything the editor needs to apply a proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    pub message_id: MessageId,
    pub kind: PatchKind,
    pub anchor: PatchAnchor,
    pub text: String,
}

/// Per-session proposal state
#[derive(Debug, Default)]
pub struct PatchProposalStore {
    proposals: HashMap<MessageId, PatchProposal>,
    /// Proposals of the active job, in arrival order, not yet in history
    staged: Vec<MessageId>,
}

impl PatchProposalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load review cards from persisted history
    pub fn restore(&mut self, messages: &[ChatMessage]) {
        for proposal in messages.iter().filter_map(PatchProposal::from_message) {
            self.proposals.insert(proposal.message_id.clone(), proposal);
        }
    }

    /// Hold a proposal until the active job finalizes
    pub fn stage(&mut self, proposal: PatchProposal) -> MessageId {
        let id = proposal.message_id.clone();
        self.staged.push(id.clone());
        self.proposals.insert(id.clone(), proposal);
        id
    }

    /// Record a proposal whose card goes into history right away
    pub fn insert(&mut self, proposal: PatchProposal) -> ChatMessage {
        let message = proposal.to_message();
        self.proposals.insert(proposal.message_id.clone(), proposal);
        message
    }

    /// Review cards of the staged proposals, in arrival order
    pub fn take_staged(&mut self) -> Vec<ChatMessage> {
        std::mem::take(&mut self.staged)
            .into_iter()
            .filter_map(|id| self.proposals.get(&id).map(PatchProposal::to_message))
            .collect()
    }

    /// Forget staged proposals; returns how many were dropped
    pub fn discard_staged(&mut self) -> usize {
        let staged = std::mem::take(&mut self.staged);
        for id in &staged {
            self.proposals.remove(id);
        }
        staged.len()
    }

    #[cfg(test)]
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Move a pending proposal to accepted or rejected
    pub fn set_status(&mut self, message_id: &str, status: PatchStatus) -> bool {
        if status == PatchStatus::Pending {
            return false;
        }
        match self.proposals.get_mut(message_id) {
            Some(proposal) if proposal.is_pending() => {
                proposal.status = status;
                if status == PatchStatus::Accepted {
                    proposal.error = None;
                }
                true
            }
            _ => false,
        }
    }

    /// A proposal that can still be refined or reviewed
    pub fn pending(&self, message_id: &str) -> Option<&PatchProposal> {
        self.proposals.get(message_id).filter(|p| p.is_pending())
    }

    /// Replace a pending proposal's text with a refined version
    pub fn refine(&mut self, message_id: &str, text: impl Into<String>) -> bool {
        let Some(proposal) = self.proposals.get_mut(message_id) else {
            return false;
        };
        if !proposal.is_pending() {
            return false;
        }

        proposal.text = text.into();
        proposal.revision += 1;
        proposal.error = None;
        true
    }

    /// Start applying a proposal; only pending proposals qualify
    pub fn begin_apply(&self, message_id: &str) -> Option<ApplyRequest> {
        let proposal = self.proposals.get(message_id).filter(|p| p.is_pending())?;
        Some(ApplyRequest {
            message_id: proposal.message_id.clone(),
            kind: proposal.kind,
            anchor: proposal.anchor.clone(),
            text: proposal.text.clone(),
        })
    }

    /// Attach an apply failure; the proposal stays pending
    pub fn record_error(&mut self, message_id: &str, error: impl Into<String>) -> bool {
        match self.proposals.get_mut(message_id) {
            Some(proposal) if proposal.is_pending() => {
                proposal.error = Some(error.into());
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, message_id: &str) -> Option<PatchProposal> {
        self.staged.retain(|id| id != message_id);
        self.proposals.remove(message_id)
    }

    pub fn get(&self, message_id: &str) -> Option<&PatchProposal> {
        self.proposals.get(message_id)
    }

    /// Current review block for a message
    pub fn review(&self, message_id: &str) -> Option<PatchReview> {
        self.proposals.get(message_id).map(PatchProposal::review)
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection_patch(text: &str) -> PatchProposal {
        PatchProposal::new(
            PatchKind::ReplaceSelection,
            PatchAnchor::Selection {
                start: 0,
                end: 5,
                expected_text: Some("hello".to_string()),
            },
            text,
        )
    }

    #[test]
    fn test_stage_and_take_in_order() {
        let mut store = PatchProposalStore::new();
        let first = store.stage(selection_patch("one"));
        let second = store.stage(selection_patch("two"));

        let cards = store.take_staged();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].id, first);
        assert_eq!(cards[1].id, second);
        assert_eq!(cards[0].patch.as_ref().unwrap().status, PatchStatus::Pending);
        assert_eq!(store.staged_len(), 0);
        assert!(store.get(&first).is_some());
    }

    #[test]
    fn test_discard_staged_forgets_proposals() {
        let mut store = PatchProposalStore::new();
        let id = store.stage(selection_patch("one"));

        assert_eq!(store.discard_staged(), 1);
        assert!(store.get(&id).is_none());
        assert!(store.take_staged().is_empty());
    }

    #[test]
    fn test_status_is_one_way() {
        let mut store = PatchProposalStore::new();
        let card = store.insert(selection_patch("one"));

        assert!(store.set_status(&card.id, PatchStatus::Accepted));
        assert!(!store.set_status(&card.id, PatchStatus::Rejected));
        assert!(!store.set_status(&card.id, PatchStatus::Pending));
        assert_eq!(store.get(&card.id).unwrap().status, PatchStatus::Accepted);
        assert!(store.begin_apply(&card.id).is_none());
    }

    #[test]
    fn test_refine_keeps_pending() {
        let mut store = PatchProposalStore::new();
        let card = store.insert(selection_patch("one"));

        store.record_error(&card.id, "Anchor moved");
        assert!(store.refine(&card.id, "one, refined"));
        assert!(store.refine(&card.id, "one, refined again"));
        let proposal = store.pending(&card.id).unwrap();
        assert_eq!(proposal.text, "one, refined again");
        assert_eq!(proposal.revision, 2);
        assert!(proposal.error.is_none());
    }

    #[test]
    fn test_feedback_target_must_be_pending() {
        let mut store = PatchProposalStore::new();
        let card = store.insert(selection_patch("one"));
        store.set_status(&card.id, PatchStatus::Rejected);

        assert!(store.pending(&card.id).is_none());
        assert!(!store.refine(&card.id, "nope"));
        assert!(store.pending("missing").is_none());
    }

    #[test]
    fn test_apply_error_stays_pending() {
        let mut store = PatchProposalStore::new();
        let card = store.insert(selection_patch("one"));

        let request = store.begin_apply(&card.id).unwrap();
        assert_eq!(request.text, "one");

        assert!(store.record_error(&card.id, "selection changed"));
        let review = store.review(&card.id).unwrap();
        assert_eq!(review.status, PatchStatus::Pending);
        assert_eq!(review.error.as_deref(), Some("selection changed"));

        assert!(store.set_status(&card.id, PatchStatus::Accepted));
        assert!(store.review(&card.id).unwrap().error.is_none());
    }

    #[test]
    fn test_restore_from_history() {
        let mut source = PatchProposalStore::new();
        let card = source.insert(selection_patch("one"));

        let mut store = PatchProposalStore::new();
        store.restore(&[ChatMessage::user("hi"), card.clone()]);
        assert_eq!(store.len(), 1);
        assert!(store.begin_apply(&card.id).is_some());

        assert!(store.remove(&card.id).is_some());
        assert!(store.is_empty());
    }
}
