//! Conversation persistence boundary
//!
//! The core never writes to stable storage itself. At every commit it hands
//! the full normalized message list to a [`Persistence`] implementation and
//! re-derives its history from the state that comes back.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::session::types::{ChatMessage, ConversationId};

/// Persisted state of one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub messages: Vec<ChatMessage>,
    /// Bumped on every accepted write
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            revision: 0,
            updated_at: Utc::now(),
        }
    }
}

impl ConversationState {
    pub fn with_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Next state after replacing the messages
    pub fn advance(&self, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            revision: self.revision + 1,
            updated_at: Utc::now(),
        }
    }
}

/// Storage collaborator for conversation history
pub trait Persistence: Send + Sync {
    /// Replace a conversation's messages, returning the new state
    fn set_conversation_messages(
        &self,
        state: &ConversationState,
        provider: &str,
        conversation_id: &str,
        messages: Vec<ChatMessage>,
    ) -> ConversationState;
}

/// Default persistence: keeps the latest state of every conversation in memory
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    conversations: RwLock<HashMap<ConversationId, ConversationState>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest committed state of a conversation
    pub fn load(&self, conversation_id: &str) -> Option<ConversationState> {
        self.conversations.read().get(conversation_id).cloned()
    }

    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.conversations.read().keys().cloned().collect()
    }
}

impl Persistence for InMemoryPersistence {
    fn set_conversation_messages(
        &self,
        state: &ConversationState,
        provider: &str,
        conversation_id: &str,
        messages: Vec<ChatMessage>,
    ) -> ConversationState {
        let next = state.advance(messages);
        tracing::debug!(
            conversation_id,
            provider,
            revision = next.revision,
            messages = next.messages.len(),
            "Stored conversation"
        );
        self.conversations
            .write()
            .insert(conversation_id.to_string(), next.clone());
        next
    }
}

/// Drop blank messages and repeated ids, keeping the first occurrence
pub fn normalize_messages(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut seen = HashSet::new();
    messages
        .into_iter()
        .filter(|m| m.patch.is_some() || !m.content.trim().is_empty())
        .filter(|m| seen.insert(m.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_bumps_revision() {
        let store = InMemoryPersistence::new();
        let state = ConversationState::default();

        let next = store.set_conversation_messages(
            &state,
            "default",
            "conv-1",
            vec![ChatMessage::user("hi")],
        );
        assert_eq!(next.revision, 1);
        assert_eq!(next.messages.len(), 1);

        let again = store.set_conversation_messages(&next, "default", "conv-1", Vec::new());
        assert_eq!(again.revision, 2);
        assert_eq!(store.load("conv-1").unwrap().revision, 2);
        assert!(store.load("conv-2").is_none());
    }

    #[test]
    fn test_normalize_drops_blank_and_duplicate() {
        let keep = ChatMessage::assistant("Hello");
        let duplicate = keep.clone();
        let normalized = normalize_messages(vec![
            ChatMessage::user("Question"),
            ChatMessage::assistant("   "),
            keep,
            duplicate,
        ]);

        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[1].content, "Hello");
    }
}
