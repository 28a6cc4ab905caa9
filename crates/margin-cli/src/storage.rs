//! Saved conversations as JSON files

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use margin_core::session::ChatMessage;
use margin_core::{ConversationState, Persistence};

/// On-disk form of one conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedConversation {
    pub conversation_id: String,
    pub provider: String,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
}

impl SavedConversation {
    pub fn into_state(self) -> ConversationState {
        ConversationState {
            messages: self.messages,
            revision: self.revision,
            updated_at: self.updated_at,
        }
    }
}

/// Get the default conversations directory
pub fn default_conversations_dir() -> anyhow::Result<PathBuf> {
    let data_dir =
        dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
    Ok(data_dir.join("margin").join("conversations"))
}

/// Writes every commit to `<dir>/<conversation id>.json`
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, conversation_id: &str) -> PathBuf {
        let name: String = conversation_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }

    /// Load a saved conversation, if one exists
    pub fn load(&self, conversation_id: &str) -> anyhow::Result<Option<SavedConversation>> {
        let path = self.path_for(conversation_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn write(&self, saved: &SavedConversation) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&saved.conversation_id);
        let content = serde_json::to_string_pretty(saved)?;
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

impl Persistence for JsonFilePersistence {
    fn set_conversation_messages(
        &self,
        state: &ConversationState,
        provider: &str,
        conversation_id: &str,
        messages: Vec<ChatMessage>,
    ) -> ConversationState {
        let next = state.advance(messages);
        let saved = SavedConversation {
            conversation_id: conversation_id.to_string(),
            provider: provider.to_string(),
            revision: next.revision,
            updated_at: next.updated_at,
            messages: next.messages.clone(),
        };

        // The session keeps the new state even when the write fails
        match self.write(&saved) {
            Ok(path) => debug!(path = %path.display(), revision = next.revision, "Saved conversation"),
            Err(e) => warn!(conversation_id, "Failed to save conversation: {}", e),
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = JsonFilePersistence::new(temp.path().join("conversations"));

        let state = store.set_conversation_messages(
            &ConversationState::default(),
            "scripted",
            "demo",
            vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
        );
        assert_eq!(state.revision, 1);

        let saved = store.load("demo").unwrap().unwrap();
        assert_eq!(saved.provider, "scripted");
        assert_eq!(saved.revision, 1);
        assert_eq!(saved.messages.len(), 2);
        assert_eq!(saved.into_state().messages[1].content, "hello");
    }

    #[test]
    fn test_missing_conversation() {
        let temp = TempDir::new().unwrap();
        let store = JsonFilePersistence::new(temp.path());
        assert!(store.load("nothing").unwrap().is_none());
    }

    #[test]
    fn test_ids_are_sanitized() {
        let store = JsonFilePersistence::new("/tmp/margin");
        assert_eq!(
            store.path_for("../etc/passwd"),
            PathBuf::from("/tmp/margin/___etc_passwd.json")
        );
    }

    #[test]
    fn test_write_failure_still_advances() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, "not a dir").unwrap();
        let store = JsonFilePersistence::new(blocker.join("conversations"));

        let state = store.set_conversation_messages(
            &ConversationState::default(),
            "scripted",
            "demo",
            vec![ChatMessage::user("hi")],
        );
        assert_eq!(state.revision, 1);
        assert_eq!(state.messages.len(), 1);
    }
}
