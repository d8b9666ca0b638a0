//! Conversation stores
//!
//! The store is the durable source of truth for serialized histories. The host
//! application may supply its own [`ConversationStore`]; two are bundled:
//!
//! - [`FileConversationStore`]: one JSON file per conversation under a base directory
//! - [`InMemoryConversationStore`]: for tests and ephemeral sessions

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::{ChatError, ChatResult};

/// Default directory for conversation storage
const CONVERSATIONS_DIR: &str = "conversations";

const MAX_ID_LEN: usize = 128;

/// Listing entry for a stored conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub updated_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Durable storage for serialized conversation histories
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Write (or overwrite) a conversation
    async fn save_conversation(&self, conversation_id: &str, serialized: &str) -> ChatResult<()>;

    /// Read a conversation, `None` if it was never saved
    async fn get_conversation(&self, conversation_id: &str) -> ChatResult<Option<String>>;

    /// Summaries ordered by most recent update
    async fn get_conversations_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> ChatResult<Vec<ConversationSummary>>;
}

/// Reject ids that cannot safely be used as a storage key
pub fn validate_conversation_id(conversation_id: &str) -> ChatResult<()> {
    let invalid = |reason: &str| {
        Err(ChatError::InvalidConversationId(format!(
            "'{}': {}",
            conversation_id, reason
        )))
    };

    if conversation_id.trim().is_empty() {
        return invalid("empty");
    }
    if conversation_id.len() > MAX_ID_LEN {
        return invalid("too long");
    }
    if conversation_id.starts_with('.') || conversation_id.contains("..") {
        return invalid("dot segments are not allowed");
    }
    if !conversation_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return invalid("only letters, digits, '-', '_' and '.' are allowed");
    }
    Ok(())
}

// ============================================================================
// File store
// ============================================================================

/// One `<id>.json` file per conversation
#[derive(Debug, Clone)]
pub struct FileConversationStore {
    base_dir: PathBuf,
}

impl FileConversationStore {
    /// Create a store in the default directory
    pub fn new() -> Self {
        Self {
            base_dir: PathBuf::from(CONVERSATIONS_DIR),
        }
    }

    /// Create a store in a custom directory
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: dir.into(),
        }
    }

    /// Get the file path for a conversation
    pub fn conversation_path(&self, conversation_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", conversation_id))
    }

    /// Get the base directory
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl Default for FileConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn save_conversation(&self, conversation_id: &str, serialized: &str) -> ChatResult<()> {
        validate_conversation_id(conversation_id)?;
        tokio::fs::create_dir_all(&self.base_dir).await?;

        // Write then rename so readers never see a half-written file
        let path = self.conversation_path(conversation_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!("[ConversationStore] Saved {}", path.display());
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> ChatResult<Option<String>> {
        validate_conversation_id(conversation_id)?;
        match tokio::fs::read_to_string(self.conversation_path(conversation_id)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_conversations_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> ChatResult<Vec<ConversationSummary>> {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let metadata = entry.metadata().await?;
            let updated_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            summaries.push(ConversationSummary {
                conversation_id: id.to_string(),
                updated_at,
                size_bytes: metadata.len(),
            });
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries.into_iter().skip(offset).take(limit).collect())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Conversations held in memory
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, (String, DateTime<Utc>)>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conversations.read().await.is_empty()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn save_conversation(&self, conversation_id: &str, serialized: &str) -> ChatResult<()> {
        validate_conversation_id(conversation_id)?;
        self.conversations.write().await.insert(
            conversation_id.to_string(),
            (serialized.to_string(), Utc::now()),
        );
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> ChatResult<Option<String>> {
        validate_conversation_id(conversation_id)?;
        Ok(self
            .conversations
            .read()
            .await
            .get(conversation_id)
            .map(|(serialized, _)| serialized.clone()))
    }

    async fn get_conversations_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> ChatResult<Vec<ConversationSummary>> {
        let guard = self.conversations.read().await;
        let mut summaries: Vec<_> = guard
            .iter()
            .map(|(id, (serialized, updated_at))| ConversationSummary {
                conversation_id: id.clone(),
                updated_at: *updated_at,
                size_bytes: serialized.len() as u64,
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (FileConversationStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileConversationStore::with_dir(temp_dir.path().join("conversations"));
        (store, temp_dir)
    }

    #[test]
    fn test_validate_conversation_id() {
        assert!(validate_conversation_id("c-1_budget.2024").is_ok());
        assert!(validate_conversation_id("").is_err());
        assert!(validate_conversation_id("../etc/passwd").is_err());
        assert!(validate_conversation_id("a/b").is_err());
        assert!(validate_conversation_id(".hidden").is_err());
        assert!(validate_conversation_id(&"x".repeat(200)).is_err());
    }

    #[tokio::test]
    async fn test_file_store_save_get() {
        let (store, _temp) = create_test_store();

        assert!(store.get_conversation("c1").await.unwrap().is_none());
        store.save_conversation("c1", "[1]").await.unwrap();
        store.save_conversation("c1", "[2]").await.unwrap();
        assert_eq!(store.get_conversation("c1").await.unwrap().as_deref(), Some("[2]"));
    }

    #[tokio::test]
    async fn test_file_store_rejects_traversal() {
        let (store, _temp) = create_test_store();
        let result = store.save_conversation("../escape", "[]").await;
        assert!(matches!(result, Err(ChatError::InvalidConversationId(_))));
    }

    #[tokio::test]
    async fn test_file_store_page() {
        let (store, _temp) = create_test_store();
        assert!(store.get_conversations_page(0, 10).await.unwrap().is_empty());

        store.save_conversation("a", "[]").await.unwrap();
        store.save_conversation("b", "[]").await.unwrap();
        store.save_conversation("c", "[]").await.unwrap();

        let all = store.get_conversations_page(0, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        let page = store.get_conversations_page(1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryConversationStore::new();
        store.save_conversation("c1", "data").await.unwrap();
        assert_eq!(store.get_conversation("c1").await.unwrap().as_deref(), Some("data"));
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get_conversations_page(0, 5).await.unwrap()[0].size_bytes, 4);
    }
}
