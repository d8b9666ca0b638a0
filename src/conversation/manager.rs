//! History manager: store access behind a TTL cache
//!
//! `load` serves from the cache while the entry is fresh and otherwise reads the
//! store, evicting every expired entry as it caches the new one. `save` writes
//! through to the store and drops the cache entry, so the next load re-reads what
//! was actually persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::core::ChatResult;
use crate::llm::{ChatRole, ChatTurn};

use super::history::ConversationHistory;
use super::store::{validate_conversation_id, ConversationStore};

struct CacheEntry {
    turns: Vec<ChatTurn>,
    cached_at: Instant,
}

/// Loads and saves conversation histories
pub struct HistoryManager {
    store: Arc<dyn ConversationStore>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl HistoryManager {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Load a conversation, injecting `system_prompt` as its first turn
    ///
    /// An unknown id yields an empty history.
    pub async fn load(
        &self,
        conversation_id: &str,
        system_prompt: Option<&str>,
    ) -> ChatResult<ConversationHistory> {
        validate_conversation_id(conversation_id)?;

        if let Some(turns) = self.cached(conversation_id).await {
            tracing::debug!("[History] Cache hit for {}", conversation_id);
            return Ok(rebuild(conversation_id, turns, system_prompt));
        }

        let history = match self.store.get_conversation(conversation_id).await? {
            Some(serialized) => {
                ConversationHistory::from_json(conversation_id, &serialized, system_prompt)?
            }
            None => ConversationHistory::new(conversation_id).with_system_prompt(system_prompt),
        };
        tracing::debug!(
            "[History] Loaded {} with {} turn(s) from store",
            conversation_id,
            history.len()
        );

        let mut cache = self.cache.write().await;
        let evicted = evict_expired(&mut cache, self.ttl);
        if evicted > 0 {
            tracing::debug!("[History] Evicted {} expired cache entries", evicted);
        }
        cache.insert(
            conversation_id.to_string(),
            CacheEntry {
                turns: history.turns().to_vec(),
                cached_at: Instant::now(),
            },
        );
        Ok(history)
    }

    /// Persist user and assistant turns and invalidate the cache entry
    pub async fn save(&self, history: &ConversationHistory) -> ChatResult<()> {
        let id = history.conversation_id();
        validate_conversation_id(id)?;
        let serialized = history.to_json()?;
        self.store.save_conversation(id, &serialized).await?;
        self.invalidate(id).await;
        tracing::debug!("[History] Saved {} ({} turns)", id, history.len());
        Ok(())
    }

    /// Drop a cache entry
    pub async fn invalidate(&self, conversation_id: &str) {
        self.cache.write().await.remove(conversation_id);
    }

    /// Drop all expired cache entries
    pub async fn purge_expired(&self) -> usize {
        evict_expired(&mut *self.cache.write().await, self.ttl)
    }

    /// Number of cached conversations (fresh or not)
    pub async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }

    async fn cached(&self, conversation_id: &str) -> Option<Vec<ChatTurn>> {
        let cache = self.cache.read().await;
        cache
            .get(conversation_id)
            .filter(|entry| entry.cached_at.elapsed() < self.ttl)
            .map(|entry| entry.turns.clone())
    }
}

fn evict_expired(cache: &mut HashMap<String, CacheEntry>, ttl: Duration) -> usize {
    let before = cache.len();
    cache.retain(|_, entry| entry.cached_at.elapsed() < ttl);
    before - cache.len()
}

fn rebuild(
    conversation_id: &str,
    turns: Vec<ChatTurn>,
    system_prompt: Option<&str>,
) -> ConversationHistory {
    let mut history = ConversationHistory::new(conversation_id).with_system_prompt(system_prompt);
    for turn in turns {
        match turn.role {
            ChatRole::User => history.push_user(turn.content),
            ChatRole::Assistant => history.push_assistant(turn.content),
            ChatRole::System => false,
        };
    }
    history
}
