//! Conversation history storage seam.
//!
//! History persistence lives outside the core; the engine only needs to load
//! prior history before a run and save the audit history afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::types::{Conversation, Message};
use crate::error::Result;

/// Storage for full message history keyed by conversation id.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load a conversation. Unknown ids yield `None`.
    async fn load(&self, conversation_id: &str) -> Result<Option<Conversation>>;

    /// Insert or replace a conversation.
    async fn save(&self, conversation: &Conversation) -> Result<()>;

    /// Message history for a conversation (empty when unknown).
    async fn history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .load(conversation_id)
            .await?
            .map(|c| c.messages)
            .unwrap_or_default())
    }
}

/// In-memory store. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryConversationStore {
    conversations: Arc<RwLock<HashMap<String, Conversation>>>,
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
    async fn load(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        Ok(self.conversations.read().await.get(conversation_id).cloned())
    }

    async fn save(&self, conversation: &Conversation) -> Result<()> {
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }
}
