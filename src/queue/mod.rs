//! Conversation message queue.
//!
//! Serializes user messages per conversation while a session is busy. Each
//! conversation has an ordered list of [`QueuedMessage`]s and at most one
//! holder of its processing lock. The lock is the only thing that prevents two
//! agent runs over the same conversation; every caller that starts a run must
//! win [`MessageQueue::try_acquire_processing_lock`] first.
//!
//! Messages are always addressed by id, never by position, so a reorder that
//! happens while a message is processing cannot desynchronize state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Status of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuedMessageStatus {
    Pending,
    Processing,
    Failed,
    Cancelled,
}

/// A user message waiting for its conversation to become idle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    pub conversation_id: String,
    pub text: String,
    pub status: QueuedMessageStatus,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Set once the text was appended to the conversation history, so a retry
    /// does not append it twice.
    #[serde(default)]
    pub added_to_history: bool,
}

impl QueuedMessage {
    fn new(conversation_id: &str, text: &str) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
            status: QueuedMessageStatus::Pending,
            created_at: chrono::Utc::now().timestamp_millis(),
            error_message: None,
            added_to_history: false,
        }
    }
}

/// Change notification for observers (the UI layer).
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// The message list of a conversation changed; carries the new snapshot.
    Changed {
        conversation_id: String,
        messages: Vec<QueuedMessage>,
    },
    Paused {
        conversation_id: String,
    },
    Resumed {
        conversation_id: String,
    },
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, Vec<QueuedMessage>>,
    processing: HashSet<String>,
    paused: HashSet<String>,
}

/// Per-conversation FIFO queue with processing locks. Cheap to clone.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<QueueEvent>,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Receive queue change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_changed(&self, conversation_id: &str, snapshot: Vec<QueuedMessage>) {
        self.emit(QueueEvent::Changed {
            conversation_id: conversation_id.to_string(),
            messages: snapshot,
        });
    }

    /// Apply `f` to one message; emits a change event when `f` returns `true`.
    fn with_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        f: impl FnOnce(&mut QueuedMessage) -> bool,
    ) -> bool {
        let snapshot = {
            let mut inner = self.lock();
            let Some(queue) = inner.queues.get_mut(conversation_id) else {
                return false;
            };
            let Some(msg) = queue.iter_mut().find(|m| m.id == message_id) else {
                return false;
            };
            if !f(msg) {
                return false;
            }
            queue.clone()
        };
        self.emit_changed(conversation_id, snapshot);
        true
    }

    /// Append a message to the end of a conversation's queue.
    pub fn enqueue(&self, conversation_id: &str, text: &str) -> QueuedMessage {
        let msg = QueuedMessage::new(conversation_id, text);
        let snapshot = {
            let mut inner = self.lock();
            let queue = inner.queues.entry(conversation_id.to_string()).or_default();
            queue.push(msg.clone());
            queue.clone()
        };
        debug!(conversation_id = %conversation_id, message_id = %msg.id, "Message queued");
        self.emit_changed(conversation_id, snapshot);
        msg
    }

    /// Snapshot of a conversation's queue, in order.
    pub fn get_queue(&self, conversation_id: &str) -> Vec<QueuedMessage> {
        self.lock()
            .queues
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// First message whose status is `pending`.
    pub fn peek(&self, conversation_id: &str) -> Option<QueuedMessage> {
        self.lock()
            .queues
            .get(conversation_id)
            .and_then(|q| {
                q.iter()
                    .find(|m| m.status == QueuedMessageStatus::Pending)
                    .cloned()
            })
    }

    /// Conversations with at least one pending message that are neither
    /// paused nor currently processing.
    pub fn ready_conversations(&self) -> Vec<String> {
        let inner = self.lock();
        let mut ready: Vec<String> = inner
            .queues
            .iter()
            .filter(|(id, q)| {
                !inner.paused.contains(*id)
                    && !inner.processing.contains(*id)
                    && q.iter().any(|m| m.status == QueuedMessageStatus::Pending)
            })
            .map(|(id, _)| id.clone())
            .collect();
        ready.sort();
        ready
    }

    pub fn mark_processing(&self, conversation_id: &str, message_id: &str) -> bool {
        self.with_message(conversation_id, message_id, |m| {
            m.status = QueuedMessageStatus::Processing;
            true
        })
    }

    /// Remove a finished message by id.
    pub fn mark_processed(&self, conversation_id: &str, message_id: &str) -> bool {
        let snapshot = {
            let mut inner = self.lock();
            let Some(queue) = inner.queues.get_mut(conversation_id) else {
                return false;
            };
            let before = queue.len();
            queue.retain(|m| m.id != message_id);
            if queue.len() == before {
                return false;
            }
            let snapshot = queue.clone();
            if queue.is_empty() {
                inner.queues.remove(conversation_id);
            }
            snapshot
        };
        self.emit_changed(conversation_id, snapshot);
        true
    }

    /// Keep a message that failed, recording why. The text is untouched.
    pub fn mark_failed(&self, conversation_id: &str, message_id: &str, error: &str) -> bool {
        self.with_message(conversation_id, message_id, |m| {
            m.status = QueuedMessageStatus::Failed;
            m.error_message = Some(error.to_string());
            true
        })
    }

    pub fn mark_cancelled(&self, conversation_id: &str, message_id: &str) -> bool {
        self.with_message(conversation_id, message_id, |m| {
            m.status = QueuedMessageStatus::Cancelled;
            true
        })
    }

    pub fn mark_added_to_history(&self, conversation_id: &str, message_id: &str) -> bool {
        self.with_message(conversation_id, message_id, |m| {
            m.added_to_history = true;
            true
        })
    }

    /// Make a failed or cancelled message eligible again. Clears the error.
    pub fn reset_to_pending(&self, conversation_id: &str, message_id: &str) -> bool {
        self.with_message(conversation_id, message_id, |m| {
            if m.status == QueuedMessageStatus::Processing {
                return false;
            }
            m.status = QueuedMessageStatus::Pending;
            m.error_message = None;
            true
        })
    }

    /// Edit a message's text. A failed message becomes pending again.
    /// Messages that are processing cannot be edited.
    pub fn update_message_text(&self, conversation_id: &str, message_id: &str, text: &str) -> bool {
        self.with_message(conversation_id, message_id, |m| {
            if m.status == QueuedMessageStatus::Processing {
                return false;
            }
            m.text = text.to_string();
            if m.status == QueuedMessageStatus::Failed {
                m.status = QueuedMessageStatus::Pending;
                m.error_message = None;
            }
            true
        })
    }

    /// Remove a message that is not currently processing.
    pub fn remove_from_queue(&self, conversation_id: &str, message_id: &str) -> bool {
        let snapshot = {
            let mut inner = self.lock();
            let Some(queue) = inner.queues.get_mut(conversation_id) else {
                return false;
            };
            let Some(pos) = queue.iter().position(|m| m.id == message_id) else {
                return false;
            };
            if queue[pos].status == QueuedMessageStatus::Processing {
                return false;
            }
            queue.remove(pos);
            queue.clone()
        };
        self.emit_changed(conversation_id, snapshot);
        true
    }

    /// Drop every message except the one currently processing (if any).
    pub fn clear_queue(&self, conversation_id: &str) -> usize {
        let (removed, snapshot) = {
            let mut inner = self.lock();
            let Some(queue) = inner.queues.get_mut(conversation_id) else {
                return 0;
            };
            let before = queue.len();
            queue.retain(|m| m.status == QueuedMessageStatus::Processing);
            (before - queue.len(), queue.clone())
        };
        if removed > 0 {
            info!(conversation_id = %conversation_id, removed, "Queue cleared");
            self.emit_changed(conversation_id, snapshot);
        }
        removed
    }

    /// Apply the given order. Ids that are not in the queue are ignored;
    /// messages not mentioned keep their relative order and go after the rest.
    pub fn reorder_queue<S: AsRef<str>>(&self, conversation_id: &str, ordered_ids: &[S]) -> bool {
        let snapshot = {
            let mut inner = self.lock();
            let Some(queue) = inner.queues.get_mut(conversation_id) else {
                return false;
            };
            let mut remaining = std::mem::take(queue);
            let mut reordered = Vec::with_capacity(remaining.len());
            for id in ordered_ids {
                if let Some(pos) = remaining.iter().position(|m| m.id == id.as_ref()) {
                    reordered.push(remaining.remove(pos));
                }
            }
            reordered.extend(remaining);
            *queue = reordered;
            queue.clone()
        };
        self.emit_changed(conversation_id, snapshot);
        true
    }

    /// Skip this conversation during idle-triggered processing until resumed.
    pub fn pause_queue(&self, conversation_id: &str) {
        let newly = self.lock().paused.insert(conversation_id.to_string());
        if newly {
            info!(conversation_id = %conversation_id, "Queue paused");
            self.emit(QueueEvent::Paused {
                conversation_id: conversation_id.to_string(),
            });
        }
    }

    pub fn resume_queue(&self, conversation_id: &str) {
        let was_paused = self.lock().paused.remove(conversation_id);
        if was_paused {
            info!(conversation_id = %conversation_id, "Queue resumed");
            self.emit(QueueEvent::Resumed {
                conversation_id: conversation_id.to_string(),
            });
        }
    }

    pub fn is_paused(&self, conversation_id: &str) -> bool {
        self.lock().paused.contains(conversation_id)
    }

    /// Claim the conversation for one agent run. Fails fast if already held.
    pub fn try_acquire_processing_lock(&self, conversation_id: &str) -> bool {
        let acquired = self.lock().processing.insert(conversation_id.to_string());
        debug!(conversation_id = %conversation_id, acquired, "Processing lock");
        acquired
    }

    pub fn release_processing_lock(&self, conversation_id: &str) {
        self.lock().processing.remove(conversation_id);
        debug!(conversation_id = %conversation_id, "Processing lock released");
    }

    pub fn is_processing(&self, conversation_id: &str) -> bool {
        self.lock().processing.contains(conversation_id)
    }

    /// Scoped variant of [`try_acquire_processing_lock`](Self::try_acquire_processing_lock):
    /// the lock is released when the guard drops.
    pub fn acquire_processing_guard(&self, conversation_id: &str) -> Option<ProcessingGuard> {
        self.try_acquire_processing_lock(conversation_id)
            .then(|| ProcessingGuard {
                queue: self.clone(),
                conversation_id: conversation_id.to_string(),
            })
    }
}

/// Holds a conversation's processing lock until dropped.
pub struct ProcessingGuard {
    queue: MessageQueue,
    conversation_id: String,
}

impl ProcessingGuard {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.queue.release_processing_lock(&self.conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(queue: &MessageQueue, conv: &str) -> Vec<String> {
        queue.get_queue(conv).into_iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_enqueue_and_peek_skip_non_pending() {
        let queue = MessageQueue::new();
        let a = queue.enqueue("c", "a");
        let b = queue.enqueue("c", "b");
        assert_eq!(queue.peek("c").unwrap().id, a.id);

        queue.mark_processing("c", &a.id);
        assert_eq!(queue.peek("c").unwrap().id, b.id);
        queue.mark_failed("c", &b.id, "boom");
        assert!(queue.peek("c").is_none());
        assert!(queue.peek("other").is_none());
    }

    #[test]
    fn test_processing_lock_is_exclusive() {
        let queue = MessageQueue::new();
        assert!(queue.try_acquire_processing_lock("c"));
        assert!(!queue.try_acquire_processing_lock("c"));
        assert!(queue.try_acquire_processing_lock("d"));
        queue.release_processing_lock("c");
        assert!(queue.try_acquire_processing_lock("c"));
    }

    #[test]
    fn test_processing_guard_releases_on_drop() {
        let queue = MessageQueue::new();
        {
            let guard = queue.acquire_processing_guard("c").unwrap();
            assert_eq!(guard.conversation_id(), "c");
            assert!(queue.acquire_processing_guard("c").is_none());
        }
        assert!(!queue.is_processing("c"));
    }

    #[test]
    fn test_mark_processed_is_position_independent() {
        let queue = MessageQueue::new();
        let a = queue.enqueue("c", "A");
        let b = queue.enqueue("c", "B");
        let c = queue.enqueue("c", "C");

        assert!(queue.reorder_queue("c", &[c.id.as_str(), a.id.as_str(), b.id.as_str()]));
        assert!(queue.mark_processed("c", &a.id));
        assert_eq!(ids(&queue, "c"), vec![c.id, b.id]);
    }

    #[test]
    fn test_reorder_appends_unmentioned() {
        let queue = MessageQueue::new();
        let a = queue.enqueue("c", "A");
        let b = queue.enqueue("c", "B");
        let c = queue.enqueue("c", "C");
        queue.reorder_queue("c", &[c.id.as_str(), "ghost"]);
        assert_eq!(ids(&queue, "c"), vec![c.id, a.id, b.id]);
    }

    #[test]
    fn test_reset_to_pending_roundtrip() {
        let queue = MessageQueue::new();
        let a = queue.enqueue("c", "do the thing");
        queue.mark_failed("c", &a.id, "provider down");
        let failed = queue.get_queue("c")[0].clone();
        assert_eq!(failed.status, QueuedMessageStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("provider down"));

        assert!(queue.reset_to_pending("c", &a.id));
        let retried = queue.get_queue("c")[0].clone();
        assert_eq!(retried.status, QueuedMessageStatus::Pending);
        assert!(retried.error_message.is_none());
        assert_eq!(retried.text, "do the thing");
    }

    #[test]
    fn test_editing_failed_message_resets_to_pending() {
        let queue = MessageQueue::new();
        let a = queue.enqueue("c", "typo");
        queue.mark_failed("c", &a.id, "err");
        assert!(queue.update_message_text("c", &a.id, "fixed"));
        let msg = queue.get_queue("c")[0].clone();
        assert_eq!(msg.text, "fixed");
        assert_eq!(msg.status, QueuedMessageStatus::Pending);

        queue.mark_processing("c", &a.id);
        assert!(!queue.update_message_text("c", &a.id, "again"));
        assert!(!queue.remove_from_queue("c", &a.id));
    }

    #[test]
    fn test_clear_keeps_processing_message() {
        let queue = MessageQueue::new();
        let a = queue.enqueue("c", "A");
        queue.enqueue("c", "B");
        queue.enqueue("c", "C");
        queue.mark_processing("c", &a.id);
        assert_eq!(queue.clear_queue("c"), 2);
        assert_eq!(ids(&queue, "c"), vec![a.id]);
    }

    #[test]
    fn test_pause_excludes_from_ready() {
        let queue = MessageQueue::new();
        queue.enqueue("c1", "A");
        queue.enqueue("c2", "B");
        queue.pause_queue("c1");
        assert!(queue.is_paused("c1"));
        assert_eq!(queue.ready_conversations(), vec!["c2".to_string()]);

        queue.try_acquire_processing_lock("c2");
        assert!(queue.ready_conversations().is_empty());

        queue.resume_queue("c1");
        assert_eq!(queue.ready_conversations(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_subscribe_receives_changes() {
        let queue = MessageQueue::new();
        let mut rx = queue.subscribe();
        let a = queue.enqueue("c", "A");
        match rx.recv().await.unwrap() {
            QueueEvent::Changed {
                conversation_id,
                messages,
            } => {
                assert_eq!(conversation_id, "c");
                assert_eq!(messages[0].id, a.id);
            }
            other => panic!("unexpected event {:?}", other),
        }
        queue.pause_queue("c");
        assert_eq!(
            rx.recv().await.unwrap(),
            QueueEvent::Paused {
                conversation_id: "c".into()
            }
        );
    }
}
