//! Engine - top-level wiring of queue, sessions, gateway and agent loop.
//!
//! A submitted message is queued for its conversation. Whoever wins the
//! conversation's processing lock drains the queue: one agent run per
//! message, in order, until the queue is empty or paused. Explicitly
//! stopping a conversation pauses its queue so the next message does not
//! start on its own; [`Engine::resume_conversation`] restarts it.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use speakmcp_core::config::Config;
//! use speakmcp_core::engine::Engine;
//! use speakmcp_core::providers::build_provider;
//!
//! let config = Config::load()?;
//! let provider = Arc::from(build_provider(&config)?);
//! let engine = Engine::new(config, provider);
//! engine.start().await;
//!
//! let result = engine.run_now("conv_1", "What's in my downloads folder?").await?;
//! println!("{}", result.content);
//! engine.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::agent::{AgentLoop, AgentResult, ProgressObserver, RunContext, RunStatus};
use crate::config::Config;
use crate::error::{Result, SpeakError};
use crate::providers::LLMProvider;
use crate::queue::{MessageQueue, ProcessingGuard, QueuedMessage};
use crate::session::{
    Conversation, ConversationStore, InMemoryConversationStore, SessionRegistry, StopReport,
};
use crate::tools::{InitReport, ToolGateway};
use crate::log_component;

/// Outcome of one queued message.
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub message_id: String,
    pub result: AgentResult,
}

struct EngineInner {
    config: Config,
    registry: SessionRegistry,
    queue: MessageQueue,
    gateway: Arc<ToolGateway>,
    provider: Arc<dyn LLMProvider>,
    store: Arc<dyn ConversationStore>,
    observer: Option<Arc<dyn ProgressObserver>>,
}

/// The agent-orchestration engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Builder for [`Engine`] with optional collaborators.
pub struct EngineBuilder {
    config: Config,
    provider: Arc<dyn LLMProvider>,
    registry: Option<SessionRegistry>,
    gateway: Option<Arc<ToolGateway>>,
    store: Option<Arc<dyn ConversationStore>>,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl EngineBuilder {
    /// Share an existing registry (the gateway built here tracks provider
    /// processes in it).
    pub fn registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn gateway(mut self, gateway: Arc<ToolGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Engine {
        let registry = self.registry.unwrap_or_default();
        let gateway = self.gateway.unwrap_or_else(|| {
            Arc::new(ToolGateway::new(
                self.config.mcp.clone(),
                Some(registry.clone()),
            ))
        });
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryConversationStore::new()));
        Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                registry,
                queue: MessageQueue::new(),
                gateway,
                provider: self.provider,
                store,
                observer: self.observer,
            }),
        }
    }
}

impl Engine {
    /// Engine with a fresh registry, MCP gateway and in-memory history.
    pub fn new(config: Config, provider: Arc<dyn LLMProvider>) -> Self {
        Self::builder(config, provider).build()
    }

    pub fn builder(config: Config, provider: Arc<dyn LLMProvider>) -> EngineBuilder {
        EngineBuilder {
            config,
            provider,
            registry: None,
            gateway: None,
            store: None,
            observer: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.inner.queue
    }

    pub fn gateway(&self) -> &Arc<ToolGateway> {
        &self.inner.gateway
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.inner.store
    }

    /// Connect tool providers.
    pub async fn start(&self) -> InitReport {
        let report = self.inner.gateway.initialize().await;
        log_component!(
            info,
            "engine",
            "Engine started",
            connected = report.connected.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len()
        );
        report
    }

    /// Queue a message and start draining its conversation in the background.
    ///
    /// The drain is a no-op when the conversation is already being processed
    /// (the running drain picks the message up) or paused.
    pub fn submit(&self, conversation_id: &str, text: &str) -> QueuedMessage {
        let message = self.inner.queue.enqueue(conversation_id, text);
        self.spawn_drain(conversation_id);
        message
    }

    fn spawn_drain(&self, conversation_id: &str) {
        let engine = self.clone();
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            engine.drain(&conversation_id).await;
        });
    }

    /// Queue a message and process the conversation now, returning this
    /// message's result.
    ///
    /// Fails when another caller holds the conversation's processing lock or
    /// the queue is paused; the message stays queued in both cases.
    pub async fn run_now(&self, conversation_id: &str, text: &str) -> Result<AgentResult> {
        let message = self.inner.queue.enqueue(conversation_id, text);
        let processed = self.drain(conversation_id).await;
        processed
            .into_iter()
            .find(|p| p.message_id == message.id)
            .map(|p| p.result)
            .ok_or_else(|| {
                SpeakError::Queue(format!(
                    "conversation {} is busy or paused; message {} stays queued",
                    conversation_id, message.id
                ))
            })
    }

    /// Process pending messages of a conversation until it is empty or paused.
    ///
    /// Returns immediately with nothing when the processing lock is taken.
    pub async fn drain(&self, conversation_id: &str) -> Vec<ProcessedMessage> {
        let queue = &self.inner.queue;
        let Some(guard) = queue.acquire_processing_guard(conversation_id) else {
            debug!(conversation_id, "Conversation busy; drain skipped");
            return Vec::new();
        };
        let processed = self.drain_locked(conversation_id).await;
        self.release_and_resume(conversation_id, guard);
        processed
    }

    /// Drop the processing lock, then pick up anything that was queued while
    /// it was held. A submit in that window finds the lock taken and skips.
    fn release_and_resume(&self, conversation_id: &str, guard: ProcessingGuard) {
        drop(guard);
        let queue = &self.inner.queue;
        if !queue.is_paused(conversation_id) && queue.peek(conversation_id).is_some() {
            debug!(conversation_id, "Message queued during release; draining again");
            self.spawn_drain(conversation_id);
        }
    }

    async fn drain_locked(&self, conversation_id: &str) -> Vec<ProcessedMessage> {
        let queue = &self.inner.queue;
        let mut processed = Vec::new();
        loop {
            if queue.is_paused(conversation_id) {
                debug!(conversation_id, "Queue paused; drain stops");
                break;
            }
            let Some(message) = queue.peek(conversation_id) else {
                break;
            };
            queue.mark_processing(conversation_id, &message.id);

            let result = self.process(&message).await;
            match result.status {
                RunStatus::Completed | RunStatus::IterationLimit => {
                    queue.mark_processed(conversation_id, &message.id);
                }
                RunStatus::Stopped => {
                    queue.mark_cancelled(conversation_id, &message.id);
                }
                RunStatus::TimedOut | RunStatus::Error => {
                    queue.mark_failed(conversation_id, &message.id, &result.content);
                }
            }
            processed.push(ProcessedMessage {
                message_id: message.id,
                result,
            });
        }
        processed
    }

    /// One agent run for one queued message.
    async fn process(&self, message: &QueuedMessage) -> AgentResult {
        let inner = &self.inner;
        let defaults = &inner.config.agent;
        let conversation_id = message.conversation_id.as_str();
        let timeout = (defaults.timeout_secs > 0).then(|| Duration::from_secs(defaults.timeout_secs));

        let session_id = inner.registry.create_session(
            conversation_id,
            defaults.max_iterations,
            timeout.map(|t| t.as_millis() as u64),
        );
        let mut ctx = RunContext::new(conversation_id).with_session(&session_id);
        if let Ok(token) = inner.registry.cancel_token(&session_id) {
            ctx = ctx.with_cancel(token);
        }
        if let Some(timeout) = timeout {
            ctx = ctx.with_timeout(timeout);
        }

        let prior = match inner.store.history(conversation_id).await {
            Ok(history) => history,
            Err(e) => {
                warn!(conversation_id, error = %e, "Failed to load history; starting fresh");
                Vec::new()
            }
        };
        let tools = inner.gateway.get_available_tools();

        let mut agent = AgentLoop::new(
            Arc::clone(&inner.provider),
            defaults.clone(),
            inner.config.context.clone(),
        )
        .with_registry(inner.registry.clone());
        if let Some(observer) = &inner.observer {
            agent = agent.with_observer(Arc::clone(observer));
        }

        let result = agent
            .run(
                &message.text,
                &tools,
                inner.gateway.as_ref(),
                defaults.max_iterations,
                prior,
                ctx,
            )
            .await;

        // Failed runs leave history untouched so a retry starts clean.
        if !matches!(result.status, RunStatus::Error | RunStatus::TimedOut) {
            if let Err(e) = self.save_history(conversation_id, &result).await {
                warn!(conversation_id, error = %e, "Failed to save history");
            } else {
                inner
                    .queue
                    .mark_added_to_history(conversation_id, &message.id);
            }
        }

        inner.registry.cleanup_session(&session_id);
        result
    }

    async fn save_history(&self, conversation_id: &str, result: &AgentResult) -> Result<()> {
        let store = &self.inner.store;
        let mut conversation = store
            .load(conversation_id)
            .await?
            .unwrap_or_else(|| Conversation::new(conversation_id));
        conversation.replace_messages(result.history.clone());
        store.save(&conversation).await
    }

    /// Stop the conversation's running session and pause its queue.
    ///
    /// Returns whether a session was running. The queue stays paused until
    /// [`resume_conversation`](Self::resume_conversation).
    pub fn stop_conversation(&self, conversation_id: &str) -> bool {
        self.inner.queue.pause_queue(conversation_id);
        match self.inner.registry.active_session_for(conversation_id) {
            Some(session_id) => self.inner.registry.stop_session(&session_id),
            None => false,
        }
    }

    /// Resume a paused conversation and drain what is pending.
    pub fn resume_conversation(&self, conversation_id: &str) {
        self.inner.queue.resume_queue(conversation_id);
        self.spawn_drain(conversation_id);
    }

    /// Drain every conversation that has pending work and is not paused.
    pub fn resume_pending(&self) {
        for conversation_id in self.inner.queue.ready_conversations() {
            self.spawn_drain(&conversation_id);
        }
    }

    /// Stop every run and kill agent-spawned processes. Tool providers keep
    /// running. Queues of interrupted conversations are paused.
    pub fn emergency_stop(&self) -> StopReport {
        self.pause_active_conversations();
        self.inner.registry.emergency_stop()
    }

    /// Stop everything, including tool provider processes, and disconnect.
    pub async fn shutdown(&self) {
        self.pause_active_conversations();
        let report = self.inner.registry.emergency_stop_all();
        self.inner.gateway.shutdown().await;
        log_component!(
            info,
            "engine",
            "Engine shut down",
            sessions_stopped = report.sessions_stopped,
            processes_killed = report.processes_killed
        );
    }

    fn pause_active_conversations(&self) {
        for session in self.inner.registry.sessions() {
            if !session.status.is_terminal() {
                self.inner.queue.pause_queue(&session.conversation_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::providers::{ChatOptions, LLMResponse};
    use crate::session::Message;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Answer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LLMProvider for Answer {
        fn name(&self) -> &str {
            "answer"
        }

        fn default_model(&self) -> &str {
            "m"
        }

        async fn chat(
            &self,
            messages: Vec<Message>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let last_user = messages
                .iter()
                .rev()
                .find(|m| m.role == crate::session::Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(LLMResponse::text(
                &serde_json::json!({"content": format!("re: {}", last_user), "needsMoreWork": false})
                    .to_string(),
            ))
        }
    }

    fn engine() -> Engine {
        Engine::new(
            Config::default(),
            Arc::new(Answer {
                calls: AtomicUsize::new(0),
            }),
        )
    }

    #[tokio::test]
    async fn test_run_now_saves_history() {
        let engine = engine();
        let result = engine.run_now("c1", "hello").await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.content, "re: hello");

        let history = engine.store().history("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(engine.queue().get_queue("c1").is_empty());
        assert!(!engine.queue().is_processing("c1"));
        // session cleaned up
        assert!(engine.registry().sessions().is_empty());
    }

    #[tokio::test]
    async fn test_history_accumulates_across_runs() {
        let engine = engine();
        engine.run_now("c1", "first").await.unwrap();
        let second = engine.run_now("c1", "second").await.unwrap();
        assert_eq!(second.history.len(), 4);
        assert_eq!(second.content, "re: second");
    }

    #[tokio::test]
    async fn test_run_now_fails_while_busy() {
        let engine = engine();
        assert!(engine.queue().try_acquire_processing_lock("c1"));
        let err = engine.run_now("c1", "hello").await.unwrap_err();
        assert!(err.to_string().contains("busy"));
        // still queued for the lock holder
        assert_eq!(engine.queue().get_queue("c1").len(), 1);
        engine.queue().release_processing_lock("c1");
    }

    #[tokio::test]
    async fn test_stop_pauses_until_resume() {
        let engine = engine();
        assert!(!engine.stop_conversation("c1"));
        assert!(engine.queue().is_paused("c1"));

        engine.queue().enqueue("c1", "later");
        assert!(engine.drain("c1").await.is_empty());
        assert_eq!(engine.queue().get_queue("c1").len(), 1);

        engine.queue().resume_queue("c1");
        let processed = engine.drain("c1").await;
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].result.content, "re: later");
    }

    #[tokio::test]
    async fn test_message_queued_while_lock_held_is_drained_after_release() {
        let engine = engine();
        let guard = engine.queue().acquire_processing_guard("c1").unwrap();
        engine.submit("c1", "late");
        // the spawned drain finds the lock taken and gives up
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.queue().get_queue("c1").len(), 1);

        engine.release_and_resume("c1", guard);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !engine.queue().get_queue("c1").is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "late message never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let history = engine.store().history("c1").await.unwrap();
        assert_eq!(history.last().unwrap().content, "re: late");
    }

    #[tokio::test]
    async fn test_drain_processes_in_order() {
        let engine = engine();
        engine.queue().enqueue("c1", "one");
        engine.queue().enqueue("c1", "two");
        let processed = engine.drain("c1").await;
        let contents: Vec<&str> = processed.iter().map(|p| p.result.content.as_str()).collect();
        assert_eq!(contents, vec!["re: one", "re: two"]);
    }
}
