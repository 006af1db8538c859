//! Progress reporting for agent runs.
//!
//! The loop writes structured [`AgentProgress`] updates to a
//! [`ProgressObserver`]. [`ChannelObserver`] forwards them over an mpsc
//! channel for a UI layer to consume.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::session::{Message, ProgressKind, SessionRegistry};

/// Recent steps carried by each update.
pub const MAX_RECENT_STEPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Thinking,
    ToolCall,
    ToolResult,
    Verification,
    Nudge,
    Completion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// One step shown in the progress timeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStep {
    pub kind: StepKind,
    pub status: StepStatus,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressStep {
    pub fn new(kind: StepKind, status: StepStatus, title: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            title: title.into(),
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A progress update for one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProgress {
    pub session_id: String,
    pub conversation_id: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub recent_steps: Vec<ProgressStep>,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,
    pub history: Vec<Message>,
}

/// Receives progress updates.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, update: AgentProgress);
}

/// Forwards updates into an unbounded channel. Dropped receivers are ignored.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<AgentProgress>,
}

impl ChannelObserver {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&self, update: AgentProgress) {
        let _ = self.tx.send(update);
    }
}

/// Builds and delivers updates for one run.
///
/// Updates are gated by the session registry so a run that was stopped can
/// only publish its stop notice.
pub(crate) struct ProgressEmitter {
    observer: Option<Arc<dyn ProgressObserver>>,
    registry: Option<SessionRegistry>,
    session_id: String,
    conversation_id: String,
    max_iterations: u32,
    steps: Vec<ProgressStep>,
}

impl ProgressEmitter {
    pub(crate) fn new(
        observer: Option<Arc<dyn ProgressObserver>>,
        registry: Option<SessionRegistry>,
        session_id: &str,
        conversation_id: &str,
        max_iterations: u32,
    ) -> Self {
        Self {
            observer,
            registry,
            session_id: session_id.to_string(),
            conversation_id: conversation_id.to_string(),
            max_iterations,
            steps: Vec::new(),
        }
    }

    pub(crate) fn step(&mut self, step: ProgressStep) {
        self.steps.push(step);
        if self.steps.len() > MAX_RECENT_STEPS {
            let excess = self.steps.len() - MAX_RECENT_STEPS;
            self.steps.drain(..excess);
        }
    }

    /// Send a non-terminal update.
    pub(crate) fn update(&self, iteration: u32, history: &[Message]) {
        self.emit(iteration, history, ProgressKind::Update, None);
    }

    /// Send the terminal update.
    pub(crate) fn finish(&self, iteration: u32, history: &[Message], final_content: &str) {
        self.emit(iteration, history, ProgressKind::Final, Some(final_content.to_string()));
    }

    /// Send the terminal update of a stopped run; it passes even after a stop.
    pub(crate) fn finish_stopped(&self, iteration: u32, history: &[Message], notice: &str) {
        self.emit(iteration, history, ProgressKind::StopNotice, Some(notice.to_string()));
    }

    fn emit(
        &self,
        iteration: u32,
        history: &[Message],
        kind: ProgressKind,
        final_content: Option<String>,
    ) {
        let Some(observer) = &self.observer else {
            return;
        };
        if let Some(registry) = &self.registry {
            if !registry.may_emit_progress(&self.session_id, kind) {
                trace!(session_id = %self.session_id, iteration, "Progress update suppressed");
                return;
            }
        }
        observer.on_progress(AgentProgress {
            session_id: self.session_id.clone(),
            conversation_id: self.conversation_id.clone(),
            iteration,
            max_iterations: self.max_iterations,
            recent_steps: self.steps.clone(),
            is_complete: kind != ProgressKind::Update,
            final_content,
            history: history.to_vec(),
        });
    }
}
