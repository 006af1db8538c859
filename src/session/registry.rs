//! Session registry: per-run cancellation, abort handles and process tracking.
//!
//! Every agent run owns one [`AgentSession`] record. The registry hands out
//! [`CancellationToken`]s arranged in a tree:
//!
//! ```text
//! generation token (replaced after every emergency stop)
//!   └── session token (one per run; cancelled by stop_session)
//!         └── abort handles (one per outstanding completion / tool call)
//! ```
//!
//! Processes are tracked through [`ProcessGuard`]s. The guard removes its
//! entry when dropped, so a process that exits on any path (including panics
//! and early returns) never lingers in the registry. Killing a tracked
//! process cancels its kill token; the owner of the `Child` watches that
//! token and force-kills.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SpeakError};

/// Lifecycle state of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Processing,
    Completed,
    Error,
    Stopped,
}

impl SessionStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }
}

/// Who spawned a tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    /// Spawned on behalf of an agent run; killed by emergency stop.
    Agent,
    /// Long-lived tool provider server; only killed by a full shutdown.
    Provider,
}

/// The kind of progress update about to be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    /// Intermediate step or iteration update.
    Update,
    /// The final update of a run that ran to an end on its own.
    Final,
    /// The final update announcing that a run was stopped.
    StopNotice,
}

/// Snapshot of one agent session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    pub id: String,
    pub conversation_id: String,
    pub status: SessionStatus,
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub timeout_ms: Option<u64>,
    /// Hidden from the UI without affecting work.
    pub snoozed: bool,
    pub last_error: Option<String>,
    pub process_count: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counts reported by an emergency stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    pub sessions_stopped: usize,
    pub processes_killed: usize,
}

struct SessionEntry {
    info: AgentSession,
    should_stop: bool,
    token: CancellationToken,
}

struct ProcessEntry {
    session_id: Option<String>,
    kind: ProcessKind,
    label: String,
    pid: Option<u32>,
    kill: CancellationToken,
}

struct Inner {
    sessions: HashMap<String, SessionEntry>,
    processes: HashMap<u64, ProcessEntry>,
    next_process_id: u64,
    generation: CancellationToken,
    stop_requested: bool,
}

impl Inner {
    fn kill_where(&mut self, pred: impl Fn(&ProcessEntry) -> bool) -> usize {
        let mut killed = 0;
        for entry in self.processes.values() {
            if pred(entry) && !entry.kill.is_cancelled() {
                info!(
                    label = %entry.label,
                    pid = ?entry.pid,
                    kind = ?entry.kind,
                    "Killing tracked process"
                );
                entry.kill.cancel();
                killed += 1;
            }
        }
        killed
    }
}

/// Registry of in-flight agent sessions and spawned processes.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sessions: HashMap::new(),
                processes: HashMap::new(),
                next_process_id: 1,
                generation: CancellationToken::new(),
                stop_requested: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a session for a new agent run.
    ///
    /// Clears the process-wide "stop requested" flag: an explicit new run is
    /// the only thing that re-arms progress reporting after an emergency stop.
    pub fn create_session(
        &self,
        conversation_id: &str,
        max_iterations: u32,
        timeout_ms: Option<u64>,
    ) -> String {
        let id = format!("session_{}", uuid::Uuid::new_v4().simple());
        let now = Utc::now();
        let mut inner = self.lock();
        inner.stop_requested = false;
        let token = inner.generation.child_token();
        inner.sessions.insert(
            id.clone(),
            SessionEntry {
                info: AgentSession {
                    id: id.clone(),
                    conversation_id: conversation_id.to_string(),
                    status: SessionStatus::Idle,
                    iteration_count: 0,
                    max_iterations,
                    timeout_ms,
                    snoozed: false,
                    last_error: None,
                    process_count: 0,
                    started_at: now,
                    updated_at: now,
                },
                should_stop: false,
                token,
            },
        );
        debug!(session_id = %id, conversation_id = %conversation_id, "Session created");
        id
    }

    /// Cancellation token for a session. Cancelled when the session is stopped.
    pub fn cancel_token(&self, session_id: &str) -> Result<CancellationToken> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| s.token.clone())
            .ok_or_else(|| SpeakError::NotFound(format!("session {}", session_id)))
    }

    /// Register an abort handle for one outstanding call within a session.
    ///
    /// The handle is a child of the session token, so stopping the session
    /// aborts every handle it ever issued.
    pub fn register_abort_handle(&self, session_id: &str) -> Result<CancellationToken> {
        Ok(self.cancel_token(session_id)?.child_token())
    }

    /// Abort handle not tied to a session; cancelled by the next emergency stop.
    pub fn global_abort_handle(&self) -> CancellationToken {
        self.lock().generation.child_token()
    }

    /// Whether the session has been asked to stop. Unknown sessions report `true`.
    pub fn should_stop(&self, session_id: &str) -> bool {
        let inner = self.lock();
        match inner.sessions.get(session_id) {
            Some(entry) => entry.should_stop || entry.token.is_cancelled(),
            None => true,
        }
    }

    /// Flag the session and abort every registered handle.
    ///
    /// Returns `false` when the session is unknown.
    pub fn stop_session(&self, session_id: &str) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.sessions.get_mut(session_id) else {
            return false;
        };
        entry.should_stop = true;
        entry.info.status = SessionStatus::Stopped;
        entry.info.updated_at = Utc::now();
        entry.token.cancel();
        info!(session_id = %session_id, "Session stopped");
        true
    }

    /// Force-kill the session's still-tracked processes and remove its record.
    pub fn cleanup_session(&self, session_id: &str) -> usize {
        let mut inner = self.lock();
        let killed = inner.kill_where(|p| p.session_id.as_deref() == Some(session_id));
        if let Some(entry) = inner.sessions.remove(session_id) {
            entry.token.cancel();
            debug!(
                session_id = %session_id,
                status = ?entry.info.status,
                processes_killed = killed,
                "Session cleaned up"
            );
        }
        killed
    }

    /// Move a session to a new status.
    ///
    /// Terminal states are sticky; `Stopped` in particular can never be left.
    pub fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let mut inner = self.lock();
        let entry = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SpeakError::NotFound(format!("session {}", session_id)))?;
        if entry.info.status.is_terminal() && entry.info.status != status {
            return Err(SpeakError::Session(format!(
                "session {} is {:?}; cannot move to {:?}",
                session_id, entry.info.status, status
            )));
        }
        entry.info.status = status;
        entry.info.updated_at = Utc::now();
        Ok(())
    }

    /// Record a failure message and move to `Error` (unless already terminal).
    pub fn fail_session(&self, session_id: &str, error: &str) {
        let mut inner = self.lock();
        if let Some(entry) = inner.sessions.get_mut(session_id) {
            entry.info.last_error = Some(error.to_string());
            if !entry.info.status.is_terminal() {
                entry.info.status = SessionStatus::Error;
            }
            entry.info.updated_at = Utc::now();
        }
    }

    pub fn record_iteration(&self, session_id: &str, iteration: u32) {
        let mut inner = self.lock();
        if let Some(entry) = inner.sessions.get_mut(session_id) {
            entry.info.iteration_count = iteration;
            entry.info.updated_at = Utc::now();
        }
    }

    /// Hide a session from the UI. Work continues untouched.
    pub fn snooze_session(&self, session_id: &str) -> bool {
        self.set_snoozed(session_id, true)
    }

    /// Make a snoozed session visible again.
    pub fn unsnooze_session(&self, session_id: &str) -> bool {
        self.set_snoozed(session_id, false)
    }

    fn set_snoozed(&self, session_id: &str, snoozed: bool) -> bool {
        let mut inner = self.lock();
        match inner.sessions.get_mut(session_id) {
            Some(entry) => {
                entry.info.snoozed = snoozed;
                entry.info.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<AgentSession> {
        let inner = self.lock();
        inner.sessions.get(session_id).map(|entry| {
            let mut info = entry.info.clone();
            info.process_count = inner
                .processes
                .values()
                .filter(|p| p.session_id.as_deref() == Some(session_id))
                .count();
            info
        })
    }

    /// All live sessions, oldest first.
    pub fn sessions(&self) -> Vec<AgentSession> {
        let inner = self.lock();
        let mut all: Vec<AgentSession> = inner.sessions.values().map(|e| e.info.clone()).collect();
        all.sort_by_key(|s| s.started_at);
        all
    }

    /// The live, non-terminal session running for a conversation, if any.
    pub fn active_session_for(&self, conversation_id: &str) -> Option<String> {
        let inner = self.lock();
        inner
            .sessions
            .values()
            .find(|e| e.info.conversation_id == conversation_id && !e.info.status.is_terminal())
            .map(|e| e.info.id.clone())
    }

    pub fn has_active_sessions(&self) -> bool {
        self.lock()
            .sessions
            .values()
            .any(|e| !e.info.status.is_terminal())
    }

    /// Track a spawned process. Dropping the guard stops tracking it.
    ///
    /// `kill` is cancelled when the registry wants the process gone; the
    /// owner of the child process must watch it and force-kill.
    pub fn track_process(
        &self,
        session_id: Option<&str>,
        kind: ProcessKind,
        label: &str,
        pid: Option<u32>,
        kill: CancellationToken,
    ) -> ProcessGuard {
        let mut inner = self.lock();
        let id = inner.next_process_id;
        inner.next_process_id += 1;
        inner.processes.insert(
            id,
            ProcessEntry {
                session_id: session_id.map(str::to_string),
                kind,
                label: label.to_string(),
                pid,
                kill,
            },
        );
        debug!(label = %label, pid = ?pid, kind = ?kind, "Tracking process");
        ProcessGuard {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// Number of tracked processes of the given kind.
    pub fn process_count(&self, kind: ProcessKind) -> usize {
        self.lock()
            .processes
            .values()
            .filter(|p| p.kind == kind)
            .count()
    }

    /// Whether an emergency stop happened since the last `create_session`.
    pub fn is_stop_requested(&self) -> bool {
        self.lock().stop_requested
    }

    /// Whether a progress update for `session_id` may be delivered.
    ///
    /// Stop notices always pass. Anything else is dropped after an emergency
    /// stop and for sessions that were asked to stop, so a late callback from a
    /// killed run cannot publish stale progress or a stale answer. Intermediate
    /// updates for removed sessions are dropped as well.
    pub fn may_emit_progress(&self, session_id: &str, kind: ProgressKind) -> bool {
        if kind == ProgressKind::StopNotice {
            return true;
        }
        let inner = self.lock();
        if inner.stop_requested {
            return false;
        }
        match inner.sessions.get(session_id) {
            Some(entry) => !entry.should_stop && entry.info.status != SessionStatus::Stopped,
            None => kind == ProgressKind::Final,
        }
    }

    /// Stop every session, abort all outstanding calls and kill agent-spawned
    /// processes. Tool provider processes are left running.
    pub fn emergency_stop(&self) -> StopReport {
        self.stop_everything(false)
    }

    /// Like [`emergency_stop`](Self::emergency_stop), but also kills tool
    /// provider processes. Used for full shutdown.
    pub fn emergency_stop_all(&self) -> StopReport {
        self.stop_everything(true)
    }

    fn stop_everything(&self, include_providers: bool) -> StopReport {
        let mut inner = self.lock();
        inner.stop_requested = true;

        let mut sessions_stopped = 0;
        let now = Utc::now();
        for entry in inner.sessions.values_mut() {
            if !entry.info.status.is_terminal() {
                sessions_stopped += 1;
            }
            entry.should_stop = true;
            if entry.info.status != SessionStatus::Completed && entry.info.status != SessionStatus::Error {
                entry.info.status = SessionStatus::Stopped;
            }
            entry.info.updated_at = now;
        }

        // Cancels every session token and every abort handle in one go.
        inner.generation.cancel();
        inner.generation = CancellationToken::new();

        let processes_killed =
            inner.kill_where(|p| include_providers || p.kind == ProcessKind::Agent);

        warn!(
            sessions_stopped,
            processes_killed, include_providers, "Emergency stop"
        );
        StopReport {
            sessions_stopped,
            processes_killed,
        }
    }
}

/// Scoped registration of a tracked process. Deregisters on drop.
pub struct ProcessGuard {
    inner: Arc<Mutex<Inner>>,
    id: u64,
}

impl ProcessGuard {
    /// Registry-local identifier of the tracked process.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.processes.remove(&self.id);
    }
}

impl std::fmt::Debug for ProcessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGuard").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_get_session() {
        let registry = SessionRegistry::new();
        let id = registry.create_session("conv1", 10, Some(1000));
        let session = registry.get(&id).unwrap();
        assert_eq!(session.conversation_id, "conv1");
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.max_iterations, 10);
        assert!(!registry.should_stop(&id));
        assert_eq!(registry.active_session_for("conv1"), Some(id));
    }

    #[test]
    fn test_stop_session_aborts_handles() {
        let registry = SessionRegistry::new();
        let id = registry.create_session("conv1", 10, None);
        let handle = registry.register_abort_handle(&id).unwrap();
        let token = registry.cancel_token(&id).unwrap();

        assert!(registry.stop_session(&id));
        assert!(handle.is_cancelled());
        assert!(token.is_cancelled());
        assert!(registry.should_stop(&id));
        assert!(!registry.stop_session("missing"));
    }

    #[test]
    fn test_stopped_is_monotonic() {
        let registry = SessionRegistry::new();
        let id = registry.create_session("conv1", 10, None);
        registry.set_status(&id, SessionStatus::Processing).unwrap();
        registry.stop_session(&id);
        assert!(registry.set_status(&id, SessionStatus::Processing).is_err());
        assert!(registry.set_status(&id, SessionStatus::Completed).is_err());
        registry.fail_session(&id, "late failure");
        assert_eq!(registry.get(&id).unwrap().status, SessionStatus::Stopped);
    }

    #[test]
    fn test_snooze_keeps_work_running() {
        let registry = SessionRegistry::new();
        let id = registry.create_session("conv1", 10, None);
        registry.set_status(&id, SessionStatus::Processing).unwrap();
        assert!(registry.snooze_session(&id));
        let session = registry.get(&id).unwrap();
        assert!(session.snoozed);
        assert_eq!(session.status, SessionStatus::Processing);
        assert!(!registry.should_stop(&id));
        assert!(registry.unsnooze_session(&id));
        assert!(!registry.get(&id).unwrap().snoozed);
    }

    #[test]
    fn test_process_guard_deregisters_on_drop() {
        let registry = SessionRegistry::new();
        let id = registry.create_session("conv1", 10, None);
        {
            let _guard = registry.track_process(
                Some(&id),
                ProcessKind::Agent,
                "worker",
                Some(42),
                CancellationToken::new(),
            );
            assert_eq!(registry.process_count(ProcessKind::Agent), 1);
            assert_eq!(registry.get(&id).unwrap().process_count, 1);
        }
        assert_eq!(registry.process_count(ProcessKind::Agent), 0);
    }

    #[test]
    fn test_cleanup_kills_session_processes() {
        let registry = SessionRegistry::new();
        let id = registry.create_session("conv1", 10, None);
        let kill = CancellationToken::new();
        let _guard =
            registry.track_process(Some(&id), ProcessKind::Agent, "worker", None, kill.clone());
        assert_eq!(registry.cleanup_session(&id), 1);
        assert!(kill.is_cancelled());
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_emergency_stop_spares_providers() {
        let registry = SessionRegistry::new();
        let a = registry.create_session("c1", 10, None);
        let b = registry.create_session("c2", 10, None);
        let global = registry.global_abort_handle();
        let agent_kill = CancellationToken::new();
        let provider_kill = CancellationToken::new();
        let _g1 =
            registry.track_process(Some(&a), ProcessKind::Agent, "tool", None, agent_kill.clone());
        let _g2 =
            registry.track_process(None, ProcessKind::Provider, "files", None, provider_kill.clone());

        let report = registry.emergency_stop();
        assert_eq!(report.sessions_stopped, 2);
        assert_eq!(report.processes_killed, 1);
        assert!(agent_kill.is_cancelled());
        assert!(!provider_kill.is_cancelled());
        assert!(global.is_cancelled());
        assert!(registry.should_stop(&a));
        assert!(registry.should_stop(&b));

        let report = registry.emergency_stop_all();
        assert_eq!(report.processes_killed, 1);
        assert!(provider_kill.is_cancelled());
    }

    #[test]
    fn test_stop_requested_flag_blocks_late_progress() {
        let registry = SessionRegistry::new();
        let old = registry.create_session("c1", 10, None);
        registry.emergency_stop();

        assert!(registry.is_stop_requested());
        assert!(!registry.may_emit_progress(&old, ProgressKind::Update));
        assert!(!registry.may_emit_progress(&old, ProgressKind::Final));
        assert!(registry.may_emit_progress(&old, ProgressKind::StopNotice));

        // A new session re-arms progress, but the stopped one stays muted.
        let fresh = registry.create_session("c1", 10, None);
        assert!(!registry.is_stop_requested());
        assert!(registry.may_emit_progress(&fresh, ProgressKind::Update));
        assert!(registry.may_emit_progress(&fresh, ProgressKind::Final));
        assert!(!registry.may_emit_progress(&old, ProgressKind::Update));
        assert!(!registry.may_emit_progress(&old, ProgressKind::Final));
        assert!(!registry.should_stop(&fresh));
    }

    #[test]
    fn test_stopped_session_only_passes_stop_notice() {
        let registry = SessionRegistry::new();
        let id = registry.create_session("c1", 10, None);
        assert!(registry.may_emit_progress(&id, ProgressKind::Final));

        registry.stop_session(&id);
        assert!(!registry.may_emit_progress(&id, ProgressKind::Update));
        assert!(!registry.may_emit_progress(&id, ProgressKind::Final));
        assert!(registry.may_emit_progress(&id, ProgressKind::StopNotice));

        // a removed session still gets its final answer out, but no steps
        assert!(registry.may_emit_progress("gone", ProgressKind::Final));
        assert!(!registry.may_emit_progress("gone", ProgressKind::Update));
    }
}
