//! Agent loop implementation
//!
//! The orchestrator drives one run: shape the prompt, ask the completion
//! capability for a decision, execute the requested tools one at a time,
//! feed the results back, and repeat until the model finishes, the run is
//! stopped, the deadline passes or the iteration limit is reached.
//!
//! ```text
//! INIT → THINKING → { TOOL_EXECUTING | VERIFYING | NUDGING } → THINKING → …
//!      → COMPLETING → TERMINAL (completed | stopped | timed out | limit | error)
//! ```
//!
//! [`AgentLoop::run`] never fails: every outcome, including provider errors,
//! resolves to an [`AgentResult`] with usable content and the full history.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::AgentDefaults;
use crate::providers::{ChatOptions, LLMProvider};
use crate::session::{Message, Role, SessionRegistry, SessionStatus, ToolCall, ToolResult};
use crate::tools::{ToolDescriptor, ToolExecutor};
use crate::utils::string::preview;

use super::budget::ContextBudget;
use super::decision::{parse_decision, Decision};
use super::progress::{ProgressEmitter, ProgressObserver, ProgressStep, StepKind, StepStatus};
use super::prompt::{build_system_prompt, tools_relevant, NUDGE_MESSAGE, SUMMARY_REQUEST};
use super::tool_retry::execute_with_retry;
use super::verify::{build_verification_messages, verify_completion};

/// Present in the final content of every run that hit the iteration limit.
pub const ITERATION_LIMIT_MARKER: &str = "reached the iteration limit";

/// Final content of a stopped run.
pub const STOPPED_MESSAGE: &str = "The agent run was stopped before it finished.";

/// Consecutive all-failed tool batches that count as "repeated failures".
const REPEATED_FAILURE_STREAK: u32 = 2;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Stopped,
    TimedOut,
    IterationLimit,
    Error,
}

impl RunStatus {
    /// Session status recorded for this outcome.
    pub fn session_status(self) -> SessionStatus {
        match self {
            Self::Completed | Self::IterationLimit => SessionStatus::Completed,
            Self::Stopped => SessionStatus::Stopped,
            Self::TimedOut | Self::Error => SessionStatus::Error,
        }
    }
}

/// Outcome of [`AgentLoop::run`].
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// Final content for the user.
    pub content: String,
    /// Prior history plus everything this run added. No system message.
    pub history: Vec<Message>,
    /// Completion iterations started.
    pub iterations: u32,
    pub status: RunStatus,
}

/// Identity, cancellation and deadline of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub session_id: String,
    pub conversation_id: String,
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
}

impl RunContext {
    /// Standalone context with a fresh id and token.
    pub fn new(conversation_id: &str) -> Self {
        Self {
            session_id: format!("run_{}", uuid::Uuid::new_v4().simple()),
            conversation_id: conversation_id.to_string(),
            cancel: CancellationToken::new(),
            timeout: None,
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = session_id.to_string();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why an awaited step did not finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Await `fut` unless the run or the call's abort handle is cancelled, or
/// the deadline passes first.
async fn guarded<F: Future>(
    fut: F,
    run: &CancellationToken,
    abort: &CancellationToken,
    deadline: Option<Instant>,
) -> std::result::Result<F::Output, Interrupt> {
    let expiry = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = run.cancelled() => Err(Interrupt::Cancelled),
        _ = abort.cancelled() => Err(Interrupt::Cancelled),
        _ = expiry => Err(Interrupt::TimedOut),
        out = fut => Ok(out),
    }
}

/// Mutable state of one run.
struct RunState {
    /// Audit history returned to the caller.
    history: Vec<Message>,
    /// Prompt sent to the model; reshaped by the context budget.
    working: Vec<Message>,
    iteration: u32,
    last_assistant: Option<String>,
    failed_streak: u32,
}

impl RunState {
    fn push(&mut self, message: Message) {
        self.working.push(message.clone());
        self.history.push(message);
    }

    fn note_assistant(&mut self, content: &str) {
        if !content.trim().is_empty() {
            self.last_assistant = Some(content.trim().to_string());
        }
    }
}

/// The orchestrator.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use speakmcp_core::agent::{AgentLoop, RunContext};
/// use speakmcp_core::config::Config;
///
/// let config = Config::default();
/// let agent = AgentLoop::new(provider, config.agent.clone(), config.context.clone());
/// let result = agent
///     .run("List my files", &tools, &gateway, 10, vec![], RunContext::new("conv_1"))
///     .await;
/// println!("{}", result.content);
/// ```
pub struct AgentLoop {
    provider: Arc<dyn LLMProvider>,
    defaults: AgentDefaults,
    budget: ContextBudget,
    registry: Option<SessionRegistry>,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        defaults: AgentDefaults,
        context: crate::config::ContextConfig,
    ) -> Self {
        Self {
            provider,
            defaults,
            budget: ContextBudget::new(context),
            registry: None,
            observer: None,
        }
    }

    /// Consult `registry` for stop flags, abort handles and progress gating.
    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn defaults(&self) -> &AgentDefaults {
        &self.defaults
    }

    fn model(&self) -> &str {
        if self.defaults.model.trim().is_empty() {
            self.provider.default_model()
        } else {
            &self.defaults.model
        }
    }

    /// Run the loop for `prompt`.
    ///
    /// `prior_history` is earlier conversation; system messages in it are
    /// ignored. Tool calls go through `executor`, strictly one at a time.
    pub async fn run(
        &self,
        prompt: &str,
        tools: &[ToolDescriptor],
        executor: &dyn ToolExecutor,
        max_iterations: u32,
        prior_history: Vec<Message>,
        ctx: RunContext,
    ) -> AgentResult {
        let span = info_span!(
            "agent_run",
            session_id = %ctx.session_id,
            conversation_id = %ctx.conversation_id
        );
        self.run_inner(prompt, tools, executor, max_iterations, prior_history, ctx)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        prompt: &str,
        tools: &[ToolDescriptor],
        executor: &dyn ToolExecutor,
        max_iterations: u32,
        prior_history: Vec<Message>,
        ctx: RunContext,
    ) -> AgentResult {
        let deadline = ctx.timeout.map(|t| Instant::now() + t);
        let mut emitter = ProgressEmitter::new(
            self.observer.clone(),
            self.registry.clone(),
            &ctx.session_id,
            &ctx.conversation_id,
            max_iterations,
        );
        if let Some(registry) = &self.registry {
            let _ = registry.set_status(&ctx.session_id, SessionStatus::Processing);
        }

        let system = build_system_prompt(self.defaults.system_prompt.as_deref(), tools);
        let mut history: Vec<Message> = prior_history
            .into_iter()
            .filter(|m| m.role != Role::System)
            .collect();
        history.push(Message::user(prompt));
        let mut working = Vec::with_capacity(history.len() + 1);
        working.push(Message::system(&system));
        working.extend(history.iter().cloned());
        let mut state = RunState {
            history,
            working,
            iteration: 0,
            last_assistant: None,
            failed_streak: 0,
        };

        let noop_limit = if tools_relevant(prompt, tools) {
            1
        } else {
            self.defaults.noop_streak_limit.max(1)
        };
        let mut noop_streak = 0u32;
        let mut verified = false;

        info!(
            max_iterations,
            tools = tools.len(),
            noop_limit,
            "Agent run started"
        );

        loop {
            if self.should_stop(&ctx) {
                return self.stopped(state, &emitter, &ctx);
            }
            if state.iteration >= max_iterations {
                return self.iteration_limit(state, &emitter, &ctx, max_iterations);
            }
            state.iteration += 1;
            if let Some(registry) = &self.registry {
                registry.record_iteration(&ctx.session_id, state.iteration);
            }
            debug!(iteration = state.iteration, max_iterations, "Agent iteration");
            emitter.step(ProgressStep::new(
                StepKind::Thinking,
                StepStatus::InProgress,
                format!("Iteration {}", state.iteration),
            ));
            emitter.update(state.iteration, &state.history);

            let abort = self.abort_handle(&ctx);
            let completion = guarded(self.complete(&mut state), &ctx.cancel, &abort, deadline).await;
            let raw = match completion {
                Ok(Ok(content)) => content,
                Ok(Err(e)) => {
                    warn!(error = %e, iteration = state.iteration, "Completion call failed");
                    let content = format!("I ran into an error while working on this: {}", e);
                    return self.finish(state, &emitter, &ctx, RunStatus::Error, content);
                }
                Err(interrupt) => return self.interrupted(state, &emitter, &ctx, interrupt),
            };

            let decision = parse_decision(&raw);
            debug!(
                iteration = state.iteration,
                is_final = decision.is_final(),
                "Decision parsed"
            );
            match decision {
                Decision::Error { message } => {
                    warn!(error = %message, "Model reported an error");
                    state.push(Message::assistant(&message));
                    return self.finish(state, &emitter, &ctx, RunStatus::Error, message);
                }

                Decision::ToolCalls {
                    content,
                    calls,
                    needs_more_work,
                } => {
                    noop_streak = 0;
                    state.note_assistant(&content);
                    state.push(Message::assistant_with_tools(&content, calls.clone()));

                    let mut results = Vec::with_capacity(calls.len());
                    for call in &calls {
                        if self.should_stop(&ctx) {
                            info!(
                                discarded = calls.len() - results.len(),
                                "Stop requested; discarding planned tool calls"
                            );
                            break;
                        }
                        emitter.step(ProgressStep::new(
                            StepKind::ToolCall,
                            StepStatus::InProgress,
                            call.name.clone(),
                        ));
                        emitter.update(state.iteration, &state.history);

                        let outcome = guarded(
                            execute_with_retry(
                                executor,
                                call,
                                &ctx.cancel,
                                self.defaults.tool_retry_attempts,
                                Duration::from_millis(self.defaults.tool_retry_base_ms),
                            ),
                            &ctx.cancel,
                            &ctx.cancel,
                            deadline,
                        )
                        .await;
                        match outcome {
                            Ok((result, retries)) => {
                                info!(
                                    tool = %call.name,
                                    is_error = result.is_error,
                                    retries,
                                    "Tool executed"
                                );
                                let status = if result.is_error {
                                    StepStatus::Failed
                                } else {
                                    StepStatus::Completed
                                };
                                emitter.step(
                                    ProgressStep::new(StepKind::ToolResult, status, call.name.clone())
                                        .with_detail(preview(&result.text(), 200)),
                                );
                                results.push(result);
                            }
                            Err(Interrupt::TimedOut) => {
                                self.record_tool_results(&mut state, &calls, results);
                                return self.interrupted(state, &emitter, &ctx, Interrupt::TimedOut);
                            }
                            Err(Interrupt::Cancelled) => break,
                        }
                    }

                    let cancelled = results.len() < calls.len();
                    self.record_tool_results(&mut state, &calls, results);
                    if cancelled {
                        return self.stopped(state, &emitter, &ctx);
                    }
                    emitter.update(state.iteration, &state.history);

                    if needs_more_work {
                        continue;
                    }
                    if self.defaults.verify_completion && !verified {
                        verified = true;
                        let verdict = self
                            .verify(&mut state, prompt, &content, tools, &ctx, deadline)
                            .await;
                        match verdict {
                            Ok(true) => {}
                            Ok(false) => continue,
                            Err(interrupt) => {
                                return self.interrupted(state, &emitter, &ctx, interrupt)
                            }
                        }
                    }
                    let summarized = self
                        .summarize_if_terse(&mut state, content, &ctx, deadline)
                        .await;
                    let content = match summarized {
                        Ok(content) => content,
                        Err(interrupt) => return self.interrupted(state, &emitter, &ctx, interrupt),
                    };
                    return self.finish(state, &emitter, &ctx, RunStatus::Completed, content);
                }

                Decision::Completion {
                    content,
                    needs_more_work: false,
                } => {
                    state.note_assistant(&content);
                    state.push(Message::assistant(&content));
                    if self.defaults.verify_completion && !verified {
                        verified = true;
                        let verdict = self
                            .verify(&mut state, prompt, &content, tools, &ctx, deadline)
                            .await;
                        match verdict {
                            Ok(true) => {}
                            Ok(false) => continue,
                            Err(interrupt) => {
                                return self.interrupted(state, &emitter, &ctx, interrupt)
                            }
                        }
                    }
                    return self.finish(state, &emitter, &ctx, RunStatus::Completed, content);
                }

                Decision::Completion {
                    content,
                    needs_more_work: true,
                } => {
                    if !content.trim().is_empty() {
                        state.note_assistant(&content);
                        state.push(Message::assistant(&content));
                    }
                    noop_streak += 1;
                    if noop_streak >= noop_limit {
                        debug!(noop_streak, noop_limit, "No decision; nudging");
                        emitter.step(ProgressStep::new(
                            StepKind::Nudge,
                            StepStatus::Completed,
                            "Asked the model to act or finish",
                        ));
                        state.push(Message::user(NUDGE_MESSAGE));
                    }
                }
            }
        }
    }

    /// Shape the prompt and ask for the next decision.
    async fn complete(&self, state: &mut RunState) -> crate::error::Result<String> {
        let model = self.model();
        let outcome = self
            .budget
            .manage_context(std::mem::take(&mut state.working), self.provider.as_ref(), model)
            .await;
        state.working = outcome.messages;

        let options = ChatOptions::new()
            .with_max_tokens(self.defaults.max_tokens)
            .with_temperature(self.defaults.temperature)
            .with_json_mode(true);
        let response = self
            .provider
            .chat(state.working.clone(), Some(model), options)
            .await?;
        Ok(response.content)
    }

    /// Run the verifier. `Ok(false)` means a continuation was appended.
    async fn verify(
        &self,
        state: &mut RunState,
        goal: &str,
        claimed: &str,
        tools: &[ToolDescriptor],
        ctx: &RunContext,
        deadline: Option<Instant>,
    ) -> std::result::Result<bool, Interrupt> {
        let messages = build_verification_messages(goal, claimed, &state.history, tools);
        let abort = self.abort_handle(ctx);
        let verdict = guarded(
            verify_completion(self.provider.as_ref(), self.model(), messages),
            &ctx.cancel,
            &abort,
            deadline,
        )
        .await?;
        match verdict {
            Some(v) if !v.is_complete => {
                info!(rationale = %v.rationale, "Verifier rejected completion");
                state.push(Message::user(&v.continuation_message()));
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    /// Ask for a readable wrap-up when a tool-backed completion is terse.
    async fn summarize_if_terse(
        &self,
        state: &mut RunState,
        content: String,
        ctx: &RunContext,
        deadline: Option<Instant>,
    ) -> std::result::Result<String, Interrupt> {
        if content.trim().chars().count() >= self.defaults.summary_min_chars {
            return Ok(content);
        }
        let mut messages = state.working.clone();
        messages.push(Message::user(SUMMARY_REQUEST));
        let options = ChatOptions::new()
            .with_max_tokens(self.defaults.max_tokens)
            .with_temperature(self.defaults.temperature)
            .with_json_mode(true);
        let abort = self.abort_handle(ctx);
        let response = guarded(
            self.provider.chat(messages, Some(self.model()), options),
            &ctx.cancel,
            &abort,
            deadline,
        )
        .await?;
        let summary = match response {
            Ok(r) => parse_decision(&r.content).content().trim().to_string(),
            Err(e) => {
                warn!(error = %e, "Summary request failed; keeping terse content");
                String::new()
            }
        };
        if summary.is_empty() {
            return Ok(content);
        }
        state.push(Message::assistant(&summary));
        Ok(summary)
    }

    fn record_tool_results(&self, state: &mut RunState, calls: &[ToolCall], results: Vec<ToolResult>) {
        if results.is_empty() {
            return;
        }
        if results.iter().all(|r| r.is_error) {
            state.failed_streak += 1;
        } else {
            state.failed_streak = 0;
        }
        let rendered = render_tool_results(calls, &results);
        state.push(Message::tool_results(&rendered, results));
    }

    fn should_stop(&self, ctx: &RunContext) -> bool {
        if ctx.cancel.is_cancelled() {
            return true;
        }
        match &self.registry {
            Some(registry) => {
                registry.get(&ctx.session_id).is_some() && registry.should_stop(&ctx.session_id)
            }
            None => false,
        }
    }

    /// Abort handle for one outstanding completion call.
    fn abort_handle(&self, ctx: &RunContext) -> CancellationToken {
        self.registry
            .as_ref()
            .and_then(|r| r.register_abort_handle(&ctx.session_id).ok())
            .unwrap_or_else(|| ctx.cancel.child_token())
    }

    fn interrupted(
        &self,
        state: RunState,
        emitter: &ProgressEmitter,
        ctx: &RunContext,
        interrupt: Interrupt,
    ) -> AgentResult {
        match interrupt {
            Interrupt::Cancelled => self.stopped(state, emitter, ctx),
            Interrupt::TimedOut => {
                let secs = ctx.timeout.map(|t| t.as_secs()).unwrap_or_default();
                let body = state
                    .last_assistant
                    .clone()
                    .unwrap_or_else(|| "I could not finish the task in time.".to_string());
                let content = format!(
                    "{}\n\n(Stopped: the run exceeded its time limit of {}s.)",
                    body, secs
                );
                warn!(iterations = state.iteration, "Agent run timed out");
                self.finish(state, emitter, ctx, RunStatus::TimedOut, content)
            }
        }
    }

    fn stopped(&self, state: RunState, emitter: &ProgressEmitter, ctx: &RunContext) -> AgentResult {
        info!(iterations = state.iteration, "Agent run stopped");
        emitter.finish_stopped(state.iteration, &state.history, STOPPED_MESSAGE);
        if let Some(registry) = &self.registry {
            let _ = registry.set_status(&ctx.session_id, SessionStatus::Stopped);
        }
        AgentResult {
            content: STOPPED_MESSAGE.to_string(),
            history: state.history,
            iterations: state.iteration,
            status: RunStatus::Stopped,
        }
    }

    fn iteration_limit(
        &self,
        mut state: RunState,
        emitter: &ProgressEmitter,
        ctx: &RunContext,
        max_iterations: u32,
    ) -> AgentResult {
        let body = state
            .last_assistant
            .clone()
            .unwrap_or_else(|| "I was not able to finish the task.".to_string());
        let trailer = if state.failed_streak >= REPEATED_FAILURE_STREAK {
            format!(
                "(Stopped due to repeated tool failures; {} of {}.)",
                ITERATION_LIMIT_MARKER, max_iterations
            )
        } else {
            format!("(Stopped: {} of {}.)", ITERATION_LIMIT_MARKER, max_iterations)
        };
        let content = format!("{}\n\n{}", body, trailer);
        warn!(
            iterations = state.iteration,
            failed_streak = state.failed_streak,
            "Agent run hit the iteration limit"
        );
        state.push(Message::assistant(&content));
        self.finish(state, emitter, ctx, RunStatus::IterationLimit, content)
    }

    fn finish(
        &self,
        state: RunState,
        emitter: &ProgressEmitter,
        ctx: &RunContext,
        status: RunStatus,
        content: String,
    ) -> AgentResult {
        let content = if content.trim().is_empty() {
            state
                .last_assistant
                .clone()
                .unwrap_or_else(|| "Task completed.".to_string())
        } else {
            content
        };
        emitter.finish(state.iteration, &state.history, &content);
        if let Some(registry) = &self.registry {
            match status {
                RunStatus::TimedOut | RunStatus::Error => {
                    registry.fail_session(&ctx.session_id, &preview(&content, 200))
                }
                other => {
                    let _ = registry.set_status(&ctx.session_id, other.session_status());
                }
            }
        }
        info!(iterations = state.iteration, status = ?status, "Agent run finished");
        AgentResult {
            content,
            history: state.history,
            iterations: state.iteration,
            status,
        }
    }
}

/// One block per result, labelled with the tool name.
fn render_tool_results(calls: &[ToolCall], results: &[ToolResult]) -> String {
    calls
        .iter()
        .zip(results)
        .map(|(call, result)| {
            if result.is_error {
                format!("[{}]\nERROR: {}", call.name, result.text())
            } else {
                format!("[{}]\n{}", call.name, result.text())
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
