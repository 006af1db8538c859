//! Completion verification.
//!
//! Before an explicit "done" is accepted, a second, conservative prompt
//! checks the claimed outcome against the goal and the recent tool
//! evidence. A verifier that fails or answers unparseably never blocks
//! completion.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::providers::{ChatOptions, LLMProvider};
use crate::session::{Message, Role};
use crate::tools::ToolDescriptor;
use crate::utils::string::preview;

use super::decision::extract_json_object;

/// Tool messages included as evidence.
const EVIDENCE_MESSAGES: usize = 6;

/// Characters kept per evidence message.
const EVIDENCE_CHARS: usize = 600;

const VERIFIER_SYSTEM_PROMPT: &str = "You are a strict completion verifier. Decide whether \
the assistant actually accomplished the user's goal, based only on the evidence shown. \
When in doubt, answer that the task is not complete. Respond with one JSON object: \
{\"isComplete\": bool, \"rationale\": string, \"missingItems\": [string], \"nextActions\": [string]}";

/// The verifier's judgement.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationVerdict {
    pub is_complete: bool,
    pub rationale: String,
    pub missing_items: Vec<String>,
    pub next_actions: Vec<String>,
}

impl VerificationVerdict {
    /// Message appended to the conversation when the task is not done.
    pub fn continuation_message(&self) -> String {
        let mut text = format!(
            "The task is not complete yet. {}",
            if self.rationale.is_empty() {
                "Keep working."
            } else {
                self.rationale.as_str()
            }
        );
        if !self.missing_items.is_empty() {
            text.push_str("\nMissing:\n");
            for item in &self.missing_items {
                text.push_str(&format!("- {}\n", item));
            }
        }
        if !self.next_actions.is_empty() {
            text.push_str("\nNext steps:\n");
            for action in &self.next_actions {
                text.push_str(&format!("- {}\n", action));
            }
        }
        text.trim_end().to_string()
    }
}

/// Build the verifier conversation.
pub fn build_verification_messages(
    goal: &str,
    claimed_outcome: &str,
    history: &[Message],
    tools: &[ToolDescriptor],
) -> Vec<Message> {
    let mut body = format!(
        "Goal:\n{}\n\nClaimed outcome:\n{}\n",
        goal.trim(),
        claimed_outcome.trim()
    );

    let evidence: Vec<&Message> = history
        .iter()
        .rev()
        .filter(|m| m.role == Role::Tool)
        .take(EVIDENCE_MESSAGES)
        .collect();
    if evidence.is_empty() {
        body.push_str("\nNo tools were called.\n");
    } else {
        body.push_str("\nRecent tool results (newest first):\n");
        for msg in evidence {
            body.push_str(&format!("- {}\n", preview(&msg.content, EVIDENCE_CHARS)));
        }
    }

    if !tools.is_empty() {
        body.push_str("\nAvailable tools:\n");
        for tool in tools {
            body.push_str(&format!("- {}\n", tool.compact_signature()));
        }
    }

    vec![Message::system(VERIFIER_SYSTEM_PROMPT), Message::user(&body)]
}

/// Parse a verifier response.
///
/// `None` when no object carrying a boolean `isComplete` is present.
pub fn parse_verdict(raw: &str) -> Option<VerificationVerdict> {
    let trimmed = raw.trim();
    verdict_from_json(trimmed).or_else(|| extract_json_object(trimmed).and_then(verdict_from_json))
}

fn verdict_from_json(text: &str) -> Option<VerificationVerdict> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("isComplete")?.as_bool()?;
    serde_json::from_value(value).ok()
}

/// Ask the verifier. `None` means "could not verify", which callers treat
/// as accepted.
pub async fn verify_completion(
    provider: &dyn LLMProvider,
    model: &str,
    messages: Vec<Message>,
) -> Option<VerificationVerdict> {
    let options = ChatOptions::new().with_temperature(0.0).with_json_mode(true);
    match provider.chat(messages, Some(model), options).await {
        Ok(response) => {
            let verdict = parse_verdict(&response.content);
            if verdict.is_none() {
                warn!("Verifier response was not a verdict; accepting completion");
            }
            debug!(verdict = ?verdict, "Completion verified");
            verdict
        }
        Err(e) => {
            warn!(error = %e, "Verifier call failed; accepting completion");
            None
        }
    }
}
