//! Decision parsing.
//!
//! The completion capability answers with `{content?, toolCalls?[],
//! needsMoreWork?}`. Responses are parsed into a [`Decision`] at the
//! boundary: strict JSON first, then the first balanced `{...}` object
//! embedded in the text, then the raw text as plain content.

use serde::Deserialize;
use serde_json::Value;

use crate::session::ToolCall;

/// What the completion capability decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Run these tools. `needs_more_work` is false when the model also
    /// declared the task finished.
    ToolCalls {
        content: String,
        calls: Vec<ToolCall>,
        needs_more_work: bool,
    },
    /// No tools. Final when `needs_more_work` is false.
    Completion {
        content: String,
        needs_more_work: bool,
    },
    /// The payload carried an explicit error.
    Error { message: String },
}

impl Decision {
    /// An explicit completion: no tool calls and no further work requested.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Decision::Completion {
                needs_more_work: false,
                ..
            }
        )
    }

    pub fn content(&self) -> &str {
        match self {
            Decision::ToolCalls { content, .. } | Decision::Completion { content, .. } => content,
            Decision::Error { message } => message,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDecision {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "tool_calls")]
    tool_calls: Option<Vec<RawToolCall>>,
    #[serde(default, alias = "needs_more_work")]
    needs_more_work: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawToolCall {
    #[serde(alias = "toolName", alias = "tool")]
    name: String,
    #[serde(default, alias = "args", alias = "input")]
    arguments: Value,
}

/// Parse a raw completion into a [`Decision`].
///
/// # Examples
/// ```
/// use speakmcp_core::agent::decision::{parse_decision, Decision};
///
/// let d = parse_decision(r#"{"content": "All done", "needsMoreWork": false}"#);
/// assert!(d.is_final());
///
/// let d = parse_decision(r#"Sure! {"toolCalls": [{"name": "files:list", "arguments": {}}]}"#);
/// assert!(matches!(d, Decision::ToolCalls { .. }));
///
/// let d = parse_decision("just some text");
/// assert!(!d.is_final());
/// ```
pub fn parse_decision(raw: &str) -> Decision {
    let trimmed = strip_code_fence(raw.trim());
    let parsed = serde_json::from_str::<RawDecision>(trimmed).ok().or_else(|| {
        extract_json_object(trimmed).and_then(|obj| serde_json::from_str::<RawDecision>(obj).ok())
    });

    match parsed {
        Some(decision) => from_raw(decision),
        None => Decision::Completion {
            content: raw.trim().to_string(),
            needs_more_work: true,
        },
    }
}

fn from_raw(raw: RawDecision) -> Decision {
    let content = raw.content.unwrap_or_default();
    if let Some(message) = raw.error.filter(|e| !e.trim().is_empty()) {
        return Decision::Error { message };
    }

    let calls: Vec<ToolCall> = raw
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .filter(|c| !c.name.trim().is_empty())
        .enumerate()
        .map(|(i, c)| {
            let arguments = normalize_arguments(c.arguments);
            ToolCall::new(&format!("call_{}", i + 1), c.name.trim(), arguments)
        })
        .collect();

    if !calls.is_empty() {
        return Decision::ToolCalls {
            content,
            calls,
            needs_more_work: raw.needs_more_work.unwrap_or(true),
        };
    }

    // A structured answer with content, no calls and no flag is a final answer.
    let needs_more_work = raw
        .needs_more_work
        .unwrap_or_else(|| content.trim().is_empty());
    Decision::Completion {
        content,
        needs_more_work,
    }
}

/// Arguments sent as a JSON string are decoded; null becomes `{}`.
fn normalize_arguments(arguments: Value) -> Value {
    match arguments {
        Value::Null => Value::Object(Default::default()),
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(v @ Value::Object(_)) => v,
            _ => Value::String(s),
        },
        other => other,
    }
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// The first balanced `{...}` object in `text`.
///
/// Braces inside JSON strings (including escaped quotes) are ignored.
/// Returns `None` when no object closes.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in bytes.iter().enumerate().skip(start) {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..=i];
                        if serde_json::from_str::<Value>(candidate).is_ok() {
                            return Some(candidate);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        search_from = start + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_calls_default_to_more_work() {
        let d = parse_decision(
            r#"{"content": "Reading", "toolCalls": [{"name": "files:read", "arguments": {"path": "/a"}}]}"#,
        );
        match d {
            Decision::ToolCalls {
                content,
                calls,
                needs_more_work,
            } => {
                assert_eq!(content, "Reading");
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].name, "files:read");
                assert_eq!(calls[0].arguments, json!({"path": "/a"}));
                assert!(needs_more_work);
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_tool_calls_with_done_flag() {
        let d = parse_decision(
            r#"{"toolCalls": [{"toolName": "x:y", "arguments": "{\"a\": 1}"}], "needsMoreWork": false}"#,
        );
        match d {
            Decision::ToolCalls {
                calls,
                needs_more_work,
                ..
            } => {
                assert_eq!(calls[0].name, "x:y");
                assert_eq!(calls[0].arguments, json!({"a": 1}));
                assert!(!needs_more_work);
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_missing_flag_semantics() {
        assert!(parse_decision(r#"{"content": "Here you go"}"#).is_final());
        assert!(!parse_decision(r#"{"needsMoreWork": true}"#).is_final());
        assert!(!parse_decision("{}").is_final());
    }

    #[test]
    fn test_fenced_json() {
        let d = parse_decision("```json\n{\"content\": \"ok\", \"needsMoreWork\": false}\n```");
        assert!(d.is_final());
        assert_eq!(d.content(), "ok");
    }

    #[test]
    fn test_plain_text_keeps_loop_alive() {
        let d = parse_decision("I will look into it.");
        assert_eq!(
            d,
            Decision::Completion {
                content: "I will look into it.".into(),
                needs_more_work: true
            }
        );
    }

    #[test]
    fn test_error_decision() {
        let d = parse_decision(r#"{"error": "cannot comply"}"#);
        assert_eq!(
            d,
            Decision::Error {
                message: "cannot comply".into()
            }
        );
    }

    #[test]
    fn test_extract_json_object_skips_braces_in_strings() {
        let text = r#"prefix {"content": "a } tricky \" one", "needsMoreWork": false} suffix"#;
        let obj = extract_json_object(text).unwrap();
        assert!(obj.starts_with("{\"content\""));
        assert!(obj.ends_with("false}"));
    }

    #[test]
    fn test_extract_json_object_skips_invalid_candidates() {
        let text = r#"{not json} then {"content": "ok"}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"content": "ok"}"#));
        assert_eq!(extract_json_object("no braces"), None);
        assert_eq!(extract_json_object("{ unclosed"), None);
    }
}
