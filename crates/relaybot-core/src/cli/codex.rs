//! Command composition and output parsing for the codex CLI.
//!
//! codex has one machine output mode: `exec --json` emits newline-delimited
//! events. Non-streaming calls parse the same transcript and keep only the
//! final message. Resume uses the distinct `exec resume <id>` subcommand.

use serde_json::Value;

use super::{CliRequest, CliResponse, Invocation, StreamEvent};
use crate::CoreError;

pub(crate) fn compose(binary: &str, req: &CliRequest) -> Invocation {
    let mut command = tokio::process::Command::new(binary);
    command.arg("exec");

    if let Some(session_id) = &req.resume_session_id {
        command.arg("resume");
        command.arg(session_id);
    }

    command.args(["--json", "--color", "never", "--sandbox", "workspace-write"]);

    if !req.model.is_empty() {
        command.arg("-c").arg(format!("model={}", req.model));
    }
    if let Some(effort) = &req.reasoning_effort {
        command.arg("-c").arg(format!("model_reasoning_effort={effort}"));
    }

    command.args(&req.extra_args);

    if cfg!(windows) {
        // The prompt goes over stdin on Windows-like hosts; `exec` reads it
        // when no positional prompt is given.
        Invocation {
            command,
            stdin_payload: Some(req.prompt.clone()),
        }
    } else {
        command.arg(&req.prompt);
        Invocation {
            command,
            stdin_payload: None,
        }
    }
}

/// Parse one codex JSONL event into a normalized stream event.
pub(crate) fn parse_stream_line(line: &str) -> Option<StreamEvent> {
    let value: Value = serde_json::from_str(line).ok()?;
    let kind = value.get("type")?.as_str()?;

    match kind {
        "thread.started" => Some(StreamEvent::SystemInit {
            session_id: value.get("thread_id")?.as_str()?.to_string(),
        }),
        "item.started" | "item.updated" | "item.completed" => {
            let item = value.get("item")?;
            match item.get("item_type").or_else(|| item.get("type"))?.as_str()? {
                "assistant_message" | "agent_message" => {
                    // Only completed items carry the full text; partials are
                    // treated as status noise.
                    if kind != "item.completed" {
                        return Some(StreamEvent::SystemStatus("thinking".into()));
                    }
                    item.get("text")
                        .and_then(Value::as_str)
                        .map(|t| StreamEvent::TextDelta(t.to_string()))
                }
                "command_execution" => Some(StreamEvent::ToolUse(
                    item.get("command")
                        .and_then(Value::as_str)
                        .unwrap_or("command")
                        .to_string(),
                )),
                "reasoning" => Some(StreamEvent::SystemStatus("thinking".into())),
                _ => None,
            }
        }
        "turn.completed" => {
            let usage = value.get("usage");
            let tokens = usage
                .map(|u| {
                    u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0)
                        + u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0)
                })
                .unwrap_or(0);
            Some(StreamEvent::Result {
                session_id: None,
                cost_usd: 0.0,
                tokens,
                is_error: false,
                text: None,
            })
        }
        "turn.failed" => Some(StreamEvent::Result {
            session_id: None,
            cost_usd: 0.0,
            tokens: 0,
            is_error: true,
            text: value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        "error" => Some(StreamEvent::Result {
            session_id: None,
            cost_usd: 0.0,
            tokens: 0,
            is_error: true,
            text: value.get("message").and_then(Value::as_str).map(str::to_string),
        }),
        _ => None,
    }
}

/// Fold a whole `--json` transcript into one response.
pub(crate) fn parse_transcript(output: &str) -> Result<CliResponse, CoreError> {
    let mut response = CliResponse::default();
    let mut saw_any = false;
    let mut text = String::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(event) = parse_stream_line(line) else {
            continue;
        };
        saw_any = true;
        match event {
            StreamEvent::SystemInit { session_id } => response.session_id = Some(session_id),
            StreamEvent::TextDelta(chunk) => text.push_str(&chunk),
            StreamEvent::Result {
                tokens,
                is_error,
                text: err_text,
                ..
            } => {
                response.tokens = tokens;
                response.is_error = is_error;
                if is_error {
                    if let Some(message) = err_text {
                        text = message;
                    }
                }
            }
            _ => {}
        }
    }

    if !saw_any {
        return Err(CoreError::cli("codex produced no parseable output"));
    }
    response.text = text;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_thread_started() {
        let line = r#"{"type":"thread.started","thread_id":"t-77"}"#;
        match parse_stream_line(line) {
            Some(StreamEvent::SystemInit { session_id }) => assert_eq!(session_id, "t-77"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_completed_message() {
        let line = r#"{"type":"item.completed","item":{"item_type":"assistant_message","text":"done"}}"#;
        match parse_stream_line(line) {
            Some(StreamEvent::TextDelta(t)) => assert_eq!(t, "done"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_transcript_success() {
        let transcript = r#"
{"type":"thread.started","thread_id":"t-1"}
{"type":"item.completed","item":{"item_type":"command_execution","command":"ls"}}
{"type":"item.completed","item":{"item_type":"assistant_message","text":"two files"}}
{"type":"turn.completed","usage":{"input_tokens":100,"output_tokens":20}}
"#;
        let response = parse_transcript(transcript).unwrap();
        assert_eq!(response.session_id.as_deref(), Some("t-1"));
        assert_eq!(response.text, "two files");
        assert_eq!(response.tokens, 120);
        assert!(!response.is_error);
    }

    #[test]
    fn test_parse_transcript_failure() {
        let transcript = r#"
{"type":"thread.started","thread_id":"t-2"}
{"type":"turn.failed","error":{"message":"model overloaded"}}
"#;
        let response = parse_transcript(transcript).unwrap();
        assert!(response.is_error);
        assert_eq!(response.text, "model overloaded");
    }

    #[test]
    fn test_compose_resume_subcommand() {
        let req = CliRequest {
            provider: "codex".into(),
            model: "gpt-5-codex".into(),
            prompt: "hi".into(),
            resume_session_id: Some("t-9".into()),
            ..Default::default()
        };
        let invocation = compose("codex", &req);
        let args: Vec<String> = invocation
            .command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "exec");
        assert_eq!(args[1], "resume");
        assert_eq!(args[2], "t-9");
        assert!(args.contains(&"--json".to_string()));
    }
}
