//! Command composition and output parsing for the claude CLI.
//!
//! Non-streaming output is a single JSON object (`--output-format json`);
//! streaming output is newline-delimited JSON events
//! (`--output-format stream-json --verbose`).

use serde_json::Value;

use super::{CliRequest, CliResponse, Invocation, StreamEvent};
use crate::CoreError;

pub(crate) fn compose(binary: &str, req: &CliRequest, streaming: bool) -> Invocation {
    let mut command = tokio::process::Command::new(binary);
    command.arg("-p");

    if streaming {
        command.args(["--output-format", "stream-json", "--verbose"]);
    } else {
        command.args(["--output-format", "json"]);
    }

    command.arg("--permission-mode").arg(&req.permission_mode);
    command.arg("--model").arg(&req.model);

    if let Some(system) = &req.system_prompt {
        command.arg("--system-prompt").arg(system);
    }
    if let Some(appended) = &req.append_system_prompt {
        command.arg("--append-system-prompt").arg(appended);
    }
    if let Some(max_turns) = req.max_turns {
        command.arg("--max-turns").arg(max_turns.to_string());
    }
    if let Some(budget) = req.max_budget_usd {
        command.arg("--max-budget-usd").arg(budget.to_string());
    }

    if let Some(session_id) = &req.resume_session_id {
        command.arg("--resume").arg(session_id);
    } else if req.continue_last {
        command.arg("--continue");
    }

    command.args(&req.extra_args);

    // Windows command-line quoting mangles multi-line prompts; feed the
    // prompt on stdin there instead.
    if cfg!(windows) {
        Invocation {
            command,
            stdin_payload: Some(req.prompt.clone()),
        }
    } else {
        command.arg("--");
        command.arg(&req.prompt);
        Invocation {
            command,
            stdin_payload: None,
        }
    }
}

/// Parse one NDJSON stream line into a normalized event.
pub(crate) fn parse_stream_line(line: &str) -> Option<StreamEvent> {
    let value: Value = serde_json::from_str(line).ok()?;
    let kind = value.get("type")?.as_str()?;

    match kind {
        "system" => match value.get("subtype").and_then(Value::as_str) {
            Some("init") => Some(StreamEvent::SystemInit {
                session_id: value.get("session_id")?.as_str()?.to_string(),
            }),
            Some("compact_boundary") => {
                let meta = value.get("compact_metadata")?;
                Some(StreamEvent::CompactBoundary {
                    trigger: meta
                        .get("trigger")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    pre_tokens: meta.get("pre_tokens").and_then(Value::as_u64).unwrap_or(0),
                })
            }
            Some(subtype) => Some(StreamEvent::SystemStatus(subtype.to_string())),
            None => None,
        },
        "assistant" => {
            // Assistant messages carry a content array of text and tool_use
            // blocks; emit one event per block.
            let content = value.get("message")?.get("content")?.as_array()?;
            let mut text = String::new();
            let mut tool: Option<String> = None;
            for block in content {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(t) = block.get("text").and_then(Value::as_str) {
                            text.push_str(t);
                        }
                    }
                    Some("tool_use") => {
                        tool = block
                            .get("name")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                    }
                    _ => {}
                }
            }
            if let Some(name) = tool {
                Some(StreamEvent::ToolUse(name))
            } else if !text.is_empty() {
                Some(StreamEvent::TextDelta(text))
            } else {
                None
            }
        }
        "result" => Some(result_event(&value)),
        _ => None,
    }
}

/// Parse the single-object non-streaming output.
pub(crate) fn parse_result_json(output: &str) -> Result<CliResponse, CoreError> {
    let trimmed = output.trim();
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| CoreError::cli(format!("claude result parse failed: {e}")))?;

    let StreamEvent::Result {
        session_id,
        cost_usd,
        tokens,
        is_error,
        text,
    } = result_event(&value)
    else {
        unreachable!("result_event always returns Result");
    };

    Ok(CliResponse {
        text: text.unwrap_or_default(),
        session_id,
        cost_usd,
        tokens,
        is_error,
        stream_fallback: false,
    })
}

fn result_event(value: &Value) -> StreamEvent {
    let usage = value.get("usage");
    let tokens = usage
        .map(|u| {
            u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0)
                + u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0)
        })
        .unwrap_or(0);

    StreamEvent::Result {
        session_id: value
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        cost_usd: value
            .get("total_cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        tokens,
        is_error: value
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        text: value.get("result").and_then(Value::as_str).map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init_event() {
        let line = r#"{"type":"system","subtype":"init","session_id":"abc-123"}"#;
        match parse_stream_line(line) {
            Some(StreamEvent::SystemInit { session_id }) => assert_eq!(session_id, "abc-123"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_status_event() {
        let line = r#"{"type":"system","subtype":"compacting"}"#;
        match parse_stream_line(line) {
            Some(StreamEvent::SystemStatus(label)) => assert_eq!(label, "compacting"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_compact_boundary() {
        let line = r#"{"type":"system","subtype":"compact_boundary","compact_metadata":{"trigger":"auto","pre_tokens":155000}}"#;
        match parse_stream_line(line) {
            Some(StreamEvent::CompactBoundary { trigger, pre_tokens }) => {
                assert_eq!(trigger, "auto");
                assert_eq!(pre_tokens, 155_000);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_assistant_text_and_tool() {
        let text = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}"#;
        match parse_stream_line(text) {
            Some(StreamEvent::TextDelta(t)) => assert_eq!(t, "hello"),
            other => panic!("unexpected: {other:?}"),
        }

        let tool = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash"}]}}"#;
        match parse_stream_line(tool) {
            Some(StreamEvent::ToolUse(name)) => assert_eq!(name, "Bash"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_line_is_none() {
        assert!(parse_stream_line("not json").is_none());
        assert!(parse_stream_line(r#"{"no":"type"}"#).is_none());
    }

    #[test]
    fn test_parse_result_json() {
        let output = r#"{
            "type":"result","subtype":"success","is_error":false,
            "result":"Done.","session_id":"s-1","total_cost_usd":0.042,
            "usage":{"input_tokens":1200,"output_tokens":300}
        }"#;
        let response = parse_result_json(output).unwrap();
        assert_eq!(response.text, "Done.");
        assert_eq!(response.session_id.as_deref(), Some("s-1"));
        assert!((response.cost_usd - 0.042).abs() < f64::EPSILON);
        assert_eq!(response.tokens, 1500);
        assert!(!response.is_error);
    }

    #[test]
    fn test_compose_resume_and_limits() {
        let req = CliRequest {
            provider: "claude".into(),
            model: "sonnet".into(),
            prompt: "hi".into(),
            permission_mode: "acceptEdits".into(),
            resume_session_id: Some("s-9".into()),
            max_turns: Some(25),
            ..Default::default()
        };
        let invocation = compose("claude", &req, true);
        let args: Vec<String> = invocation
            .command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.windows(2).any(|w| w == ["--resume", "s-9"]));
        assert!(args.windows(2).any(|w| w == ["--max-turns", "25"]));
        assert!(args.contains(&"stream-json".to_string()));
    }
}
