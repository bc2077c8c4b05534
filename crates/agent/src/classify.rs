//! Classification of the agent's stream-json output lines.
//!
//! Each parsed line becomes zero or more [`AgentOutput`]s. Lines that
//! fail to parse as JSON are forwarded as raw log output rather than
//! tearing the session down.

use serde_json::Value;

/// Classified output from the agent.
#[derive(Debug, Clone)]
pub enum AgentOutput {
    /// Assistant-authored text.
    AssistantText { text: String },
    /// A tool-use request needing a permission decision.
    ToolUse {
        tool_use_id: String,
        tool_name: String,
        input: Value,
        description: String,
    },
    /// An AskUserQuestion tool use - the agent is waiting on the human.
    Question { tool_use_id: String, question: Value },
    /// A status transition (init, result, errors).
    Status {
        hint: StatusHint,
        message: Option<String>,
    },
    /// An unclassified or unparseable line, forwarded verbatim.
    Raw { line: String },
}

/// Rough state hint extracted from system/result lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusHint {
    Running,
    Done,
    Failed,
}

/// Classify one stdout line.
pub fn classify_line(line: &str) -> Vec<AgentOutput> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            return vec![AgentOutput::Raw {
                line: line.to_string(),
            }]
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => classify_assistant(&value),
        Some("system") => vec![AgentOutput::Status {
            hint: StatusHint::Running,
            message: value
                .get("subtype")
                .and_then(Value::as_str)
                .map(str::to_string),
        }],
        Some("result") => {
            let failed = value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            vec![AgentOutput::Status {
                hint: if failed {
                    StatusHint::Failed
                } else {
                    StatusHint::Done
                },
                message: value
                    .get("subtype")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }]
        }
        _ => vec![AgentOutput::Raw {
            line: line.to_string(),
        }],
    }
}

fn classify_assistant(value: &Value) -> Vec<AgentOutput> {
    let Some(content) = value
        .pointer("/message/content")
        .and_then(Value::as_array)
    else {
        return vec![AgentOutput::Raw {
            line: value.to_string(),
        }];
    };

    let mut out = Vec::new();
    for block in content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    out.push(AgentOutput::AssistantText {
                        text: text.to_string(),
                    });
                }
            }
            Some("tool_use") => {
                let tool_use_id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let tool_name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(Value::Null);

                if tool_name == "AskUserQuestion" {
                    out.push(AgentOutput::Question {
                        tool_use_id,
                        question: input,
                    });
                } else {
                    let description = describe_tool_use(&tool_name, &input);
                    out.push(AgentOutput::ToolUse {
                        tool_use_id,
                        tool_name,
                        input,
                        description,
                    });
                }
            }
            _ => {}
        }
    }

    if out.is_empty() {
        out.push(AgentOutput::Raw {
            line: value.to_string(),
        });
    }
    out
}

/// Human-readable one-liner for a tool use, shown on the mobile prompt.
pub fn describe_tool_use(tool_name: &str, input: &Value) -> String {
    match tool_name {
        "Bash" => input
            .get("command")
            .and_then(Value::as_str)
            .map(|c| format!("Run: {}", truncate(c, 120)))
            .unwrap_or_else(|| "Run a shell command".to_string()),
        "Write" | "Edit" | "Read" => input
            .get("file_path")
            .and_then(Value::as_str)
            .map(|p| format!("{tool_name} {p}"))
            .unwrap_or_else(|| tool_name.to_string()),
        other => {
            for key in ["url", "path", "file_path", "query", "command"] {
                if let Some(v) = input.get(key).and_then(Value::as_str) {
                    return format!("{other}: {}", truncate(v, 120));
                }
            }
            other.to_string()
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let end = (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0);
    format!("{}…", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_text_block() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}"#;
        let out = classify_line(line);
        assert!(matches!(&out[0], AgentOutput::AssistantText { text } if text == "hello"));
    }

    #[test]
    fn tool_use_block_carries_description() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"ls -la"}}]}}"#;
        let out = classify_line(line);
        match &out[0] {
            AgentOutput::ToolUse {
                tool_use_id,
                tool_name,
                description,
                ..
            } => {
                assert_eq!(tool_use_id, "toolu_1");
                assert_eq!(tool_name, "Bash");
                assert_eq!(description, "Run: ls -la");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ask_user_question_is_waiting() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_2","name":"AskUserQuestion","input":{"question":"pick one"}}]}}"#;
        let out = classify_line(line);
        assert!(matches!(&out[0], AgentOutput::Question { tool_use_id, .. } if tool_use_id == "toolu_2"));
    }

    #[test]
    fn result_line_maps_to_status() {
        let out = classify_line(r#"{"type":"result","subtype":"success","is_error":false}"#);
        assert!(
            matches!(&out[0], AgentOutput::Status { hint: StatusHint::Done, message } if message.as_deref() == Some("success"))
        );

        let out = classify_line(r#"{"type":"result","is_error":true}"#);
        assert!(matches!(&out[0], AgentOutput::Status { hint: StatusHint::Failed, .. }));
    }

    #[test]
    fn non_json_is_raw() {
        let out = classify_line("plain text progress ...");
        assert!(matches!(&out[0], AgentOutput::Raw { line } if line.contains("progress")));
    }

    #[test]
    fn mixed_blocks_produce_multiple_outputs() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"will run"},{"type":"tool_use","id":"t","name":"Write","input":{"file_path":"a.py"}}]}}"#;
        let out = classify_line(line);
        assert_eq!(out.len(), 2);
    }
}
