//! Canonical permission patterns.
//!
//! A pattern is a deterministic string derived from `(tool name, tool
//! input)` - the key for session-memory lookups. Examples:
//! `Bash(rm:*)`, `Bash(git commit:*)`, `Write(*.py)`, `Edit(/repo/*)`,
//! `mcp__browser__navigate(https://example.com)`.

use serde_json::Value;
use std::path::Path;

/// Commands whose first sub-command is part of the permission boundary:
/// `git commit` and `git push` should be decided separately.
const MULTI_WORD_COMMANDS: &[&str] = &[
    "git", "npm", "yarn", "pnpm", "go", "cargo", "docker", "kubectl",
];

/// Input keys checked, in priority order, to extract an MCP tool target.
const MCP_TARGET_KEYS: &[&str] = &["url", "path", "file_path", "selector", "command", "query"];

const FILE_TOOLS: &[&str] = &["Write", "Edit", "Read"];

/// Derive the canonical pattern for a tool invocation.
pub fn generate_pattern(tool_name: &str, input: &Value) -> String {
    if tool_name == "Bash" {
        let command = input.get("command").and_then(Value::as_str).unwrap_or("");
        return match bash_prefix(command) {
            Some(prefix) => format!("Bash({prefix}:*)"),
            None => "Bash(*)".to_string(),
        };
    }

    if FILE_TOOLS.contains(&tool_name) {
        let path = file_tool_path(input);
        return match path {
            Some(path) => format!("{tool_name}({})", file_pattern_body(path)),
            None => format!("{tool_name}(*)"),
        };
    }

    if tool_name.starts_with("mcp__") {
        for key in MCP_TARGET_KEYS {
            if let Some(target) = input.get(*key).and_then(Value::as_str) {
                if !target.is_empty() {
                    return format!("{tool_name}({target})");
                }
            }
        }
        return format!("{tool_name}(*)");
    }

    format!("{tool_name}(*)")
}

/// Whether `pattern` covers the invocation `(tool_name, input)`.
///
/// Exact equality with the freshly generated pattern always matches;
/// otherwise Bash prefixes, file suffix/directory wildcards and the
/// universal `Tool(*)` are evaluated.
pub fn match_pattern(pattern: &str, tool_name: &str, input: &Value) -> bool {
    if pattern == generate_pattern(tool_name, input) {
        return true;
    }

    let Some((name, body)) = split_pattern(pattern) else {
        return false;
    };
    if name != tool_name {
        return false;
    }
    if body == "*" {
        return true;
    }

    if tool_name == "Bash" {
        let Some(prefix) = body.strip_suffix(":*") else {
            return false;
        };
        let command = input.get("command").and_then(Value::as_str).unwrap_or("");
        let command_tokens: Vec<&str> = command.split_whitespace().collect();
        let prefix_tokens: Vec<&str> = prefix.split_whitespace().collect();
        return !prefix_tokens.is_empty()
            && command_tokens.len() >= prefix_tokens.len()
            && command_tokens[..prefix_tokens.len()] == prefix_tokens[..];
    }

    if FILE_TOOLS.contains(&tool_name) {
        let Some(path) = file_tool_path(input) else {
            return false;
        };
        if let Some(ext) = body.strip_prefix('*') {
            // "*.py" matches by suffix.
            return path.ends_with(ext);
        }
        if let Some(dir) = body.strip_suffix("/*") {
            // "/repo/src/*" matches by directory prefix.
            return Path::new(path).starts_with(dir);
        }
        return false;
    }

    false
}

fn bash_prefix(command: &str) -> Option<String> {
    let mut tokens = command.split_whitespace();
    let base = tokens.next()?;
    if MULTI_WORD_COMMANDS.contains(&base) {
        if let Some(sub) = tokens.next() {
            // Skip leading flags so `git -C x commit` and `git commit`
            // share a boundary only when the sub-command matches.
            if !sub.starts_with('-') {
                return Some(format!("{base} {sub}"));
            }
        }
    }
    Some(base.to_string())
}

fn file_tool_path(input: &Value) -> Option<&str> {
    input
        .get("file_path")
        .or_else(|| input.get("path"))
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
}

fn file_pattern_body(path: &str) -> String {
    if let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) {
        return format!("*.{ext}");
    }
    match Path::new(path).parent() {
        Some(dir) if dir != Path::new("") => format!("{}/*", dir.display()),
        _ => "*".to_string(),
    }
}

fn split_pattern(pattern: &str) -> Option<(&str, &str)> {
    let open = pattern.find('(')?;
    let body = pattern.get(open + 1..pattern.len().checked_sub(1)?)?;
    if !pattern.ends_with(')') {
        return None;
    }
    Some((&pattern[..open], body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bash_base_command() {
        assert_eq!(
            generate_pattern("Bash", &json!({"command": "rm -rf build"})),
            "Bash(rm:*)"
        );
    }

    #[test]
    fn bash_multi_word_commands_include_subcommand() {
        assert_eq!(
            generate_pattern("Bash", &json!({"command": "git commit -m wip"})),
            "Bash(git commit:*)"
        );
        assert_eq!(
            generate_pattern("Bash", &json!({"command": "npm install left-pad"})),
            "Bash(npm install:*)"
        );
        assert_eq!(
            generate_pattern("Bash", &json!({"command": "go test ./..."})),
            "Bash(go test:*)"
        );
    }

    #[test]
    fn file_tool_with_extension() {
        assert_eq!(
            generate_pattern("Write", &json!({"file_path": "src/x.py"})),
            "Write(*.py)"
        );
        assert_eq!(
            generate_pattern("Edit", &json!({"file_path": "/repo/a/b.rs"})),
            "Edit(*.rs)"
        );
    }

    #[test]
    fn file_tool_without_extension_uses_directory() {
        assert_eq!(
            generate_pattern("Write", &json!({"file_path": "/repo/src/LICENSE"})),
            "Write(/repo/src/*)"
        );
        assert_eq!(generate_pattern("Read", &json!({"file_path": "LICENSE"})), "Read(*)");
    }

    #[test]
    fn mcp_target_priority() {
        assert_eq!(
            generate_pattern(
                "mcp__browser__navigate",
                &json!({"url": "https://example.com", "query": "x"})
            ),
            "mcp__browser__navigate(https://example.com)"
        );
        assert_eq!(
            generate_pattern("mcp__fs__read", &json!({"path": "/tmp/a"})),
            "mcp__fs__read(/tmp/a)"
        );
        assert_eq!(
            generate_pattern("mcp__misc__tool", &json!({"other": 1})),
            "mcp__misc__tool(*)"
        );
    }

    #[test]
    fn generated_pattern_always_matches_its_input() {
        let cases: Vec<(&str, Value)> = vec![
            ("Bash", json!({"command": "git commit -m x"})),
            ("Bash", json!({"command": "rm -rf /"})),
            ("Write", json!({"file_path": "a/b/c.py"})),
            ("Edit", json!({"file_path": "/repo/src/noext"})),
            ("Read", json!({"file_path": "LICENSE"})),
            ("mcp__s__t", json!({"url": "https://x"})),
            ("mcp__s__t", json!({})),
            ("WebSearch", json!({"query": "rust"})),
        ];
        for (tool, input) in cases {
            let pattern = generate_pattern(tool, &input);
            assert!(
                match_pattern(&pattern, tool, &input),
                "{pattern} should match its own input"
            );
        }
    }

    #[test]
    fn bash_prefix_wildcard_matching() {
        let pattern = "Bash(git commit:*)";
        assert!(match_pattern(pattern, "Bash", &json!({"command": "git commit --amend"})));
        assert!(!match_pattern(pattern, "Bash", &json!({"command": "git push origin"})));
        assert!(!match_pattern(pattern, "Bash", &json!({"command": "git"})));
        assert!(!match_pattern(pattern, "Write", &json!({"file_path": "x.py"})));
    }

    #[test]
    fn file_suffix_and_directory_matching() {
        assert!(match_pattern("Write(*.py)", "Write", &json!({"file_path": "deep/dir/x.py"})));
        assert!(!match_pattern("Write(*.py)", "Write", &json!({"file_path": "x.rs"})));

        assert!(match_pattern("Edit(/repo/src/*)", "Edit", &json!({"file_path": "/repo/src/a/b.c"})));
        assert!(!match_pattern("Edit(/repo/src/*)", "Edit", &json!({"file_path": "/repo/other/x"})));
    }

    #[test]
    fn universal_wildcard() {
        assert!(match_pattern("Bash(*)", "Bash", &json!({"command": "anything at all"})));
        assert!(!match_pattern("Bash(*)", "Write", &json!({"file_path": "x"})));
    }

    #[test]
    fn malformed_patterns_never_match() {
        assert!(!match_pattern("Bash", "Bash", &json!({"command": "ls"})));
        assert!(!match_pattern("Bash(", "Bash", &json!({"command": "ls"})));
        assert!(!match_pattern("", "Bash", &json!({"command": "ls"})));
    }
}
