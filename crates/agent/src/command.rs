//! Argument assembly for the agent CLI.

use cdev_protocol::LaunchMode;

/// Arguments always passed to the agent in headless mode.
const FIXED_ARGS: &[&str] = &["-p", "--verbose", "--output-format", "stream-json"];

/// Build the full argv (without the binary itself) for a session.
///
/// The fixed set is merged with `extra_args`, deduplicating by exact
/// string match so a user-supplied `--verbose` does not appear twice.
/// Mode flags follow, and the prompt is always the last positional
/// argument.
pub fn build_agent_args(
    mode: LaunchMode,
    session_id: Option<&str>,
    extra_args: &[String],
    prompt: &str,
) -> Vec<String> {
    let mut args: Vec<String> = FIXED_ARGS.iter().map(|s| s.to_string()).collect();

    for arg in extra_args {
        if !args.iter().any(|existing| existing == arg) {
            args.push(arg.clone());
        }
    }

    match mode {
        LaunchMode::New => {}
        LaunchMode::Continue => {
            args.push("--continue".to_string());
            if let Some(id) = session_id {
                args.push(id.to_string());
            }
        }
        LaunchMode::Resume => {
            args.push("--resume".to_string());
            if let Some(id) = session_id {
                args.push(id.to_string());
            }
        }
    }

    args.push(prompt.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_args_come_first_and_prompt_last() {
        let args = build_agent_args(LaunchMode::New, None, &[], "do the thing");
        assert_eq!(args[0], "-p");
        assert_eq!(args.last().unwrap(), "do the thing");
        assert!(args.contains(&"--output-format".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
    }

    #[test]
    fn user_args_deduplicate_by_exact_match() {
        let extra = vec!["--verbose".to_string(), "--model".to_string(), "opus".to_string()];
        let args = build_agent_args(LaunchMode::New, None, &extra, "hi");
        assert_eq!(args.iter().filter(|a| *a == "--verbose").count(), 1);
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"opus".to_string()));
    }

    #[test]
    fn resume_mode_passes_session_id() {
        let args = build_agent_args(LaunchMode::Resume, Some("sess-9"), &[], "hi");
        let pos = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[pos + 1], "sess-9");
    }

    #[test]
    fn continue_mode_flag() {
        let args = build_agent_args(LaunchMode::Continue, Some("sess-1"), &[], "hi");
        assert!(args.contains(&"--continue".to_string()));
    }
}
