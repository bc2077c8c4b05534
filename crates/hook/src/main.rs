//! cdev permission hook
//!
//! The coding agent invokes this binary once per tool use, passing a JSON
//! object on stdin. It forwards that object to the local cdev daemon and
//! writes the daemon's decision to stdout as
//! `{"hookSpecificOutput":{"permissionDecision": ...}}`.
//!
//! If the daemon is unreachable or anything goes wrong, the hook exits 0
//! with no output so the agent falls back to its own permission UI.

use std::io::Read;
use std::time::Duration;

use cdev_protocol::HookOutput;

/// Longest we will wait for a human decision before going silent.
/// The daemon applies its own (shorter, configurable) timeout and
/// answers `ask` on expiry; this is a transport-level backstop.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Never fail loudly: a hook error must not break the agent.
    if let Some(output) = run().await {
        if let Ok(json) = serde_json::to_string(&output) {
            println!("{json}");
        }
    }
}

async fn run() -> Option<HookOutput> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input).ok()?;
    let payload: serde_json::Value = serde_json::from_str(&input).ok()?;

    let base_url = std::env::var("CDEV_SERVER_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8787".to_string());
    let url = format!("{}/api/hooks/permission-request", base_url.trim_end_matches('/'));

    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .ok()?;

    let mut request = client.post(&url).json(&payload);
    if let Ok(token) = std::env::var("CDEV_HOOK_TOKEN") {
        if !token.is_empty() {
            request = request.header("X-Cdev-Token", token);
        }
    }

    let response = request.send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json::<HookOutput>().await.ok()
}
