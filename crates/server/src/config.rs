//! Daemon configuration.
//!
//! Loaded from `~/.cdev/config.yaml` (every section optional, serde
//! defaults fill the rest); CLI flags override individual fields in
//! `main`. Workspace definitions live in a separate `workspaces.yaml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub claude: ClaudeConfig,
    pub hooks: HooksConfig,
    pub events: EventsConfig,
    pub watcher: WatcherConfig,
    pub indexer: IndexerConfig,
    pub git: GitConfig,
    pub images: ImagesConfig,
    pub files: FilesConfig,
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public URL clients reach the daemon at; the WebSocket URL is
    /// derived from it (`https://` -> `wss://.../ws`).
    pub external_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            external_url: None,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_localhost_bind(&self) -> bool {
        matches!(self.host.as_str(), "127.0.0.1" | "::1" | "localhost")
    }

    /// HTTP base URL as seen by clients.
    pub fn http_url(&self) -> String {
        self.external_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }

    /// WebSocket URL derived from the external URL.
    pub fn ws_url(&self) -> String {
        let http = self.http_url();
        let ws = if let Some(rest) = http.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = http.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{http}")
        };
        format!("{}/ws", ws.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub require_auth: bool,
    pub allowed_origins: Vec<String>,
    /// CIDR blocks whose forwarded headers are trusted.
    pub trusted_proxies: Vec<String>,
    pub rate_limit: RateLimitConfig,
    pub pairing_ttl_secs: u64,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_auth: true,
            allowed_origins: Vec::new(),
            trusted_proxies: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            pairing_ttl_secs: 300,
            access_ttl_secs: 3600,
            refresh_ttl_secs: 30 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_requests: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeConfig {
    pub binary: PathBuf,
    /// Extra arguments merged into every launch.
    pub args: Vec<String>,
    pub max_line_bytes: usize,
    pub stop_grace_secs: u64,
    /// 0 disables the per-session timeout.
    pub session_timeout_secs: u64,
    pub headless: bool,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("claude"),
            args: Vec::new(),
            max_line_bytes: 1024 * 1024,
            stop_grace_secs: 5,
            session_timeout_secs: 0,
            headless: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub permission_timeout_secs: u64,
}

/// Per-request timeouts are clamped to this ceiling.
pub const PERMISSION_TIMEOUT_CEILING_SECS: u64 = 600;

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            permission_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub queue_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { queue_size: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub debounce_ms: u64,
    pub ignore_dirs: Vec<String>,
    pub ignore_globs: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            ignore_dirs: [
                ".git",
                "node_modules",
                "target",
                ".cdev",
                "dist",
                "build",
                "__pycache__",
                ".venv",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ignore_globs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub max_files: u64,
    pub max_total_bytes: u64,
    pub scan_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
    pub stats_ttl_secs: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_files: 100_000,
            max_total_bytes: 512 * 1024 * 1024,
            scan_timeout_secs: 120,
            reconcile_interval_secs: 600,
            stats_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub binary: PathBuf,
    pub max_output_kb: usize,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
            max_output_kb: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    pub max_file_bytes: u64,
    pub max_count: usize,
    pub max_total_bytes: u64,
    pub ttl_secs: u64,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 10 * 1024 * 1024,
            max_count: 100,
            max_total_bytes: 100 * 1024 * 1024,
            ttl_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub max_file_size_kb: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_file_size_kb: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_entries: usize,
    pub session_ttl_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            session_ttl_secs: 3600,
        }
    }
}

impl Config {
    /// Load from a YAML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config = serde_yaml::from_str(&contents)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}
