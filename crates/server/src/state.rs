//! Daemon state: the process-wide singletons, created at startup and
//! passed by reference (no globals).

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::git::GitAdapter;
use crate::hub::EventHub;
use crate::images::ImageStoreManager;
use crate::indexer::Indexer;
use crate::pairing::PairingManager;
use crate::paths;
use crate::permissions::PermissionBridge;
use crate::ratelimit::{ProxyTrust, RateLimiter};
use crate::registry::AuthRegistry;
use crate::sessions::SessionManager;
use crate::tokens::TokenManager;

/// A workspace definition from `workspaces.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceDef {
    pub id: String,
    pub path: PathBuf,
}

pub struct Daemon {
    pub config: Config,
    pub repo: PathBuf,
    pub workspace_id: String,
    pub workspaces: Vec<WorkspaceDef>,
    pub hub: EventHub,
    pub tokens: Arc<TokenManager>,
    pub pairing: Arc<PairingManager>,
    pub registry: Arc<AuthRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub proxy_trust: ProxyTrust,
    pub bridge: Arc<PermissionBridge>,
    pub sessions: SessionManager,
    pub indexer: Indexer,
    pub git: Arc<GitAdapter>,
    pub images: Arc<ImageStoreManager>,
    pub connected_clients: AtomicUsize,
}

pub type SharedState = Arc<Daemon>;

impl Daemon {
    /// Wire up every subsystem. Fatal errors here abort startup.
    pub fn build(config: Config, repo: PathBuf) -> anyhow::Result<SharedState> {
        let repo = repo.canonicalize()?;
        paths::ensure_repo_dirs(&repo)?;

        let workspace_id = workspace_id_for(&repo);
        let workspaces = load_workspaces(&paths::workspaces_path(), &workspace_id, &repo);

        let hub = EventHub::new(config.events.queue_size);

        let tokens = Arc::new(TokenManager::load_or_create(
            paths::token_secret_path(),
            Duration::from_secs(config.security.pairing_ttl_secs),
            Duration::from_secs(config.security.access_ttl_secs),
            Duration::from_secs(config.security.refresh_ttl_secs),
        )?);
        let pairing = Arc::new(PairingManager::new(hub.clone()));
        let registry = Arc::new(AuthRegistry::load_or_create(paths::auth_registry_path())?);

        let limiter = Arc::new(RateLimiter::new(
            Duration::from_secs(config.security.rate_limit.window_secs),
            config.security.rate_limit.max_requests,
        ));
        let proxy_trust = ProxyTrust::parse(&config.security.trusted_proxies);

        let bridge = Arc::new(PermissionBridge::new(
            hub.clone(),
            Duration::from_secs(config.hooks.permission_timeout_secs),
            config.memory.max_entries,
            Duration::from_secs(config.memory.session_ttl_secs),
        ));

        let sessions = SessionManager::new(
            workspace_id.clone(),
            repo.clone(),
            config.claude.clone(),
            hub.clone(),
        );

        let indexer = Indexer::open(
            &repo,
            &paths::index_db_path(&repo),
            config.indexer.clone(),
            config.watcher.ignore_dirs.clone(),
            config.git.binary.clone(),
            hub.clone(),
            workspace_id.clone(),
        )?;

        let git = Arc::new(GitAdapter::new(
            config.git.binary.clone(),
            config.git.max_output_kb,
        ));
        let images = Arc::new(ImageStoreManager::new(config.images.clone()));

        Ok(Arc::new(Self {
            config,
            repo,
            workspace_id,
            workspaces,
            hub,
            tokens,
            pairing,
            registry,
            limiter,
            proxy_trust,
            bridge,
            sessions,
            indexer,
            git,
            images,
            connected_clients: AtomicUsize::new(0),
        }))
    }
}

/// Workspace id for a repository root: its directory name.
pub fn workspace_id_for(repo: &Path) -> String {
    repo.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "default".to_string())
}

/// Load workspace definitions, ensuring the active repo is always
/// present (first).
fn load_workspaces(path: &Path, active_id: &str, active_repo: &Path) -> Vec<WorkspaceDef> {
    let mut defs: Vec<WorkspaceDef> = match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str(&contents) {
            Ok(defs) => defs,
            Err(e) => {
                warn!(
                    component = "state",
                    event = "state.workspaces_parse_failed",
                    path = %path.display(),
                    error = %e,
                    "Ignoring malformed workspaces.yaml"
                );
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    };

    if !defs.iter().any(|d| d.id == active_id) {
        defs.insert(
            0,
            WorkspaceDef {
                id: active_id.to_string(),
                path: active_repo.to_path_buf(),
            },
        );
    }
    defs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_id_is_repo_dir_name() {
        assert_eq!(workspace_id_for(Path::new("/home/dev/myproj")), "myproj");
    }

    #[test]
    fn load_workspaces_always_includes_active() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("workspaces.yaml");
        std::fs::write(&yaml, "- id: other\n  path: /tmp/other\n").unwrap();

        let defs = load_workspaces(&yaml, "mine", Path::new("/tmp/mine"));
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].id, "mine");

        let defs = load_workspaces(dir.path().join("missing.yaml").as_path(), "solo", Path::new("/x"));
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].id, "solo");
    }
}
