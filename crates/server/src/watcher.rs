//! Debounced repository file watcher.
//!
//! Raw notify events are filtered against the ignore list, coalesced per
//! path inside the debounce window (last kind wins), then published as
//! `file_changed` events and fed to the indexer. Bursts also schedule a
//! debounced `git_diff` event so subscribers see live diffs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{Event as NotifyEvent, EventKind as NotifyKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cdev_protocol::{EventKind, FileChangeKind};

use crate::config::WatcherConfig;
use crate::git::GitAdapter;
use crate::hub::EventHub;
use crate::indexer::Indexer;

const GIT_DIFF_DEBOUNCE: Duration = Duration::from_secs(2);

pub struct WatcherHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl WatcherHandle {
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Start watching `repo`. Runs until the handle is shut down.
pub fn start_watcher(
    repo: PathBuf,
    workspace_id: String,
    config: WatcherConfig,
    hub: EventHub,
    indexer: Indexer,
    git: std::sync::Arc<GitAdapter>,
) -> anyhow::Result<WatcherHandle> {
    let ignore_globs = build_globset(&config.ignore_globs)?;
    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<NotifyEvent>();
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| match res {
            Ok(event) => {
                let _ = raw_tx.send(event);
            }
            Err(err) => {
                warn!(
                    component = "watcher",
                    event = "watcher.fs_event_error",
                    error = %err,
                    "Filesystem event error"
                );
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(&repo, RecursiveMode::Recursive)?;

    info!(
        component = "watcher",
        event = "watcher.started",
        path = %repo.display(),
        debounce_ms = config.debounce_ms,
        "File watcher started"
    );

    tokio::spawn(run_loop(
        watcher,
        repo,
        workspace_id,
        config,
        ignore_globs,
        hub,
        indexer,
        git,
        raw_rx,
        shutdown_rx,
    ));

    Ok(WatcherHandle { shutdown_tx })
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    mut watcher: RecommendedWatcher,
    repo: PathBuf,
    workspace_id: String,
    config: WatcherConfig,
    ignore_globs: GlobSet,
    hub: EventHub,
    indexer: Indexer,
    git: std::sync::Arc<GitAdapter>,
    mut raw_rx: mpsc::UnboundedReceiver<NotifyEvent>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let debounce = Duration::from_millis(config.debounce_ms.max(1));
    let mut pending: HashMap<PathBuf, (FileChangeKind, Instant)> = HashMap::new();
    let mut diff_due: Option<Instant> = None;
    let mut tick = tokio::time::interval(Duration::from_millis(50));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                let _ = watcher.unwatch(&repo);
                info!(
                    component = "watcher",
                    event = "watcher.stopped",
                    "File watcher stopped"
                );
                return;
            }

            maybe_event = raw_rx.recv() => {
                let Some(event) = maybe_event else {
                    // Watcher backend died: try to re-register the root
                    // rather than tearing the session down.
                    warn!(
                        component = "watcher",
                        event = "watcher.channel_closed",
                        "Watcher channel closed, re-registering root"
                    );
                    if let Err(e) = watcher.watch(&repo, RecursiveMode::Recursive) {
                        warn!(
                            component = "watcher",
                            event = "watcher.rewatch_failed",
                            error = %e,
                            "Could not re-register watch root"
                        );
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                };

                let Some(kind) = map_kind(&event.kind) else { continue };
                let deadline = Instant::now() + debounce;
                for path in event.paths {
                    if is_ignored(&path, &repo, &config.ignore_dirs, &ignore_globs) {
                        continue;
                    }
                    // Coalesce: last kind within the window wins.
                    pending.insert(path, (kind, deadline));
                }
            }

            _ = tick.tick() => {
                let now = Instant::now();
                let due: Vec<(PathBuf, FileChangeKind)> = pending
                    .iter()
                    .filter(|(_, (_, deadline))| *deadline <= now)
                    .map(|(path, (kind, _))| (path.clone(), *kind))
                    .collect();
                for (path, kind) in due {
                    pending.remove(&path);
                    flush_change(&workspace_id, &hub, &indexer, &path, kind).await;
                    diff_due = Some(now + GIT_DIFF_DEBOUNCE);
                }

                if let Some(when) = diff_due {
                    if when <= now {
                        diff_due = None;
                        publish_diff(&workspace_id, &hub, &git, &repo).await;
                    }
                }
            }
        }
    }
}

async fn flush_change(
    workspace_id: &str,
    hub: &EventHub,
    indexer: &Indexer,
    path: &Path,
    kind: FileChangeKind,
) {
    let modified_at = std::fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok())
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());

    debug!(
        component = "watcher",
        event = "watcher.file_changed",
        path = %path.display(),
        kind = ?kind,
        "Publishing file change"
    );
    hub.publish(
        workspace_id,
        EventKind::FileChanged {
            path: path.to_string_lossy().into_owned(),
            change: kind,
            modified_at,
        },
    );

    let result = match kind {
        FileChangeKind::Remove => indexer.remove_file(path.to_path_buf()).await,
        _ => indexer.index_file(path.to_path_buf()).await,
    };
    if let Err(e) = result {
        debug!(
            component = "watcher",
            event = "watcher.index_update_failed",
            path = %path.display(),
            error = %e,
            "Incremental index update failed"
        );
    }
}

async fn publish_diff(
    workspace_id: &str,
    hub: &EventHub,
    git: &GitAdapter,
    repo: &Path,
) {
    match git.diff(repo, None).await {
        Ok(output) if !output.text.is_empty() => {
            hub.publish(
                workspace_id,
                EventKind::GitDiff {
                    diff: output.text,
                    truncated: output.truncated,
                },
            );
        }
        Ok(_) => {}
        Err(e) => debug!(
            component = "watcher",
            event = "watcher.git_diff_failed",
            error = %e,
            "Debounced git diff failed"
        ),
    }
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn map_kind(kind: &NotifyKind) -> Option<FileChangeKind> {
    match kind {
        NotifyKind::Create(_) => Some(FileChangeKind::Create),
        NotifyKind::Modify(notify::event::ModifyKind::Name(_)) => Some(FileChangeKind::Rename),
        NotifyKind::Modify(_) => Some(FileChangeKind::Write),
        NotifyKind::Remove(_) => Some(FileChangeKind::Remove),
        _ => None,
    }
}

fn is_ignored(path: &Path, repo: &Path, ignore_dirs: &[String], globs: &GlobSet) -> bool {
    let rel = path.strip_prefix(repo).unwrap_or(path);
    for component in rel.components() {
        if let std::path::Component::Normal(name) = component {
            let name = name.to_string_lossy();
            if ignore_dirs.iter().any(|d| d.as_str() == name) {
                return true;
            }
        }
    }
    globs.is_match(rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_dirs_match_any_component() {
        let repo = Path::new("/repo");
        let dirs = vec![".git".to_string(), "node_modules".to_string()];
        let globs = build_globset(&[]).unwrap();

        assert!(is_ignored(
            Path::new("/repo/.git/objects/ab"),
            repo,
            &dirs,
            &globs
        ));
        assert!(is_ignored(
            Path::new("/repo/pkg/node_modules/x/index.js"),
            repo,
            &dirs,
            &globs
        ));
        assert!(!is_ignored(Path::new("/repo/src/main.rs"), repo, &dirs, &globs));
    }

    #[test]
    fn glob_patterns_apply_to_relative_path() {
        let repo = Path::new("/repo");
        let globs = build_globset(&["*.log".to_string(), "tmp/**".to_string()]).unwrap();

        assert!(is_ignored(Path::new("/repo/build.log"), repo, &[], &globs));
        assert!(is_ignored(Path::new("/repo/tmp/scratch/x"), repo, &[], &globs));
        assert!(!is_ignored(Path::new("/repo/src/log.rs"), repo, &[], &globs));
    }

    #[test]
    fn kind_mapping() {
        use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
        assert_eq!(
            map_kind(&NotifyKind::Create(CreateKind::File)),
            Some(FileChangeKind::Create)
        );
        assert_eq!(
            map_kind(&NotifyKind::Modify(ModifyKind::Name(RenameMode::Any))),
            Some(FileChangeKind::Rename)
        );
        assert_eq!(
            map_kind(&NotifyKind::Remove(RemoveKind::File)),
            Some(FileChangeKind::Remove)
        );
        assert_eq!(map_kind(&NotifyKind::Access(notify::event::AccessKind::Any)), None);
    }
}
