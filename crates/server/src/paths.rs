//! Central path resolution for all cdev data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `CDEV_DATA_DIR` env >
//! `~/.cdev`. All callsites use these helpers instead of constructing
//! paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `CDEV_DATA_DIR` env > `~/.cdev` default.
/// Panics if no valid path can be resolved.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("CDEV_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .expect("HOME directory not found")
            .join(".cdev")
    };

    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory. Panics if `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .expect("DATA_DIR lock poisoned")
        .clone()
        .expect("data_dir() called before init_data_dir()")
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.yaml")
}

pub fn token_secret_path() -> PathBuf {
    data_dir().join("token_secret.json")
}

pub fn auth_registry_path() -> PathBuf {
    data_dir().join("auth_registry.json")
}

pub fn workspaces_path() -> PathBuf {
    data_dir().join("workspaces.yaml")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn pid_file_path() -> PathBuf {
    data_dir().join("cdev.pid")
}

/// Per-repo runtime directory (`<repo>/.cdev`).
pub fn repo_runtime_dir(repo: &Path) -> PathBuf {
    repo.join(".cdev")
}

/// Per-repo session transcript directory.
pub fn repo_log_dir(repo: &Path) -> PathBuf {
    repo_runtime_dir(repo).join("logs")
}

/// Per-repo image storage directory.
pub fn repo_images_dir(repo: &Path) -> PathBuf {
    repo_runtime_dir(repo).join("images")
}

/// Index database for a repository: one file per repo under the platform
/// temp directory, name derived by path-encoding the repo root so
/// distinct repos never collide.
pub fn index_db_path(repo: &Path) -> PathBuf {
    let encoded: String = repo
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    std::env::temp_dir().join(format!("cdev-index-{}.db", encoded.trim_matches('-')))
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}

/// Create the per-repo runtime directories.
pub fn ensure_repo_dirs(repo: &Path) -> io::Result<()> {
    std::fs::create_dir_all(repo_log_dir(repo))?;
    std::fs::create_dir_all(repo_images_dir(repo))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_db_path_is_stable_and_distinct() {
        let a = index_db_path(Path::new("/home/dev/proj-a"));
        let b = index_db_path(Path::new("/home/dev/proj-b"));
        assert_ne!(a, b);
        assert_eq!(a, index_db_path(Path::new("/home/dev/proj-a")));
        assert!(a
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("cdev-index-"));
    }
}
