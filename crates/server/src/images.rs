//! Per-workspace image storage with content-hash deduplication and TTL.
//!
//! Files live under `<repo>/.cdev/images/` as `img_<id>.<ext>` where the
//! id is the first 16 hex chars of the content SHA-256. Uploads are
//! validated against magic bytes, written atomically (`tmp` + rename)
//! and expire after a TTL that refreshes on access (tracked via file
//! mtime). Under pressure, LRU eviction runs before "storage full" is
//! reported.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use ring::digest::{digest, SHA256};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ImagesConfig;
use crate::indexer::hex_encode;

const ID_LEN: usize = 16;
const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "png", "gif", "webp"];

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("unsupported image format")]
    UnsupportedFormat,
    #[error("image exceeds {max} bytes")]
    TooLarge { max: u64 },
    #[error("image storage full")]
    StorageFull,
    #[error("image not found")]
    NotFound,
    #[error("invalid image path: {0}")]
    InvalidPath(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub id: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub expires_at: SystemTime,
    pub deduplicated: bool,
}

pub struct ImageStore {
    dir: PathBuf,
    config: ImagesConfig,
}

impl ImageStore {
    pub fn new(dir: PathBuf, config: ImagesConfig) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, config })
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    /// Store an uploaded image. Re-uploads of identical content return
    /// the existing id with a refreshed expiry.
    pub fn store(&self, bytes: &[u8]) -> Result<StoredImage, ImageError> {
        let ext = detect_format(bytes).ok_or(ImageError::UnsupportedFormat)?;
        if bytes.len() as u64 > self.config.max_file_bytes {
            return Err(ImageError::TooLarge {
                max: self.config.max_file_bytes,
            });
        }

        let hash = hex_encode(digest(&SHA256, bytes).as_ref());
        let id = hash[..ID_LEN].to_string();
        let file_name = format!("img_{id}.{ext}");
        let path = self.dir.join(&file_name);

        if path.exists() {
            self.touch(&path);
            debug!(
                component = "images",
                event = "images.dedup_hit",
                id = %id,
                "Upload matched existing image by content hash"
            );
            return Ok(StoredImage {
                id,
                path,
                bytes: bytes.len() as u64,
                expires_at: SystemTime::now() + self.ttl(),
                deduplicated: true,
            });
        }

        self.make_room(bytes.len() as u64)?;

        let tmp = self.dir.join(format!("{file_name}.tmp"));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;

        info!(
            component = "images",
            event = "images.stored",
            id = %id,
            bytes = bytes.len(),
            "Image stored"
        );
        Ok(StoredImage {
            id,
            path,
            bytes: bytes.len() as u64,
            expires_at: SystemTime::now() + self.ttl(),
            deduplicated: false,
        })
    }

    /// Fetch by id, refreshing the TTL.
    pub fn get(&self, id: &str) -> Result<(PathBuf, Vec<u8>), ImageError> {
        let path = self.find(id)?;
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            return Err(ImageError::InvalidPath("symlink refused".into()));
        }
        let bytes = std::fs::read(&path)?;
        self.touch(&path);
        Ok((path, bytes))
    }

    pub fn delete(&self, id: &str) -> Result<(), ImageError> {
        let path = self.find(id)?;
        std::fs::remove_file(&path)?;
        Ok(())
    }

    /// Remove expired images. Called by the background sweep.
    pub fn sweep_expired(&self) {
        let now = SystemTime::now();
        let ttl = self.ttl();
        let mut removed = 0usize;
        for entry in self.entries() {
            if let Ok(meta) = entry.metadata() {
                let expired = meta
                    .modified()
                    .map(|m| m + ttl < now)
                    .unwrap_or(false);
                if expired && std::fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(
                component = "images",
                event = "images.swept",
                removed = removed,
                "Removed expired images"
            );
        }
    }

    /// Validate an id and resolve it to an existing file.
    fn find(&self, id: &str) -> Result<PathBuf, ImageError> {
        if id.is_empty()
            || id.len() > ID_LEN
            || !id.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(ImageError::InvalidPath(id.to_string()));
        }
        for ext in SUPPORTED_EXTENSIONS {
            let path = self.dir.join(format!("img_{id}.{ext}"));
            if path.exists() {
                return Ok(path);
            }
        }
        Err(ImageError::NotFound)
    }

    /// Enforce count/total-byte caps: expired files go first, then LRU
    /// (oldest mtime). Only when eviction cannot make room is
    /// `StorageFull` reported.
    fn make_room(&self, incoming: u64) -> Result<(), ImageError> {
        if incoming > self.config.max_total_bytes {
            return Err(ImageError::StorageFull);
        }
        self.sweep_expired();

        loop {
            let mut total: u64 = 0;
            let mut files: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
            for entry in self.entries() {
                if let Ok(meta) = entry.metadata() {
                    total += meta.len();
                    files.push((
                        entry.path(),
                        meta.len(),
                        meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    ));
                }
            }

            let over_count = files.len() >= self.config.max_count;
            let over_bytes = total + incoming > self.config.max_total_bytes;
            if !over_count && !over_bytes {
                return Ok(());
            }

            // Evict the least recently used.
            files.sort_by_key(|(_, _, mtime)| *mtime);
            let Some((victim, _, _)) = files.first() else {
                return Err(ImageError::StorageFull);
            };
            if std::fs::remove_file(victim).is_err() {
                return Err(ImageError::StorageFull);
            }
            warn!(
                component = "images",
                event = "images.evicted",
                path = %victim.display(),
                "Evicted image under storage pressure"
            );
        }
    }

    fn entries(&self) -> Vec<std::fs::DirEntry> {
        std::fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| {
                        e.file_name().to_string_lossy().starts_with("img_")
                            && !e.file_name().to_string_lossy().ends_with(".tmp")
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn touch(&self, path: &Path) {
        if let Ok(file) = std::fs::OpenOptions::new().write(true).open(path) {
            let _ = file.set_modified(SystemTime::now());
        }
    }
}

/// Detect a supported format from magic bytes. WebP additionally
/// requires the `WEBP` tag at offset 8.
pub fn detect_format(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() < 12 {
        return None;
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("jpg");
    }
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        return Some("png");
    }
    if bytes.starts_with(b"GIF8") {
        return Some("gif");
    }
    if bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        return Some("webp");
    }
    None
}

/// Lazily instantiates one [`ImageStore`] per workspace.
pub struct ImageStoreManager {
    config: ImagesConfig,
    stores: DashMap<String, Arc<ImageStore>>,
}

impl ImageStoreManager {
    pub fn new(config: ImagesConfig) -> Self {
        Self {
            config,
            stores: DashMap::new(),
        }
    }

    pub fn store_for(
        &self,
        workspace_id: &str,
        images_dir: PathBuf,
    ) -> std::io::Result<Arc<ImageStore>> {
        if let Some(store) = self.stores.get(workspace_id) {
            return Ok(store.clone());
        }
        let store = Arc::new(ImageStore::new(images_dir, self.config.clone())?);
        self.stores.insert(workspace_id.to_string(), store.clone());
        Ok(store)
    }

    pub fn sweep_all(&self) {
        for entry in self.stores.iter() {
            entry.value().sweep_expired();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(filler: u8) -> Vec<u8> {
        let mut bytes = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(&[filler; 16]);
        bytes
    }

    fn store(dir: &Path, config: ImagesConfig) -> ImageStore {
        ImageStore::new(dir.join("images"), config).unwrap()
    }

    #[test]
    fn magic_byte_detection() {
        assert_eq!(detect_format(&png(0)), Some("png"));
        assert_eq!(
            detect_format(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Some("jpg")
        );
        assert_eq!(detect_format(b"GIF89a\x00\x00\x00\x00\x00\x00"), Some("gif"));

        let mut webp = b"RIFF\x00\x00\x00\x00WEBP".to_vec();
        webp.extend_from_slice(&[0; 4]);
        assert_eq!(detect_format(&webp), Some("webp"));

        // RIFF without the WEBP tag is not an image.
        assert_eq!(detect_format(b"RIFF\x00\x00\x00\x00WAVEfmt "), None);
        assert_eq!(detect_format(b"plain text here"), None);
        assert_eq!(detect_format(&[]), None);
    }

    #[test]
    fn store_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), ImagesConfig::default());

        let first = store.store(&png(1)).unwrap();
        assert!(!first.deduplicated);
        assert!(first.path.exists());

        let second = store.store(&png(1)).unwrap();
        assert!(second.deduplicated);
        assert_eq!(first.id, second.id);

        let third = store.store(&png(2)).unwrap();
        assert_ne!(first.id, third.id);
    }

    #[test]
    fn get_and_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), ImagesConfig::default());

        let stored = store.store(&png(1)).unwrap();
        let (_, bytes) = store.get(&stored.id).unwrap();
        assert_eq!(bytes, png(1));

        store.delete(&stored.id).unwrap();
        assert!(matches!(store.get(&stored.id), Err(ImageError::NotFound)));
    }

    #[test]
    fn rejects_bad_ids_and_formats() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), ImagesConfig::default());

        assert!(matches!(
            store.get("../escape"),
            Err(ImageError::InvalidPath(_))
        ));
        assert!(matches!(store.get(""), Err(ImageError::InvalidPath(_))));
        assert!(matches!(
            store.store(b"not an image at all"),
            Err(ImageError::UnsupportedFormat)
        ));
    }

    #[test]
    fn per_file_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ImagesConfig::default();
        config.max_file_bytes = 10;
        let store = store(dir.path(), config);

        assert!(matches!(
            store.store(&png(1)),
            Err(ImageError::TooLarge { max: 10 })
        ));
    }

    #[test]
    fn lru_eviction_under_count_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ImagesConfig::default();
        config.max_count = 2;
        let store = store(dir.path(), config);

        let a = store.store(&png(1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let b = store.store(&png(2)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        // Third upload evicts the oldest (a) instead of failing.
        let c = store.store(&png(3)).unwrap();

        assert!(matches!(store.get(&a.id), Err(ImageError::NotFound)));
        assert!(store.get(&b.id).is_ok());
        assert!(store.get(&c.id).is_ok());
    }

    #[test]
    fn sweep_removes_expired() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ImagesConfig::default();
        config.ttl_secs = 0;
        let store = store(dir.path(), config);

        let stored = store.store(&png(1)).unwrap();
        store.sweep_expired();
        assert!(matches!(store.get(&stored.id), Err(ImageError::NotFound)));
    }

    #[test]
    fn manager_instantiates_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ImageStoreManager::new(ImagesConfig::default());

        let a = manager
            .store_for("ws-a", dir.path().join("a/images"))
            .unwrap();
        let a_again = manager
            .store_for("ws-a", dir.path().join("a/images"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &a_again));
        assert!(dir.path().join("a/images").exists());
    }
}
