//! Device and workspace registry, persisted as one JSON document.
//!
//! Tracks which refresh nonce each paired device currently holds and
//! which devices are bound to which workspaces. Every mutation rewrites
//! the file atomically (`tmp + rename`).

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use cdev_protocol::now_rfc3339;

const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSession {
    pub device_id: String,
    pub refresh_nonce: String,
    pub refresh_expires_at: i64,
    pub access_nonce: String,
    pub access_expires_at: i64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryDoc {
    version: u32,
    devices: BTreeMap<String, DeviceSession>,
    /// workspace id -> bound device ids
    workspaces: BTreeMap<String, BTreeSet<String>>,
}

impl Default for RegistryDoc {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            devices: BTreeMap::new(),
            workspaces: BTreeMap::new(),
        }
    }
}

pub struct AuthRegistry {
    path: PathBuf,
    doc: Mutex<RegistryDoc>,
}

impl AuthRegistry {
    pub fn load_or_create(path: PathBuf) -> anyhow::Result<Self> {
        let doc = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryDoc::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    /// Register (or rotate) a device's nonces. Only the registered
    /// refresh nonce is accepted on refresh; rotation revokes the prior.
    pub fn register_device(
        &self,
        device_id: &str,
        refresh_nonce: &str,
        refresh_expires_at: i64,
        access_nonce: &str,
        access_expires_at: i64,
    ) -> anyhow::Result<()> {
        let mut doc = self.doc.lock().expect("registry poisoned");
        doc.devices.insert(
            device_id.to_string(),
            DeviceSession {
                device_id: device_id.to_string(),
                refresh_nonce: refresh_nonce.to_string(),
                refresh_expires_at,
                access_nonce: access_nonce.to_string(),
                access_expires_at,
                updated_at: now_rfc3339(),
            },
        );
        self.persist_locked(&doc)
    }

    /// Whether `nonce` is the device's currently registered refresh nonce.
    pub fn is_refresh_nonce_valid(&self, device_id: &str, nonce: &str) -> bool {
        let doc = self.doc.lock().expect("registry poisoned");
        doc.devices
            .get(device_id)
            .map(|d| d.refresh_nonce == nonce)
            .unwrap_or(false)
    }

    pub fn bind_workspace(&self, workspace_id: &str, device_id: &str) -> anyhow::Result<()> {
        let mut doc = self.doc.lock().expect("registry poisoned");
        doc.workspaces
            .entry(workspace_id.to_string())
            .or_default()
            .insert(device_id.to_string());
        self.persist_locked(&doc)
    }

    pub fn unbind_workspace(&self, workspace_id: &str, device_id: &str) -> anyhow::Result<()> {
        let mut doc = self.doc.lock().expect("registry poisoned");
        if let Some(devices) = doc.workspaces.get_mut(workspace_id) {
            devices.remove(device_id);
            if devices.is_empty() {
                doc.workspaces.remove(workspace_id);
            }
        }
        self.persist_locked(&doc)
    }

    /// Remove a device. Returns the workspaces left with no bound
    /// devices so the caller can decide whether to purge related state.
    pub fn remove_device(&self, device_id: &str) -> anyhow::Result<Vec<String>> {
        let mut doc = self.doc.lock().expect("registry poisoned");
        doc.devices.remove(device_id);

        let mut orphaned = Vec::new();
        doc.workspaces.retain(|workspace_id, devices| {
            devices.remove(device_id);
            if devices.is_empty() {
                orphaned.push(workspace_id.clone());
                false
            } else {
                true
            }
        });
        self.persist_locked(&doc)?;

        if !orphaned.is_empty() {
            info!(
                component = "registry",
                event = "registry.workspaces_orphaned",
                device_id = %device_id,
                orphaned = orphaned.len(),
                "Workspaces left without bound devices"
            );
        }
        Ok(orphaned)
    }

    /// Drop devices whose refresh token has expired. Returns orphaned
    /// workspaces, as with `remove_device`.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<String>> {
        let cutoff = now.timestamp();
        let mut doc = self.doc.lock().expect("registry poisoned");

        let expired: Vec<String> = doc
            .devices
            .values()
            .filter(|d| d.refresh_expires_at < cutoff)
            .map(|d| d.device_id.clone())
            .collect();
        for device_id in &expired {
            doc.devices.remove(device_id);
        }

        let mut orphaned = Vec::new();
        doc.workspaces.retain(|workspace_id, devices| {
            for device_id in &expired {
                devices.remove(device_id);
            }
            if devices.is_empty() {
                orphaned.push(workspace_id.clone());
                false
            } else {
                true
            }
        });
        self.persist_locked(&doc)?;
        Ok(orphaned)
    }

    pub fn device_count(&self) -> usize {
        self.doc.lock().expect("registry poisoned").devices.len()
    }

    fn persist_locked(&self, doc: &RegistryDoc) -> anyhow::Result<()> {
        let contents = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &contents)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &tempfile::TempDir) -> AuthRegistry {
        AuthRegistry::load_or_create(dir.path().join("auth_registry.json")).unwrap()
    }

    #[test]
    fn register_and_rotate_refresh_nonce() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);

        reg.register_device("dev-1", "nonce-a", 9999999999, "acc-a", 9999999999)
            .unwrap();
        assert!(reg.is_refresh_nonce_valid("dev-1", "nonce-a"));

        reg.register_device("dev-1", "nonce-b", 9999999999, "acc-b", 9999999999)
            .unwrap();
        assert!(!reg.is_refresh_nonce_valid("dev-1", "nonce-a"));
        assert!(reg.is_refresh_nonce_valid("dev-1", "nonce-b"));
    }

    #[test]
    fn remove_device_reports_orphaned_workspaces() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);

        reg.register_device("dev-1", "n1", 9999999999, "a1", 9999999999)
            .unwrap();
        reg.register_device("dev-2", "n2", 9999999999, "a2", 9999999999)
            .unwrap();
        reg.bind_workspace("ws-solo", "dev-1").unwrap();
        reg.bind_workspace("ws-shared", "dev-1").unwrap();
        reg.bind_workspace("ws-shared", "dev-2").unwrap();

        let orphaned = reg.remove_device("dev-1").unwrap();
        assert_eq!(orphaned, vec!["ws-solo".to_string()]);
        assert!(reg.is_refresh_nonce_valid("dev-2", "n2"));
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = registry(&dir);
            reg.register_device("dev-1", "n1", 9999999999, "a1", 9999999999)
                .unwrap();
            reg.bind_workspace("ws-1", "dev-1").unwrap();
        }
        let reg = registry(&dir);
        assert!(reg.is_refresh_nonce_valid("dev-1", "n1"));
        assert_eq!(reg.device_count(), 1);
    }

    #[test]
    fn prune_expired_devices() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);

        reg.register_device("old", "n-old", 100, "a-old", 100).unwrap();
        reg.register_device("new", "n-new", i64::MAX, "a-new", i64::MAX)
            .unwrap();
        reg.bind_workspace("ws-old", "old").unwrap();

        let orphaned = reg.prune_expired(Utc::now()).unwrap();
        assert_eq!(orphaned, vec!["ws-old".to_string()]);
        assert_eq!(reg.device_count(), 1);
        assert!(!reg.is_refresh_nonce_valid("old", "n-old"));
    }

    #[test]
    fn unknown_device_nonce_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        assert!(!reg.is_refresh_nonce_valid("ghost", "nonce"));
    }
}
