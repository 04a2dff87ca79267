use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use beacon_core::error::RegistryError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Default path for the read-only mount document (matches the ConfigMap
/// path the original daemon expected).
pub const DEFAULT_MOUNT_PATH: &str = "/etc/traffic-monitor/service_config.json";

/// Default path for the writable overlay document.
pub const DEFAULT_OVERLAY_PATH: &str = "/tmp/traffic-monitor-service-config.json";

/// Default control-plane base URL, used when the mount document omits
/// `apisecUrl`.
pub const DEFAULT_APISEC_URL: &str = "https://api.apisecapps.com";

/// One service's persisted mapping to an inventory application + instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMapping {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "instanceId")]
    pub instance_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MountDocument {
    #[serde(default, rename = "apiKey")]
    api_key: Option<String>,
    #[serde(default, rename = "autoOnboardNewServices")]
    auto_onboard: bool,
    #[serde(default, rename = "apisecUrl")]
    apisec_url: Option<String>,
    #[serde(default, rename = "serviceMappings")]
    service_mappings: HashMap<String, ServiceMapping>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OverlayDocument {
    #[serde(default, rename = "serviceMappings")]
    service_mappings: HashMap<String, ServiceMapping>,
}

/// Resolved, read-only snapshot of the registry as of the last reload.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub api_key: Option<String>,
    pub auto_onboard: bool,
    pub apisec_url: String,
    mappings: HashMap<String, ServiceMapping>,
}

impl RegistrySnapshot {
    pub fn mapping(&self, service: &str) -> Option<&ServiceMapping> {
        self.mappings.get(service)
    }
}

/// Merges a read-only mount document with a writable overlay. Every read
/// re-parses both files from disk so that a mapping written by one worker
/// process becomes visible to others without a restart; writes only ever
/// touch the overlay, and a malformed overlay is rotated aside rather than
/// treated as fatal.
pub struct ServiceRegistry {
    mount_path: PathBuf,
    overlay_path: PathBuf,
    // Serializes overlay writes; reads take this only to swap the cached
    // snapshot, never to block a concurrent reader for long.
    state: Mutex<()>,
}

impl ServiceRegistry {
    pub fn new(mount_path: impl Into<PathBuf>, overlay_path: impl Into<PathBuf>) -> Self {
        Self {
            mount_path: mount_path.into(),
            overlay_path: overlay_path.into(),
            state: Mutex::new(()),
        }
    }

    /// Re-read both documents from disk and return the merged view. Call
    /// this on every mapping lookup, not just at startup.
    pub fn reload(&self) -> Result<RegistrySnapshot, RegistryError> {
        let _guard = self.state.lock().expect("registry mutex poisoned");

        let mount = self.read_mount()?;
        let overlay = self.read_overlay();

        let mut mappings = mount.service_mappings.clone();
        mappings.extend(overlay.service_mappings);

        Ok(RegistrySnapshot {
            api_key: mount.api_key.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string),
            auto_onboard: mount.auto_onboard,
            apisec_url: mount.apisec_url.unwrap_or_else(|| DEFAULT_APISEC_URL.to_string()),
            mappings,
        })
    }

    fn read_mount(&self) -> Result<MountDocument, RegistryError> {
        if !self.mount_path.exists() {
            return Ok(MountDocument::default());
        }
        let text = std::fs::read_to_string(&self.mount_path).map_err(|source| RegistryError::Read {
            path: self.mount_path.display().to_string(),
            source,
        })?;
        match serde_json::from_str(&text) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                warn!(path = %self.mount_path.display(), error = %e, "malformed mount config; disabling integration");
                Ok(MountDocument::default())
            }
        }
    }

    /// Never fails: a missing overlay is empty, a malformed one is rotated
    /// aside and treated as empty.
    fn read_overlay(&self) -> OverlayDocument {
        if !self.overlay_path.exists() {
            return OverlayDocument::default();
        }
        let text = match std::fs::read_to_string(&self.overlay_path) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %self.overlay_path.display(), error = %e, "failed to read overlay");
                return OverlayDocument::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %self.overlay_path.display(), error = %e, "corrupt overlay json, backing up and resetting");
                self.backup_overlay();
                OverlayDocument::default()
            }
        }
    }

    fn backup_overlay(&self) {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let backup = self.overlay_path.with_extension(format!("backup.{stamp}"));
        if let Err(e) = std::fs::rename(&self.overlay_path, &backup) {
            warn!(error = %e, "could not back up corrupted overlay");
        } else {
            info!(backup = %backup.display(), "backed up corrupted overlay");
        }
    }

    /// Persist a new mapping to the overlay. Never overwrites an existing
    /// one; callers that raced to onboard the same service must coordinate
    /// before calling this (see `beacon-onboard`'s per-service mutex).
    pub fn set_mapping(&self, service: &str, mapping: ServiceMapping) -> Result<(), RegistryError> {
        let _guard = self.state.lock().expect("registry mutex poisoned");

        let mut overlay = self.read_overlay_locked();
        if overlay.service_mappings.contains_key(service) {
            info!(service, "mapping already persisted; not overwriting");
            return Ok(());
        }
        overlay.service_mappings.insert(service.to_string(), mapping);
        self.write_overlay(&overlay)
    }

    fn read_overlay_locked(&self) -> OverlayDocument {
        self.read_overlay()
    }

    fn write_overlay(&self, doc: &OverlayDocument) -> Result<(), RegistryError> {
        if let Some(parent) = self.overlay_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let text = serde_json::to_string_pretty(doc).expect("overlay document is always serializable");
        std::fs::write(&self.overlay_path, text).map_err(|source| RegistryError::Write {
            path: self.overlay_path.display().to_string(),
            source,
        })
    }

    /// Back up and erase the overlay, used at startup when
    /// `CLEAR_SAVED_MAPPINGS=true` requests a forced re-onboard.
    pub fn clear_mappings(&self) -> Result<(), RegistryError> {
        let _guard = self.state.lock().expect("registry mutex poisoned");
        if self.overlay_path.exists() {
            self.backup_overlay();
        }
        self.write_overlay(&OverlayDocument::default())
    }

    pub fn overlay_path(&self) -> &Path {
        &self.overlay_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry(dir: &tempfile::TempDir) -> (ServiceRegistry, PathBuf, PathBuf) {
        let mount = dir.path().join("mount.json");
        let overlay = dir.path().join("overlay.json");
        (ServiceRegistry::new(&mount, &overlay), mount, overlay)
    }

    #[test]
    fn missing_files_yield_empty_defaults() {
        let dir = tempdir().unwrap();
        let (registry, _, _) = registry(&dir);
        let snap = registry.reload().unwrap();
        assert_eq!(snap.api_key, None);
        assert!(!snap.auto_onboard);
        assert_eq!(snap.apisec_url, DEFAULT_APISEC_URL);
    }

    #[test]
    fn mount_provides_api_key_and_flag() {
        let dir = tempdir().unwrap();
        let (registry, mount, _) = registry(&dir);
        std::fs::write(
            &mount,
            r#"{"apiKey":"  K123  ","autoOnboardNewServices":true,"serviceMappings":{}}"#,
        )
        .unwrap();
        let snap = registry.reload().unwrap();
        assert_eq!(snap.api_key.as_deref(), Some("K123"));
        assert!(snap.auto_onboard);
    }

    #[test]
    fn overlay_mapping_wins_over_mount_mapping() {
        let dir = tempdir().unwrap();
        let (registry, mount, overlay) = registry(&dir);
        std::fs::write(
            &mount,
            r#"{"serviceMappings":{"orders":{"appId":"A-mount","instanceId":"I-mount"}}}"#,
        )
        .unwrap();
        std::fs::write(
            &overlay,
            r#"{"serviceMappings":{"orders":{"appId":"A-overlay","instanceId":"I-overlay"}}}"#,
        )
        .unwrap();
        let snap = registry.reload().unwrap();
        assert_eq!(snap.mapping("orders").unwrap().app_id, "A-overlay");
    }

    #[test]
    fn set_mapping_persists_to_overlay_only() {
        let dir = tempdir().unwrap();
        let (registry, _, overlay) = registry(&dir);
        registry
            .set_mapping(
                "billing",
                ServiceMapping {
                    app_id: "A1".to_string(),
                    instance_id: "I1".to_string(),
                },
            )
            .unwrap();
        assert!(overlay.exists());
        let snap = registry.reload().unwrap();
        assert_eq!(snap.mapping("billing").unwrap().instance_id, "I1");
    }

    #[test]
    fn set_mapping_never_overwrites_existing() {
        let dir = tempdir().unwrap();
        let (registry, _, _) = registry(&dir);
        registry
            .set_mapping("billing", ServiceMapping { app_id: "A1".into(), instance_id: "I1".into() })
            .unwrap();
        registry
            .set_mapping("billing", ServiceMapping { app_id: "A2".into(), instance_id: "I2".into() })
            .unwrap();
        let snap = registry.reload().unwrap();
        assert_eq!(snap.mapping("billing").unwrap().app_id, "A1");
    }

    #[test]
    fn malformed_overlay_is_backed_up_and_treated_as_empty() {
        let dir = tempdir().unwrap();
        let (registry, _, overlay) = registry(&dir);
        std::fs::write(&overlay, "{not json").unwrap();
        let snap = registry.reload().unwrap();
        assert!(snap.mapping("anything").is_none());

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn clear_mappings_empties_overlay() {
        let dir = tempdir().unwrap();
        let (registry, _, _) = registry(&dir);
        registry
            .set_mapping("billing", ServiceMapping { app_id: "A1".into(), instance_id: "I1".into() })
            .unwrap();
        registry.clear_mappings().unwrap();
        let snap = registry.reload().unwrap();
        assert!(snap.mapping("billing").is_none());
    }
}
