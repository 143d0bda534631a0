//! VM configuration: validation, patch algebra, persistence.
//!
//! The shapes ([`VmConfig`], [`VmConfigPatch`]) live in `gateway-protocol`
//! because the supervisor speaks them over the control RPC. This module owns
//! the semantics: defaults derived from the host, validation (`cpu` clamped
//! to `[1, host_cpus]`, proxy URL scheme check), `diff`/`apply`, and
//! persistence of only the fields differing from defaults.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use gateway_protocol::{NetworkProxy, StateFile, VmConfig, VmConfigPatch};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Default guest memory when the user has not chosen one.
const DEFAULT_MEMORY_MIB: u32 = 4096;

/// Lower bound the guest can boot with.
const MIN_MEMORY_MIB: u32 = 256;

pub fn host_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Build the default config for this host.
pub fn default_config() -> VmConfig {
    VmConfig {
        memory_mib: DEFAULT_MEMORY_MIB,
        cpu: host_cpus(),
        rosetta: false,
        network_proxy: NetworkProxy::Auto,
        mount_hide_shared: false,
    }
}

/// Validate a candidate config: cpu counts clamp to the host, proxy URLs
/// and memory bounds reject.
pub fn validate(config: &mut VmConfig) -> Result<()> {
    if config.memory_mib < MIN_MEMORY_MIB {
        return Err(Error::Config(format!(
            "memory_mib {} below minimum {}",
            config.memory_mib, MIN_MEMORY_MIB
        )));
    }
    config.cpu = config.cpu.clamp(1, host_cpus());
    if let NetworkProxy::Url(url) = &config.network_proxy {
        // Re-parse through the shared grammar; rejects paths and odd schemes.
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid proxy url '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https" | "socks5") {
            return Err(Error::Config(format!(
                "unsupported proxy scheme '{}'",
                parsed.scheme()
            )));
        }
        if parsed.path() != "" && parsed.path() != "/" {
            return Err(Error::Config(format!(
                "proxy url '{}' must not carry a path",
                url
            )));
        }
        if parsed.host_str().is_none() {
            return Err(Error::Config(format!("proxy url '{}' has no host", url)));
        }
    }
    Ok(())
}

/// Fields of `b` that differ from `a`. `diff(a, a)` is empty.
pub fn diff(a: &VmConfig, b: &VmConfig) -> VmConfigPatch {
    VmConfigPatch {
        memory_mib: (a.memory_mib != b.memory_mib).then_some(b.memory_mib),
        cpu: (a.cpu != b.cpu).then_some(b.cpu),
        rosetta: (a.rosetta != b.rosetta).then_some(b.rosetta),
        network_proxy: (a.network_proxy != b.network_proxy)
            .then(|| b.network_proxy.clone()),
        mount_hide_shared: (a.mount_hide_shared != b.mount_hide_shared)
            .then_some(b.mount_hide_shared),
    }
}

/// Merge a patch into a config. `apply(a, diff(a, b)) == b`;
/// `apply(a, empty) == a`.
pub fn apply(config: &VmConfig, patch: &VmConfigPatch) -> VmConfig {
    VmConfig {
        memory_mib: patch.memory_mib.unwrap_or(config.memory_mib),
        cpu: patch.cpu.unwrap_or(config.cpu),
        rosetta: patch.rosetta.unwrap_or(config.rosetta),
        network_proxy: patch
            .network_proxy
            .clone()
            .unwrap_or_else(|| config.network_proxy.clone()),
        mount_hide_shared: patch
            .mount_hide_shared
            .unwrap_or(config.mount_hide_shared),
    }
}

/// Long-lived config service: owns the current value, persists non-default
/// fields, broadcasts applied patches to subscribers (proxy manager, VM
/// sizing, mount layer).
pub struct ConfigStore {
    config_path: PathBuf,
    state_path: PathBuf,
    current: Mutex<VmConfig>,
    changes: broadcast::Sender<VmConfigPatch>,
}

impl ConfigStore {
    /// Load from disk, falling back to defaults when the file is absent.
    /// The state file gates loading: a newer version or a foreign arch
    /// refuses to load rather than corrupt.
    pub fn open(config_path: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();
        let state_path = state_path.into();

        if state_path.exists() {
            let raw = std::fs::read_to_string(&state_path)?;
            let state: StateFile = serde_json::from_str(&raw)?;
            if !state.compatible() {
                return Err(Error::Config(format!(
                    "state file version {} arch {} is not loadable by this build",
                    state.version, state.arch
                )));
            }
        }

        let mut current = default_config();
        if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)?;
            let patch: VmConfigPatch = serde_json::from_str(&raw)?;
            current = apply(&current, &patch);
            validate(&mut current)?;
            debug!(path = %config_path.display(), "loaded persisted config");
        }

        let (changes, _) = broadcast::channel(16);
        Ok(Self {
            config_path,
            state_path,
            current: Mutex::new(current),
            changes,
        })
    }

    /// In-memory store for tests and embedded use; never touches disk paths
    /// that exist.
    pub fn ephemeral(dir: &Path) -> Result<Self> {
        Self::open(dir.join("config.json"), dir.join("state.json"))
    }

    pub fn get(&self) -> VmConfig {
        self.current.lock().expect("config lock poisoned").clone()
    }

    /// Validate and merge a patch, persist, and broadcast the applied diff.
    /// Returns the new config.
    pub fn patch(&self, patch: &VmConfigPatch) -> Result<VmConfig> {
        let mut guard = self.current.lock().expect("config lock poisoned");
        let mut candidate = apply(&guard, patch);
        validate(&mut candidate)?;
        let applied = diff(&guard, &candidate);
        *guard = candidate.clone();
        drop(guard);

        self.persist(&candidate)?;
        if !applied.is_empty() {
            let _ = self.changes.send(applied);
        }
        Ok(candidate)
    }

    /// Reset to host defaults, removing the persisted file.
    pub fn reset(&self) -> Result<VmConfig> {
        let fresh = default_config();
        let applied = {
            let mut guard = self.current.lock().expect("config lock poisoned");
            let applied = diff(&guard, &fresh);
            *guard = fresh.clone();
            applied
        };
        if self.config_path.exists() {
            std::fs::remove_file(&self.config_path)?;
        }
        if !applied.is_empty() {
            let _ = self.changes.send(applied);
        }
        Ok(fresh)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VmConfigPatch> {
        self.changes.subscribe()
    }

    fn persist(&self, config: &VmConfig) -> Result<()> {
        let non_default = diff(&default_config(), config);
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &self.config_path,
            serde_json::to_string_pretty(&non_default)?,
        )?;
        if let Err(e) = std::fs::write(
            &self.state_path,
            serde_json::to_string(&StateFile::current())?,
        ) {
            warn!(error = %e, "failed to write state file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_apply_algebra() {
        let a = default_config();
        let mut b = a.clone();
        b.memory_mib = 8192;
        b.rosetta = true;

        assert!(diff(&a, &a).is_empty());
        assert_eq!(apply(&a, &diff(&a, &b)), b);
        assert_eq!(apply(&a, &VmConfigPatch::default()), a);
    }

    #[test]
    fn cpu_is_clamped_not_rejected() {
        let mut config = default_config();
        config.cpu = u32::MAX;
        validate(&mut config).unwrap();
        assert_eq!(config.cpu, host_cpus());

        config.cpu = 0;
        validate(&mut config).unwrap();
        assert_eq!(config.cpu, 1);
    }

    #[test]
    fn proxy_url_with_path_rejected() {
        let mut config = default_config();
        config.network_proxy = NetworkProxy::Url("http://proxy:8080/path".into());
        assert!(validate(&mut config).is_err());

        config.network_proxy = NetworkProxy::Url("socks5://proxy:1080".into());
        validate(&mut config).unwrap();
    }

    #[test]
    fn persists_only_non_default_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::ephemeral(dir.path()).unwrap();

        store
            .patch(&VmConfigPatch {
                memory_mib: Some(4096),
                ..Default::default()
            })
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
        let on_disk: serde_json::Value = serde_json::from_str(&raw).unwrap();
        // 4096 is the default; nothing should be persisted for it.
        assert_eq!(on_disk, serde_json::json!({}));

        store
            .patch(&VmConfigPatch {
                memory_mib: Some(8192),
                ..Default::default()
            })
            .unwrap();
        let raw = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
        let on_disk: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk, serde_json::json!({"memory_mib": 8192}));
    }

    #[test]
    fn reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ConfigStore::ephemeral(dir.path()).unwrap();
            store
                .patch(&VmConfigPatch {
                    rosetta: Some(true),
                    memory_mib: Some(8192),
                    ..Default::default()
                })
                .unwrap();
        }
        let store = ConfigStore::ephemeral(dir.path()).unwrap();
        let config = store.get();
        assert!(config.rosetta);
        assert_eq!(config.memory_mib, 8192);
    }

    #[test]
    fn incompatible_state_file_refuses_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("state.json"),
            format!(
                r#"{{"version":{},"arch":"{}"}}"#,
                StateFile::CURRENT_VERSION + 1,
                std::env::consts::ARCH
            ),
        )
        .unwrap();
        assert!(ConfigStore::ephemeral(dir.path()).is_err());
    }

    #[test]
    fn patch_broadcasts_applied_diff() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::ephemeral(dir.path()).unwrap();
        let mut rx = store.subscribe();
        store
            .patch(&VmConfigPatch {
                rosetta: Some(true),
                ..Default::default()
            })
            .unwrap();
        let applied = rx.try_recv().unwrap();
        assert_eq!(applied.rosetta, Some(true));
        assert!(applied.memory_mib.is_none());
    }
}
