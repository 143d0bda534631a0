//! Shared API and wire-format types for the supervisor ↔ gateway seam.
//!
//! This crate is the single source of truth for everything that crosses the
//! process boundary around the gateway: the VM-control RPC request/response
//! shapes, the VM configuration record and its patch algebra, the
//! host-forward spec grammar, and the length-prefixed guest-link framing.
//! Both the gateway and the supervisor depend on this to avoid struct
//! duplication.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod forward;
pub mod framing;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur while parsing protocol shapes.
#[derive(Debug)]
pub enum ProtocolError {
    /// A forward spec or proxy URL did not match the grammar.
    InvalidSpec(String),
    /// A framed message was truncated or oversized.
    InvalidFrame(String),
    /// An I/O error occurred while reading or writing a frame.
    Io(std::io::Error),
    /// JSON (de)serialization failed.
    Json(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidSpec(msg) => write!(f, "invalid spec: {}", msg),
            ProtocolError::InvalidFrame(msg) => write!(f, "invalid frame: {}", msg),
            ProtocolError::Io(e) => write!(f, "io error: {}", e),
            ProtocolError::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e)
    }
}

// ---------------------------------------------------------------------------
// VM configuration
// ---------------------------------------------------------------------------

/// Network proxy selection: automatic (follow system settings), disabled,
/// or a fixed proxy URL with scheme in {http, https, socks5}.
///
/// Serialized as a plain string: `"auto"`, `"none"`, or the URL itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkProxy {
    Auto,
    None,
    Url(String),
}

impl Default for NetworkProxy {
    fn default() -> Self {
        NetworkProxy::Auto
    }
}

impl fmt::Display for NetworkProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkProxy::Auto => write!(f, "auto"),
            NetworkProxy::None => write!(f, "none"),
            NetworkProxy::Url(u) => write!(f, "{}", u),
        }
    }
}

impl FromStr for NetworkProxy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(NetworkProxy::Auto),
            "none" => Ok(NetworkProxy::None),
            url => {
                let scheme = url
                    .split_once("://")
                    .map(|(scheme, _)| scheme)
                    .ok_or_else(|| {
                        ProtocolError::InvalidSpec(format!("proxy '{}' is not a URL", url))
                    })?;
                if !matches!(scheme, "http" | "https" | "socks5") {
                    return Err(ProtocolError::InvalidSpec(format!(
                        "unsupported proxy scheme '{}'",
                        scheme
                    )));
                }
                Ok(NetworkProxy::Url(url.to_string()))
            }
        }
    }
}

impl Serialize for NetworkProxy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NetworkProxy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NetworkProxy::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// The validated VM configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    pub memory_mib: u32,
    pub cpu: u32,
    pub rosetta: bool,
    pub network_proxy: NetworkProxy,
    pub mount_hide_shared: bool,
}

/// All-optional patch shape for [`VmConfig`]. `PatchConfig` takes this;
/// persistence stores exactly this (fields differing from defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rosetta: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_proxy: Option<NetworkProxy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_hide_shared: Option<bool>,
}

impl VmConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.memory_mib.is_none()
            && self.cpu.is_none()
            && self.rosetta.is_none()
            && self.network_proxy.is_none()
            && self.mount_hide_shared.is_none()
    }
}

// ---------------------------------------------------------------------------
// VM-control RPC
// ---------------------------------------------------------------------------

/// Structured RPC error body: `{"code":"NOT_FOUND","message":"..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorCode {
    InvalidRequest,
    InvalidConfig,
    NotRunning,
    Conflict,
    InternalError,
}

impl RpcError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: RpcErrorCode::InvalidRequest,
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self {
            code: RpcErrorCode::InvalidConfig,
            message: message.into(),
        }
    }

    pub fn not_running(message: impl Into<String>) -> Self {
        Self {
            code: RpcErrorCode::NotRunning,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            code: RpcErrorCode::Conflict,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: RpcErrorCode::InternalError,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"code":"INTERNAL_ERROR","message":"serialization failed"}"#.to_string()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub running: bool,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRequest {
    /// Skip the graceful ladder and tear the VM down immediately.
    #[serde(default)]
    pub force: bool,
    /// Delete VM data after stopping (ResetData).
    #[serde(default)]
    pub delete_data: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupInfo {
    pub username: String,
    pub ssh_config_writable: bool,
    pub docker_context_ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDockerContainersResponse {
    pub containers: Vec<DockerContainer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEnvRequest {
    pub key: String,
    pub value: String,
}

/// Registration body for `StartForward`; the string grammar is parsed by
/// [`forward::ForwardSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartForwardRequest {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopForwardRequest {
    pub from: String,
}

// ---------------------------------------------------------------------------
// Persisted state file
// ---------------------------------------------------------------------------

/// `{version, arch}` gate persisted beside the config. Refuses to load when
/// `version` is newer than the running build or `arch` mismatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    pub arch: String,
}

impl StateFile {
    pub const CURRENT_VERSION: u32 = 3;

    pub fn current() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// Whether a loaded state file is acceptable for this build.
    pub fn compatible(&self) -> bool {
        self.version <= Self::CURRENT_VERSION && self.arch == std::env::consts::ARCH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_proxy_round_trip() {
        for raw in ["auto", "none", "socks5://127.0.0.1:1080"] {
            let parsed: NetworkProxy = raw.parse().unwrap();
            assert_eq!(parsed.to_string(), raw);
            let json = serde_json::to_string(&parsed).unwrap();
            let back: NetworkProxy = serde_json::from_str(&json).unwrap();
            assert_eq!(back, parsed);
        }
    }

    #[test]
    fn network_proxy_rejects_unknown_scheme() {
        assert!("ftp://proxy:21".parse::<NetworkProxy>().is_err());
        assert!("not a url".parse::<NetworkProxy>().is_err());
    }

    #[test]
    fn patch_skips_absent_fields() {
        let patch = VmConfigPatch {
            memory_mib: Some(4096),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&patch).unwrap(),
            r#"{"memory_mib":4096}"#
        );
    }

    #[test]
    fn state_file_compatibility() {
        let mut state = StateFile::current();
        assert!(state.compatible());
        state.version = StateFile::CURRENT_VERSION + 1;
        assert!(!state.compatible());
        let mut state = StateFile::current();
        state.arch = "mips".to_string();
        assert!(!state.compatible());
    }
}
