//! Host-control RPC on the secure-services IP.
//!
//! The in-VM Linux processes call back into the gateway over this surface:
//! user identity, timezone, proxy settings, SSH public key, Docker daemon
//! config text, extra CA certificates, the fsnotify registry, Docker UI
//! event relay, and the entitlement result. JSON over HTTP, one request
//! per connection.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::proxy::ProxyManager;
use crate::stack::vtcp::VtcpStream;
use crate::stack::TcpService;

#[derive(Debug, Clone, Serialize)]
struct Identity {
    username: String,
    uid: u32,
    home: String,
}

#[derive(Debug, Deserialize)]
struct FsnotifyRequest {
    path: String,
}

/// Paths to host files the guest may ask about. Overridable for tests and
/// nonstandard installs.
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub docker_daemon_config: PathBuf,
    pub extra_ca_certs: PathBuf,
    pub ssh_dir: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/".into());
        let docker_dir = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(&home).join(".docker"));
        Self {
            docker_daemon_config: docker_dir.join("daemon.json"),
            extra_ca_certs: docker_dir.join("certs.d/extra-ca.pem"),
            ssh_dir: PathBuf::from(&home).join(".ssh"),
        }
    }
}

struct Inner {
    proxy: Arc<ProxyManager>,
    paths: HostPaths,
    fsnotify: Mutex<BTreeSet<String>>,
    docker_events: broadcast::Sender<serde_json::Value>,
}

#[derive(Clone)]
pub struct HostControl {
    inner: Arc<Inner>,
}

impl HostControl {
    pub fn new(proxy: Arc<ProxyManager>, paths: HostPaths) -> Self {
        let (docker_events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                proxy,
                paths,
                fsnotify: Mutex::new(BTreeSet::new()),
                docker_events,
            }),
        }
    }

    /// Watched paths, for the fsnotify forwarder.
    pub fn fsnotify_paths(&self) -> Vec<String> {
        self.inner
            .fsnotify
            .lock()
            .expect("fsnotify registry poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Docker UI events relayed from the guest.
    pub fn subscribe_docker_events(&self) -> broadcast::Receiver<serde_json::Value> {
        self.inner.docker_events.subscribe()
    }
}

impl TcpService for HostControl {
    fn serve(&self, stream: VtcpStream) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.handle(stream).await {
                trace!(error = %e, "hostctl session ended");
            }
        });
    }
}

impl Inner {
    async fn handle(&self, mut stream: VtcpStream) -> std::io::Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        let req = String::from_utf8_lossy(&buf[..n]).to_string();
        let request_line = req.lines().next().unwrap_or("");
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("");
        let path = parts.next().unwrap_or("");
        let body = req
            .find("\r\n\r\n")
            .map(|idx| &req[idx + 4..])
            .unwrap_or("");

        let (status, payload) = self.route(method, path, body);
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            payload.len(),
            payload
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }

    fn route(&self, method: &str, path: &str, body: &str) -> (&'static str, String) {
        match (method, path) {
            ("GET", "/v1/identity") => ok(&self.identity()),
            ("GET", "/v1/timezone") => ok(&json!({ "timezone": host_timezone() })),
            ("GET", "/v1/proxy-settings") => {
                let snapshot = self.proxy.system_snapshot();
                ok(&json!({
                    "http": snapshot.http.map(|p| format!("{}:{}", p.host, p.port)),
                    "https": snapshot.https.map(|p| format!("{}:{}", p.host, p.port)),
                    "socks": snapshot.socks.map(|p| format!("{}:{}", p.host, p.port)),
                }))
            }
            ("GET", "/v1/ssh-public-key") => match self.ssh_public_key() {
                Some(key) => ok(&json!({ "public_key": key })),
                None => not_found("no public key"),
            },
            ("GET", "/v1/docker-config") => {
                let text = std::fs::read_to_string(&self.paths.docker_daemon_config)
                    .unwrap_or_default();
                ok(&json!({ "config": text }))
            }
            ("GET", "/v1/ca-certs") => {
                let text =
                    std::fs::read_to_string(&self.paths.extra_ca_certs).unwrap_or_default();
                ok(&json!({ "certs": text }))
            }
            ("GET", "/v1/entitlement") => {
                // The entitlement client is an external collaborator; absent
                // one, the gateway reports licensed.
                ok(&json!({ "licensed": true, "grace": false }))
            }
            ("POST", "/v1/fsnotify/add") => match serde_json::from_str::<FsnotifyRequest>(body) {
                Ok(req) => {
                    self.fsnotify
                        .lock()
                        .expect("fsnotify registry poisoned")
                        .insert(req.path);
                    ok(&json!({}))
                }
                Err(e) => bad_request(&format!("invalid JSON: {e}")),
            },
            ("POST", "/v1/fsnotify/remove") => {
                match serde_json::from_str::<FsnotifyRequest>(body) {
                    Ok(req) => {
                        self.fsnotify
                            .lock()
                            .expect("fsnotify registry poisoned")
                            .remove(&req.path);
                        ok(&json!({}))
                    }
                    Err(e) => bad_request(&format!("invalid JSON: {e}")),
                }
            }
            ("POST", "/v1/fsnotify/clear") => {
                self.fsnotify
                    .lock()
                    .expect("fsnotify registry poisoned")
                    .clear();
                ok(&json!({}))
            }
            ("POST", "/v1/docker-event") => match serde_json::from_str(body) {
                Ok(event) => {
                    let _ = self.docker_events.send(event);
                    ok(&json!({}))
                }
                Err(e) => bad_request(&format!("invalid JSON: {e}")),
            },
            _ => not_found("route not found"),
        }
    }

    fn identity(&self) -> serde_json::Value {
        let username = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
        let home = std::env::var("HOME").unwrap_or_else(|_| "/".into());
        let uid = unsafe { libc::getuid() };
        serde_json::to_value(Identity {
            username,
            uid,
            home,
        })
        .unwrap_or_else(|_| json!({}))
    }

    /// First public key in the user's ~/.ssh, preferring modern types.
    fn ssh_public_key(&self) -> Option<String> {
        for name in ["id_ed25519.pub", "id_ecdsa.pub", "id_rsa.pub"] {
            let path = self.paths.ssh_dir.join(name);
            if let Ok(key) = std::fs::read_to_string(&path) {
                debug!(path = %path.display(), "ssh public key served");
                return Some(key.trim().to_string());
            }
        }
        None
    }
}

fn host_timezone() -> String {
    if let Ok(tz) = std::env::var("TZ") {
        if !tz.is_empty() {
            return tz;
        }
    }
    // /etc/localtime links into the zoneinfo database on macOS and Linux.
    if let Ok(target) = std::fs::read_link("/etc/localtime") {
        let text = target.to_string_lossy();
        if let Some(idx) = text.find("zoneinfo/") {
            return text[idx + "zoneinfo/".len()..].to_string();
        }
    }
    "UTC".to_string()
}

fn ok(value: &serde_json::Value) -> (&'static str, String) {
    ("200 OK", value.to_string())
}

fn bad_request(message: &str) -> (&'static str, String) {
    (
        "400 Bad Request",
        json!({ "error": message }).to_string(),
    )
}

fn not_found(message: &str) -> (&'static str, String) {
    ("404 Not Found", json!({ "error": message }).to_string())
}
