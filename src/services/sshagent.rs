//! SSH agent proxy on the secure-services IP.
//!
//! A unix-to-TCP NAT for ssh-agent framing: the guest dials a well-known
//! in-stack port and reaches the host user's agent socket. The socket path
//! comes from `IdentityAgent` in ~/.ssh/config when present, otherwise
//! `SSH_AUTH_SOCK`. Messages are copied one at a time (length prefix and
//! payload read fully, then written as a unit) because some external
//! agents (hardware-token shims in particular) misbehave on partial reads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, trace, warn};

use crate::stack::vtcp::VtcpStream;
use crate::stack::TcpService;

/// Agent messages are small; anything bigger is a framing error.
const MAX_MESSAGE: usize = 256 * 1024;

#[derive(Clone)]
pub struct SshAgentProxy {
    inner: Arc<Inner>,
}

struct Inner {
    ssh_dir: PathBuf,
}

impl SshAgentProxy {
    pub fn new(ssh_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner { ssh_dir }),
        }
    }

    /// Resolve the agent socket path: `IdentityAgent` beats the
    /// environment.
    pub fn agent_path(&self) -> Option<PathBuf> {
        if let Some(path) = identity_agent_from_config(&self.inner.ssh_dir.join("config")) {
            return Some(path);
        }
        std::env::var("SSH_AUTH_SOCK").ok().map(PathBuf::from)
    }
}

impl TcpService for SshAgentProxy {
    fn serve(&self, stream: VtcpStream) {
        let proxy = self.clone();
        tokio::spawn(async move {
            let Some(path) = proxy.agent_path() else {
                debug!("no ssh agent socket configured");
                return;
            };
            let agent = match UnixStream::connect(&path).await {
                Ok(agent) => agent,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "agent connect failed");
                    return;
                }
            };

            let (guest_read, guest_write) = stream.into_split();
            let (agent_read, agent_write) = agent.into_split();
            tokio::join!(
                copy_agent_messages(guest_read, agent_write),
                copy_agent_messages(agent_read, guest_write),
            );
        });
    }
}

/// Copy ssh-agent messages one at a time: 4-byte big-endian length, then
/// the payload, written atomically.
async fn copy_agent_messages<R, W>(mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).await.is_err() {
            let _ = writer.shutdown().await;
            return;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_MESSAGE {
            trace!(len, "agent framing violation, closing");
            let _ = writer.shutdown().await;
            return;
        }

        let mut message = vec![0u8; 4 + len];
        message[..4].copy_from_slice(&len_buf);
        if reader.read_exact(&mut message[4..]).await.is_err() {
            let _ = writer.shutdown().await;
            return;
        }
        if writer.write_all(&message).await.is_err() {
            return;
        }
        let _ = writer.flush().await;
    }
}

/// Minimal ~/.ssh/config scan for a global `IdentityAgent`.
fn identity_agent_from_config(config: &Path) -> Option<PathBuf> {
    let text = std::fs::read_to_string(config).ok()?;
    let mut in_global = true;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("host ") || lower.starts_with("match ") {
            // Only the global section (before any Host block) applies to
            // every connection.
            in_global = lower == "host *";
            continue;
        }
        if !in_global {
            continue;
        }
        if let Some(rest) = strip_keyword(line, "identityagent") {
            let value = rest.trim().trim_matches('"');
            if value.eq_ignore_ascii_case("none") {
                return None;
            }
            return Some(expand_tilde(value));
        }
    }
    None
}

fn strip_keyword<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let (head, rest) = line.split_once(|c: char| c.is_whitespace() || c == '=')?;
    head.eq_ignore_ascii_case(keyword).then_some(rest)
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn identity_agent_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config");

        std::fs::write(&config, "IdentityAgent /tmp/agent.sock\n").unwrap();
        assert_eq!(
            identity_agent_from_config(&config),
            Some(PathBuf::from("/tmp/agent.sock"))
        );

        // Quotes and equals-form both appear in the wild.
        std::fs::write(&config, "IdentityAgent=\"/tmp/quoted.sock\"\n").unwrap();
        assert_eq!(
            identity_agent_from_config(&config),
            Some(PathBuf::from("/tmp/quoted.sock"))
        );

        // Host-scoped settings do not apply globally.
        std::fs::write(
            &config,
            "Host example.com\n    IdentityAgent /tmp/scoped.sock\n",
        )
        .unwrap();
        assert_eq!(identity_agent_from_config(&config), None);

        // Host * does.
        std::fs::write(
            &config,
            "Host *\n    IdentityAgent /tmp/star.sock\n",
        )
        .unwrap();
        assert_eq!(
            identity_agent_from_config(&config),
            Some(PathBuf::from("/tmp/star.sock"))
        );

        // Explicit none disables.
        std::fs::write(&config, "IdentityAgent none\n").unwrap();
        assert_eq!(identity_agent_from_config(&config), None);
    }

    #[tokio::test]
    async fn messages_are_copied_whole() {
        let (mut client, server) = duplex(4096);
        let (sink, mut check) = duplex(4096);

        let pump = tokio::spawn(async move {
            let (r, _w) = tokio::io::split(server);
            let (_cr, w) = tokio::io::split(sink);
            copy_agent_messages(r, w).await;
        });

        // Two agent messages, delivered in dribbles.
        let mut wire = Vec::new();
        wire.extend_from_slice(&5u32.to_be_bytes());
        wire.extend_from_slice(b"hello");
        wire.extend_from_slice(&2u32.to_be_bytes());
        wire.extend_from_slice(b"ok");
        for chunk in wire.chunks(3) {
            client.write_all(chunk).await.unwrap();
        }
        client.shutdown().await.unwrap();
        pump.await.unwrap();

        let mut out = Vec::new();
        check.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, wire);
    }

    #[tokio::test]
    async fn oversized_message_closes() {
        let (mut client, server) = duplex(4096);
        let (sink, mut check) = duplex(4096);

        let pump = tokio::spawn(async move {
            let (r, _w) = tokio::io::split(server);
            let (_cr, w) = tokio::io::split(sink);
            copy_agent_messages(r, w).await;
        });

        client
            .write_all(&(MAX_MESSAGE as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        pump.await.unwrap();

        let mut out = Vec::new();
        check.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }
}
