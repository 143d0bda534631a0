//! VM-control RPC: the external seam to the supervisor.
//!
//! JSON over HTTP, one endpoint per method, bound to a Unix socket and a
//! loopback TCP port simultaneously. The wire shapes live in
//! `gateway-protocol`; this module owns the semantics, most notably the
//! graceful-stop ladder (in-VM stop RPC, then in-stack vcontrol shutdown,
//! then VM force-stop) under a 15 second hard ceiling.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway_protocol::forward::ForwardSpec;
use gateway_protocol::{
    ListDockerContainersResponse, PingResponse, ReportEnvRequest, RpcError, SetupInfo,
    StartForwardRequest, StopForwardRequest, StopRequest, StopResponse, VmConfigPatch,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::hostfwd::ForwardRouter;
use crate::power::{PowerEvent, SleepWakeMonitor};
use crate::proxy::{ProxyManager, SystemProxySettings};
use crate::{Error, Result};

/// Hard ceiling on a graceful stop, all stages included.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Budget for each individual stage of the stop ladder.
const STOP_STAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// VM lifecycle operations, supplied by the supervisor. Each stage of the
/// stop ladder may fail or hang independently; callers time-box them.
#[async_trait]
pub trait VmLifecycle: Send + Sync {
    fn is_running(&self) -> bool;
    /// Ask the in-VM agent to shut down cleanly.
    async fn guest_stop_rpc(&self) -> Result<()>;
    /// Shut down through the in-stack vcontrol channel.
    async fn vcontrol_shutdown(&self) -> Result<()>;
    /// Tear the VM down immediately.
    async fn force_stop(&self) -> Result<()>;
    /// Delete VM data (after a force stop).
    async fn delete_data(&self) -> Result<()>;
    async fn start_setup(&self) -> Result<SetupInfo>;
    async fn finish_setup(&self) -> Result<()>;
    async fn list_containers(&self) -> Result<ListDockerContainersResponse>;
}

/// Standalone lifecycle for tests and for running the gateway without a
/// supervisor: tracks a running flag, stops instantly.
pub struct StandaloneLifecycle {
    running: std::sync::atomic::AtomicBool,
}

impl StandaloneLifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: std::sync::atomic::AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl VmLifecycle for StandaloneLifecycle {
    fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::Acquire)
    }

    async fn guest_stop_rpc(&self) -> Result<()> {
        self.running
            .store(false, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn vcontrol_shutdown(&self) -> Result<()> {
        self.running
            .store(false, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn force_stop(&self) -> Result<()> {
        self.running
            .store(false, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn delete_data(&self) -> Result<()> {
        Ok(())
    }

    async fn start_setup(&self) -> Result<SetupInfo> {
        Ok(SetupInfo {
            username: std::env::var("USER").unwrap_or_else(|_| "unknown".into()),
            ssh_config_writable: ssh_config_writable(),
            docker_context_ready: false,
        })
    }

    async fn finish_setup(&self) -> Result<()> {
        Ok(())
    }

    async fn list_containers(&self) -> Result<ListDockerContainersResponse> {
        Ok(ListDockerContainersResponse { containers: vec![] })
    }
}

#[derive(Clone)]
pub struct ControlState {
    pub config: Arc<ConfigStore>,
    pub forwards: Arc<ForwardRouter>,
    pub proxy: Arc<ProxyManager>,
    pub power: Arc<SleepWakeMonitor>,
    pub lifecycle: Arc<dyn VmLifecycle>,
    /// Setup is idempotent under this lock.
    setup_lock: Arc<Mutex<bool>>,
    env_reports: Arc<std::sync::Mutex<HashMap<String, String>>>,
}

impl ControlState {
    pub fn new(
        config: Arc<ConfigStore>,
        forwards: Arc<ForwardRouter>,
        proxy: Arc<ProxyManager>,
        power: Arc<SleepWakeMonitor>,
        lifecycle: Arc<dyn VmLifecycle>,
    ) -> Self {
        Self {
            config,
            forwards,
            proxy,
            power,
            lifecycle,
            setup_lock: Arc::new(Mutex::new(false)),
            env_reports: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }
}

/// Bind and serve until shutdown. The Unix socket is authoritative; the
/// TCP port exists for tooling that cannot speak AF_UNIX.
pub async fn serve(
    state: ControlState,
    unix_path: Option<PathBuf>,
    tcp_addr: Option<SocketAddr>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let unix_listener = match &unix_path {
        Some(path) => {
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
            Some(UnixListener::bind(path).map_err(|e| {
                Error::Control(format!("unix bind {}: {e}", path.display()))
            })?)
        }
        None => None,
    };
    let tcp_listener = match tcp_addr {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .map_err(|e| Error::Control(format!("tcp bind {addr}: {e}")))?,
        ),
        None => None,
    };

    info!(
        unix = ?unix_path,
        tcp = ?tcp_addr,
        "control RPC listening"
    );

    loop {
        tokio::select! {
            accepted = accept_unix(&unix_listener), if unix_listener.is_some() => {
                if let Some(stream) = accepted {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_stream(stream, state).await {
                            debug!(error = %e, "control connection error");
                        }
                    });
                }
            }
            accepted = accept_tcp(&tcp_listener), if tcp_listener.is_some() => {
                if let Some(stream) = accepted {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_stream(stream, state).await {
                            debug!(error = %e, "control connection error");
                        }
                    });
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    if let Some(path) = unix_path {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

async fn accept_unix(listener: &Option<UnixListener>) -> Option<tokio::net::UnixStream> {
    match listener {
        Some(l) => l.accept().await.ok().map(|(s, _)| s),
        None => std::future::pending().await,
    }
}

async fn accept_tcp(listener: &Option<TcpListener>) -> Option<tokio::net::TcpStream> {
    match listener {
        Some(l) => l.accept().await.ok().map(|(s, _)| s),
        None => std::future::pending().await,
    }
}

async fn handle_stream<S>(mut stream: S, state: ControlState) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 256 * 1024];
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

    let (status, payload) = route(method, path, body, &state).await;
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        payload.len(),
        payload
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn route(method: &str, path: &str, body: &str, state: &ControlState) -> (String, String) {
    if method != "POST" {
        return err_response("405 Method Not Allowed", RpcError::invalid_request("POST only"));
    }
    match path {
        "/v1/Ping" => ok_response(&PingResponse {
            running: state.lifecycle.is_running(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
        "/v1/Stop" => stop(state, StopRequest::default()).await,
        "/v1/ForceStop" => {
            stop(
                state,
                StopRequest {
                    force: true,
                    delete_data: false,
                },
            )
            .await
        }
        "/v1/ResetData" => {
            stop(
                state,
                StopRequest {
                    force: true,
                    delete_data: true,
                },
            )
            .await
        }
        "/v1/GetConfig" => ok_response(&state.config.get()),
        "/v1/PatchConfig" => match serde_json::from_str::<VmConfigPatch>(body) {
            Ok(patch) => match state.config.patch(&patch) {
                Ok(config) => ok_response(&config),
                Err(e) => err_response("400 Bad Request", RpcError::invalid_config(e.to_string())),
            },
            Err(e) => err_response(
                "400 Bad Request",
                RpcError::invalid_request(format!("invalid JSON: {e}")),
            ),
        },
        "/v1/ResetConfig" => match state.config.reset() {
            Ok(config) => ok_response(&config),
            Err(e) => err_response(
                "500 Internal Server Error",
                RpcError::internal(e.to_string()),
            ),
        },
        "/v1/StartSetup" => {
            let mut done = state.setup_lock.lock().await;
            match state.lifecycle.start_setup().await {
                Ok(info) => {
                    *done = false;
                    ok_response(&info)
                }
                Err(e) => err_response(
                    "500 Internal Server Error",
                    RpcError::internal(e.to_string()),
                ),
            }
        }
        "/v1/FinishSetup" => {
            let mut done = state.setup_lock.lock().await;
            if *done {
                // Idempotent: a second finish is a no-op success.
                return ok_response(&serde_json::json!({}));
            }
            match state.lifecycle.finish_setup().await {
                Ok(()) => {
                    *done = true;
                    ok_response(&serde_json::json!({}))
                }
                Err(e) => err_response(
                    "500 Internal Server Error",
                    RpcError::internal(e.to_string()),
                ),
            }
        }
        "/v1/ListDockerContainers" => match state.lifecycle.list_containers().await {
            Ok(list) => ok_response(&list),
            Err(e) => err_response(
                "500 Internal Server Error",
                RpcError::internal(e.to_string()),
            ),
        },
        "/v1/IsSshConfigWritable" => {
            ok_response(&serde_json::json!({ "writable": ssh_config_writable() }))
        }
        "/v1/InternalReportEnv" => match serde_json::from_str::<ReportEnvRequest>(body) {
            Ok(req) => {
                state
                    .env_reports
                    .lock()
                    .expect("env reports poisoned")
                    .insert(req.key, req.value);
                ok_response(&serde_json::json!({}))
            }
            Err(e) => err_response(
                "400 Bad Request",
                RpcError::invalid_request(format!("invalid JSON: {e}")),
            ),
        },
        "/v1/StartForward" => match serde_json::from_str::<StartForwardRequest>(body) {
            Ok(req) => match ForwardSpec::parse(&req.from, &req.to) {
                Ok(spec) => match state.forwards.start(spec).await {
                    Ok(()) => ok_response(&serde_json::json!({})),
                    Err(e) => err_response("409 Conflict", RpcError::conflict(e.to_string())),
                },
                Err(e) => err_response(
                    "400 Bad Request",
                    RpcError::invalid_request(e.to_string()),
                ),
            },
            Err(e) => err_response(
                "400 Bad Request",
                RpcError::invalid_request(format!("invalid JSON: {e}")),
            ),
        },
        "/v1/StopForward" => match serde_json::from_str::<StopForwardRequest>(body) {
            Ok(req) => match req.from.parse() {
                Ok(from) => match state.forwards.stop(&from) {
                    Ok(()) => ok_response(&serde_json::json!({})),
                    Err(e) => err_response("404 Not Found", RpcError::not_running(e.to_string())),
                },
                Err(e) => err_response(
                    "400 Bad Request",
                    RpcError::invalid_request(format!("{e}")),
                ),
            },
            Err(e) => err_response(
                "400 Bad Request",
                RpcError::invalid_request(format!("invalid JSON: {e}")),
            ),
        },
        "/v1/SystemProxyChanged" => match serde_json::from_str::<SystemProxySettings>(body) {
            Ok(settings) => {
                state.proxy.set_system(settings);
                ok_response(&serde_json::json!({}))
            }
            Err(e) => err_response(
                "400 Bad Request",
                RpcError::invalid_request(format!("invalid JSON: {e}")),
            ),
        },
        "/v1/PowerEvent" => match serde_json::from_str::<serde_json::Value>(body) {
            Ok(event) => match event["state"].as_str() {
                Some("sleep") => {
                    state.power.notify(PowerEvent::Sleep);
                    ok_response(&serde_json::json!({}))
                }
                Some("wake") => {
                    state.power.notify(PowerEvent::Wake);
                    ok_response(&serde_json::json!({}))
                }
                _ => err_response(
                    "400 Bad Request",
                    RpcError::invalid_request("state must be sleep|wake"),
                ),
            },
            Err(e) => err_response(
                "400 Bad Request",
                RpcError::invalid_request(format!("invalid JSON: {e}")),
            ),
        },
        _ => err_response("404 Not Found", RpcError::invalid_request("no such method")),
    }
}

/// The stop ladder. Graceful attempts escalate stage by stage; 15 seconds
/// bounds the whole descent, force stop included.
async fn stop(state: &ControlState, req: StopRequest) -> (String, String) {
    if !state.lifecycle.is_running() {
        return err_response("409 Conflict", RpcError::not_running("no instance running"));
    }

    let lifecycle = state.lifecycle.clone();
    let result = tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, async {
        if !req.force {
            if run_stage("guest stop rpc", lifecycle.guest_stop_rpc()).await {
                return true;
            }
            if run_stage("vcontrol shutdown", lifecycle.vcontrol_shutdown()).await {
                return true;
            }
        }
        run_stage("force stop", lifecycle.force_stop()).await
    })
    .await;

    match result {
        Ok(true) => {}
        Ok(false) | Err(_) => {
            // Out of budget or every stage failed: last-resort force stop,
            // fire and forget.
            warn!("graceful stop exhausted its budget, forcing");
            let lifecycle = state.lifecycle.clone();
            tokio::spawn(async move {
                let _ = lifecycle.force_stop().await;
            });
        }
    }

    if req.delete_data {
        if let Err(e) = state.lifecycle.delete_data().await {
            return err_response(
                "500 Internal Server Error",
                RpcError::internal(format!("data deletion failed: {e}")),
            );
        }
    }

    state.forwards.shutdown_all();
    ok_response(&StopResponse { stopped: true })
}

/// One time-boxed rung of the ladder; failures fall through to the next.
async fn run_stage(name: &str, stage: impl std::future::Future<Output = Result<()>>) -> bool {
    match tokio::time::timeout(STOP_STAGE_TIMEOUT, stage).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(stage = name, error = %e, "stop stage failed");
            false
        }
        Err(_) => {
            debug!(stage = name, "stop stage timed out");
            false
        }
    }
}

fn ssh_config_writable() -> bool {
    let Ok(home) = std::env::var("HOME") else {
        return false;
    };
    let path = PathBuf::from(home).join(".ssh/config");
    match std::fs::metadata(&path) {
        Ok(meta) => !meta.permissions().readonly(),
        // Absent file: writable if the directory is.
        Err(_) => path
            .parent()
            .and_then(|dir| std::fs::metadata(dir).ok())
            .map(|meta| !meta.permissions().readonly())
            .unwrap_or(false),
    }
}

fn ok_response<T: serde::Serialize>(value: &T) -> (String, String) {
    (
        "200 OK".to_string(),
        serde_json::to_string(value).unwrap_or_else(|_| "{}".into()),
    )
}

fn err_response(status: &str, error: RpcError) -> (String, String) {
    (status.to_string(), error.to_json())
}
