//! The owning composition root.
//!
//! `Gateway` constructs and holds every subcomponent (link, stack,
//! forwarders, proxy manager, services, host-forward router, power
//! monitor, control RPC) and wires them together through handles. Leaves
//! never observe their owner; the only shared state travels through
//! [`StackHandle`] clones and `Arc`s created here.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use gateway_protocol::forward::ForwardSpec;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::control::{self, ControlState, StandaloneLifecycle, VmLifecycle};
use crate::forward::icmp::IcmpForwarder;
use crate::forward::tcp::TcpForwarder;
use crate::forward::udp::{UdpForwarder, UdpReverseMap};
use crate::hostfwd::{ForwardRouter, VsockDial};
use crate::link::{sniffer::PcapWriter, DatagramLink, Link, SniffingLink, StreamLink};
use crate::nat::NatTable;
use crate::power::SleepWakeMonitor;
use crate::proxy::ProxyManager;
use crate::services::{
    dns::DnsService, hostctl::HostControl, hostctl::HostPaths, ntp::NtpService,
    ntp::SystemTimeSource, sshagent::SshAgentProxy, DNS_PORT, HOST_CONTROL_PORT, NTP_PORT,
    SSH_AGENT_PORT,
};
use crate::stack::{
    Netstack, StackHandle, StackWiring, TcpService, SECURE_SERVICES4, SERVICES4,
};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// 1500 or 65520, fixed at stack creation.
    pub mtu: usize,
    /// Capture every link frame to a pcap file.
    pub pcap_path: Option<PathBuf>,
    /// Where config.json / state.json live.
    pub config_dir: PathBuf,
    /// Control RPC endpoints.
    pub control_unix: Option<PathBuf>,
    pub control_tcp: Option<SocketAddr>,
    /// Forwards registered at startup.
    pub forwards: Vec<ForwardSpec>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        Self {
            mtu: crate::link::MTU_STANDARD,
            pcap_path: None,
            config_dir: PathBuf::from(home).join(".vnet-gateway"),
            control_unix: None,
            control_tcp: None,
            forwards: Vec::new(),
        }
    }
}

pub struct GatewayBuilder {
    config: GatewayConfig,
    link: Option<Arc<dyn Link>>,
    vsock: Option<Arc<dyn VsockDial>>,
    lifecycle: Option<Arc<dyn VmLifecycle>>,
}

impl GatewayBuilder {
    pub fn datagram_link(mut self, socket: tokio::net::UnixDatagram) -> Self {
        match DatagramLink::new(socket, self.config.mtu) {
            Ok(link) => self.link = Some(Arc::new(link)),
            Err(e) => warn!(error = %e, "datagram link setup failed"),
        }
        self
    }

    pub fn stream_link(mut self, stream: tokio::net::UnixStream) -> Self {
        match StreamLink::new(stream, self.config.mtu) {
            Ok(link) => self.link = Some(Arc::new(link)),
            Err(e) => warn!(error = %e, "stream link setup failed"),
        }
        self
    }

    /// Bring your own link (tests use an in-memory pair).
    pub fn link(mut self, link: Arc<dyn Link>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn vsock_dialer(mut self, dialer: Arc<dyn VsockDial>) -> Self {
        self.vsock = Some(dialer);
        self
    }

    pub fn lifecycle(mut self, lifecycle: Arc<dyn VmLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn build(self) -> Result<Gateway> {
        if self.config.mtu != crate::link::MTU_STANDARD
            && self.config.mtu != crate::link::MTU_JUMBO
        {
            return Err(Error::Config(format!("unsupported mtu {}", self.config.mtu)));
        }
        let link = self
            .link
            .ok_or_else(|| Error::Config("no link endpoint configured".into()))?;

        let link = match &self.config.pcap_path {
            Some(path) => {
                let writer = PcapWriter::create(path, 65535)?;
                info!(path = %path.display(), "link sniffer enabled");
                Arc::new(SniffingLink::new(link, writer)) as Arc<dyn Link>
            }
            None => link,
        };

        Ok(Gateway {
            config: self.config,
            link,
            vsock: self.vsock,
            lifecycle: self
                .lifecycle
                .unwrap_or_else(|| StandaloneLifecycle::new() as Arc<dyn VmLifecycle>),
        })
    }
}

pub struct Gateway {
    config: GatewayConfig,
    link: Arc<dyn Link>,
    vsock: Option<Arc<dyn VsockDial>>,
    lifecycle: Arc<dyn VmLifecycle>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder {
            config,
            link: None,
            vsock: None,
            lifecycle: None,
        }
    }

    /// Wire everything and go. Consumes the gateway; the returned handle
    /// owns shutdown.
    pub async fn start(self) -> Result<GatewayHandle> {
        let mtu = self.config.mtu;
        let (handle, channels) = StackHandle::new(mtu);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Translation state shared by the forward paths.
        let nat = Arc::new(NatTable::with_host_nat());
        let reverse = Arc::new(UdpReverseMap::default());
        let proxy = Arc::new(ProxyManager::new(nat.clone()));

        let tcp_forwarder = Arc::new(TcpForwarder::new(handle.clone(), proxy.clone()));
        let udp_forwarder = Arc::new(UdpForwarder::new(
            handle.clone(),
            nat.clone(),
            reverse.clone(),
        ));
        let icmp_forwarder = Arc::new(IcmpForwarder::new(handle.clone(), nat.clone(), reverse)?);

        // In-stack services.
        let dns = DnsService::from_system(handle.clone())?;
        handle.bind_udp(
            SocketAddr::new(IpAddr::V4(SERVICES4), DNS_PORT),
            Arc::new(dns.clone()),
        )?;
        handle.bind_udp(
            SocketAddr::new(IpAddr::V4(SERVICES4), NTP_PORT),
            Arc::new(NtpService::new(handle.clone(), Arc::new(SystemTimeSource))),
        )?;

        let hostctl = HostControl::new(proxy.clone(), HostPaths::default());
        let ssh_dir = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/".into()))
            .join(".ssh");
        let mut tcp_services: HashMap<(IpAddr, u16), Arc<dyn TcpService>> = HashMap::new();
        tcp_services.insert(
            (IpAddr::V4(SERVICES4), DNS_PORT),
            Arc::new(dns) as Arc<dyn TcpService>,
        );
        tcp_services.insert(
            (IpAddr::V4(SECURE_SERVICES4), HOST_CONTROL_PORT),
            Arc::new(hostctl),
        );
        tcp_services.insert(
            (IpAddr::V4(SECURE_SERVICES4), SSH_AGENT_PORT),
            Arc::new(SshAgentProxy::new(ssh_dir)),
        );

        let wiring = StackWiring {
            tcp_acceptor: tcp_forwarder,
            udp_fallback: udp_forwarder,
            icmp: icmp_forwarder,
            tcp_services,
        };

        let stack = Netstack::new(
            self.link.clone(),
            handle.clone(),
            channels,
            wiring,
            shutdown_rx.clone(),
        );
        let stack_task = tokio::spawn(stack.run());

        // Host-side forwards.
        let forwards = Arc::new(ForwardRouter::new(handle.clone(), self.vsock.clone()));
        for spec in &self.config.forwards {
            forwards.start(spec.clone()).await?;
        }

        // Config store drives the proxy override.
        std::fs::create_dir_all(&self.config.config_dir)?;
        let config_store = Arc::new(ConfigStore::open(
            self.config.config_dir.join("config.json"),
            self.config.config_dir.join("state.json"),
        )?);
        proxy.set_override(config_store.get().network_proxy)?;
        {
            let proxy = proxy.clone();
            let mut changes = config_store.subscribe();
            tokio::spawn(async move {
                while let Ok(patch) = changes.recv().await {
                    if let Some(np) = patch.network_proxy {
                        debug!("config patch changed network proxy");
                        if let Err(e) = proxy.set_override(np) {
                            warn!(error = %e, "proxy override rejected");
                        }
                    }
                }
            });
        }

        let power = SleepWakeMonitor::new();

        let control_state = ControlState::new(
            config_store,
            forwards.clone(),
            proxy,
            power,
            self.lifecycle.clone(),
        );
        let control_task = tokio::spawn(control::serve(
            control_state,
            self.config.control_unix.clone(),
            self.config.control_tcp,
            shutdown_rx,
        ));

        info!(mtu, "gateway started");
        Ok(GatewayHandle {
            shutdown_tx,
            stack_task,
            control_task,
            forwards,
        })
    }
}

pub struct GatewayHandle {
    shutdown_tx: watch::Sender<bool>,
    stack_task: JoinHandle<()>,
    control_task: JoinHandle<Result<()>>,
    forwards: Arc<ForwardRouter>,
}

impl GatewayHandle {
    /// Block until the stack exits (link death or shutdown).
    pub async fn wait(self) {
        let _ = self.stack_task.await;
        let _ = self.control_task.await;
    }

    /// Stop everything: listeners release, the stack drains and exits.
    pub fn shutdown(&self) {
        info!("gateway shutting down");
        self.forwards.shutdown_all();
        let _ = self.shutdown_tx.send(true);
    }

    /// A detached shutdown trigger, for signal handlers.
    pub fn trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            shutdown_tx: self.shutdown_tx.clone(),
            forwards: self.forwards.clone(),
        }
    }

    pub fn forwards(&self) -> Arc<ForwardRouter> {
        self.forwards.clone()
    }
}

/// Cheap clone of the shutdown path.
#[derive(Clone)]
pub struct ShutdownTrigger {
    shutdown_tx: watch::Sender<bool>,
    forwards: Arc<ForwardRouter>,
}

impl ShutdownTrigger {
    pub fn shutdown(&self) {
        info!("gateway shutting down");
        self.forwards.shutdown_all();
        let _ = self.shutdown_tx.send(true);
    }
}
