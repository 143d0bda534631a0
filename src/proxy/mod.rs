//! Per-destination dialer selection.
//!
//! The three dialer slots (`all`, `http` for port 80, `https` for 443) are
//! derived from the system proxy settings and the user override, in that
//! priority order, and swapped atomically on every refresh. `dial_forward`
//! is the single outbound path for the TCP forwarder: it remaps host-NAT
//! destinations to loopback, picks the slot by port, and (direct dials
//! only) retries the refused host-NAT dial once on the other loopback
//! family within the same deadline.

pub mod http;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};
use url::Url;

use crate::nat::{alternate_loopback, NatTable};
use crate::{Error, Result};
use gateway_protocol::NetworkProxy;

/// Outbound dials give up after this long, proxied or not.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// One upstream proxy endpoint from system settings or the override URL.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ProxyEndpoint {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn auth_header(&self) -> Option<String> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some(http::basic_auth_header(user, password)),
            (Some(user), None) => Some(http::basic_auth_header(user, "")),
            _ => None,
        }
    }
}

/// Per-scheme snapshot of the host's proxy configuration, delivered by the
/// hypervisor glue whenever macOS network settings change.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SystemProxySettings {
    pub http: Option<ProxyEndpoint>,
    pub https: Option<ProxyEndpoint>,
    pub socks: Option<ProxyEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Dialer {
    Socks5(ProxyEndpoint),
    /// CONNECT tunneling, for TLS-carrying traffic.
    HttpConnect(ProxyEndpoint),
    /// Origin-form reverse proxy, for plain HTTP traffic.
    HttpOrigin(ProxyEndpoint),
}

/// The three slots; `None` means dial directly.
#[derive(Debug, Clone, Default, PartialEq)]
struct Slots {
    all: Option<Dialer>,
    http: Option<Dialer>,
    https: Option<Dialer>,
}

pub struct ProxyManager {
    nat: Arc<NatTable>,
    slots: RwLock<Arc<Slots>>,
    /// Serializes refresh; the slots swap is a single write.
    refresh_lock: Mutex<()>,
    system: Mutex<SystemProxySettings>,
    override_proxy: Mutex<NetworkProxy>,
}

impl ProxyManager {
    pub fn new(nat: Arc<NatTable>) -> Self {
        Self {
            nat,
            slots: RwLock::new(Arc::new(Slots::default())),
            refresh_lock: Mutex::new(()),
            system: Mutex::new(SystemProxySettings::default()),
            override_proxy: Mutex::new(NetworkProxy::Auto),
        }
    }

    /// New system settings from the host; triggers a refresh.
    pub fn set_system(&self, settings: SystemProxySettings) {
        *self.system.lock().expect("proxy settings poisoned") = settings;
        self.refresh();
    }

    /// New user override from a config patch; triggers a refresh.
    pub fn set_override(&self, proxy: NetworkProxy) -> Result<()> {
        if let NetworkProxy::Url(url) = &proxy {
            parse_override(url)?;
        }
        *self.override_proxy.lock().expect("proxy override poisoned") = proxy;
        self.refresh();
        Ok(())
    }

    /// Snapshot for the host-control RPC.
    pub fn system_snapshot(&self) -> SystemProxySettings {
        self.system.lock().expect("proxy settings poisoned").clone()
    }

    /// Re-derive the dialer slots. Rules, in order: user override, system
    /// SOCKS, system HTTPS, system HTTP, direct.
    fn refresh(&self) {
        let _guard = self.refresh_lock.lock().expect("refresh poisoned");
        let override_proxy = self
            .override_proxy
            .lock()
            .expect("proxy override poisoned")
            .clone();
        let system = self.system.lock().expect("proxy settings poisoned").clone();

        let slots = match override_proxy {
            NetworkProxy::None => Slots::default(),
            NetworkProxy::Url(url) => match parse_override(&url) {
                Ok((scheme, endpoint)) => match scheme {
                    OverrideScheme::Socks5 => Slots {
                        all: Some(Dialer::Socks5(endpoint.clone())),
                        http: Some(Dialer::Socks5(endpoint.clone())),
                        https: Some(Dialer::Socks5(endpoint)),
                    },
                    OverrideScheme::Http | OverrideScheme::Https => Slots {
                        all: None,
                        http: Some(Dialer::HttpOrigin(endpoint.clone())),
                        https: Some(Dialer::HttpConnect(endpoint)),
                    },
                },
                Err(e) => {
                    // Validation happens at config time; an invalid URL
                    // surviving to here degrades to direct.
                    warn!(error = %e, "invalid proxy override ignored");
                    Slots::default()
                }
            },
            NetworkProxy::Auto => {
                if let Some(socks) = system.socks {
                    Slots {
                        all: Some(Dialer::Socks5(socks.clone())),
                        http: Some(Dialer::Socks5(socks.clone())),
                        https: Some(Dialer::Socks5(socks)),
                    }
                } else if let Some(https) = system.https {
                    Slots {
                        all: None,
                        http: None,
                        https: Some(Dialer::HttpConnect(https)),
                    }
                } else if let Some(http) = system.http {
                    Slots {
                        all: None,
                        http: Some(Dialer::HttpOrigin(http)),
                        https: None,
                    }
                } else {
                    Slots::default()
                }
            }
        };

        *self.slots.write().expect("slots poisoned") = Arc::new(slots);
        debug!("proxy dialers refreshed");
    }

    fn slot_for_port(slots: &Slots, port: u16) -> Option<&Dialer> {
        match port {
            80 => slots.http.as_ref(),
            443 => slots.https.as_ref(),
            _ => slots.all.as_ref(),
        }
    }

    /// Dial the external side for a forwarded guest connection. `local` is
    /// the address the guest dialed, before host-NAT remapping.
    pub async fn dial_forward(&self, local: SocketAddr) -> io::Result<DialedStream> {
        let slots = self.slots.read().expect("slots poisoned").clone();
        let dialer = Self::slot_for_port(&slots, local.port()).cloned();
        let (dst, remapped) = self.nat.rewrite(local);

        tokio::time::timeout(DIAL_TIMEOUT, async {
            match dialer {
                None => {
                    match TcpStream::connect(dst).await {
                        Ok(stream) => Ok(DialedStream::Direct(stream)),
                        Err(e)
                            if e.kind() == io::ErrorKind::ConnectionRefused && remapped =>
                        {
                            // The guest asked for "the host"; if one loopback
                            // family refuses, the listener may live on the
                            // other. One retry, same deadline.
                            let Some(alt) = alternate_loopback(dst) else {
                                return Err(e);
                            };
                            trace!(%dst, %alt, "host-NAT dial refused, retrying alternate family");
                            TcpStream::connect(alt).await.map(DialedStream::Direct)
                        }
                        Err(e) => Err(e),
                    }
                }
                Some(Dialer::Socks5(endpoint)) => {
                    let mut stream = TcpStream::connect(endpoint.addr()).await?;
                    let auth = match (&endpoint.user, &endpoint.password) {
                        (Some(user), Some(password)) => Some(async_socks5::Auth::new(
                            user.clone(),
                            password.clone(),
                        )),
                        _ => None,
                    };
                    async_socks5::connect(&mut stream, dst, auth)
                        .await
                        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
                    Ok(DialedStream::Tunnel(stream))
                }
                Some(Dialer::HttpConnect(endpoint)) => {
                    let mut stream = TcpStream::connect(endpoint.addr()).await?;
                    http::connect_tunnel(
                        &mut stream,
                        &format!("{}:{}", dst.ip(), dst.port()),
                        endpoint.auth_header().as_deref(),
                    )
                    .await?;
                    Ok(DialedStream::Tunnel(stream))
                }
                Some(Dialer::HttpOrigin(endpoint)) => {
                    let stream = TcpStream::connect(endpoint.addr()).await?;
                    let rewriter = http::OriginRewriter::new(
                        format!("{}:{}", local.ip(), local.port()),
                        endpoint.auth_header(),
                        IpAddr::V4(crate::stack::GUEST4),
                    );
                    Ok(DialedStream::Origin(Box::new(OriginStream {
                        upstream: stream,
                        rewriter,
                        pending: Vec::new(),
                    })))
                }
            }
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial deadline exceeded"))?
    }
}

#[derive(Debug, Clone, Copy)]
enum OverrideScheme {
    Http,
    Https,
    Socks5,
}

/// Validate and split an override URL. Paths are rejected; only
/// http/https/socks5 schemes are supported.
fn parse_override(raw: &str) -> Result<(OverrideScheme, ProxyEndpoint)> {
    let url = Url::parse(raw).map_err(|e| Error::Proxy(format!("invalid proxy url: {e}")))?;
    let scheme = match url.scheme() {
        "http" => OverrideScheme::Http,
        "https" => OverrideScheme::Https,
        "socks5" => OverrideScheme::Socks5,
        other => return Err(Error::Proxy(format!("unsupported proxy scheme '{other}'"))),
    };
    if !url.path().is_empty() && url.path() != "/" {
        return Err(Error::Proxy("proxy url must not carry a path".into()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| Error::Proxy("proxy url has no host".into()))?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(match scheme {
        OverrideScheme::Socks5 => 1080,
        OverrideScheme::Http => 80,
        OverrideScheme::Https => 443,
    });
    let user = (!url.username().is_empty()).then(|| url.username().to_string());
    let password = url.password().map(str::to_string);
    Ok((
        scheme,
        ProxyEndpoint {
            host,
            port,
            user,
            password,
        },
    ))
}

// ---------------------------------------------------------------------------
// Dialed stream
// ---------------------------------------------------------------------------

/// The external side of a forwarded connection.
#[derive(Debug)]
pub enum DialedStream {
    Direct(TcpStream),
    /// SOCKS5 or CONNECT tunnel, already established.
    Tunnel(TcpStream),
    /// HTTP origin traffic with per-request head rewriting.
    Origin(Box<OriginStream>),
}

impl DialedStream {
    /// True when no proxy sits between us and the destination.
    pub fn is_direct(&self) -> bool {
        matches!(self, DialedStream::Direct(_))
    }

    pub fn set_nodelay(&self, nodelay: bool) {
        if let DialedStream::Direct(s) | DialedStream::Tunnel(s) = self {
            if let Err(e) = s.set_nodelay(nodelay) {
                trace!(error = %e, "set_nodelay failed");
            }
        }
    }

    /// Keepalive stays off on the external side; flow liveness belongs to
    /// the guest.
    pub fn set_keepalive_off(&self) {
        if let DialedStream::Direct(s) | DialedStream::Tunnel(s) = self {
            let sock = socket2::SockRef::from(s);
            if let Err(e) = sock.set_keepalive(false) {
                trace!(error = %e, "disable keepalive failed");
            }
        }
    }
}

/// HTTP proxy upstream carrying rewritten origin requests.
#[derive(Debug)]
pub struct OriginStream {
    upstream: TcpStream,
    rewriter: http::OriginRewriter,
    pending: Vec<u8>,
}

impl OriginStream {
    fn poll_flush_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            match Pin::new(&mut self.upstream).poll_write(cx, &self.pending) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    self.pending.drain(..n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for DialedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DialedStream::Direct(s) | DialedStream::Tunnel(s) => Pin::new(s).poll_read(cx, buf),
            DialedStream::Origin(o) => Pin::new(&mut o.upstream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DialedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            DialedStream::Direct(s) | DialedStream::Tunnel(s) => Pin::new(s).poll_write(cx, buf),
            DialedStream::Origin(o) => {
                // Backpressure by bounding the rewritten backlog.
                if o.pending.len() > 256 * 1024 {
                    match o.poll_flush_pending(cx) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                let mut out = std::mem::take(&mut o.pending);
                o.rewriter.push(buf, &mut out);
                o.pending = out;
                let _ = o.poll_flush_pending(cx)?;
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DialedStream::Direct(s) | DialedStream::Tunnel(s) => Pin::new(s).poll_flush(cx),
            DialedStream::Origin(o) => {
                match o.poll_flush_pending(cx) {
                    Poll::Ready(Ok(())) => {}
                    other => return other,
                }
                Pin::new(&mut o.upstream).poll_flush(cx)
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DialedStream::Direct(s) | DialedStream::Tunnel(s) => Pin::new(s).poll_shutdown(cx),
            DialedStream::Origin(o) => {
                match o.poll_flush_pending(cx) {
                    Poll::Ready(Ok(())) => {}
                    other => return other,
                }
                Pin::new(&mut o.upstream).poll_shutdown(cx)
            }
        }
    }
}
