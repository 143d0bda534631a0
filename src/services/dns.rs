//! In-stack DNS on the services IP, UDP and TCP.
//!
//! A static zone (`host.internal`, `gateway.internal`, `services.internal`)
//! resolves locally; everything else delegates to the host resolver. EDNS
//! payload size is honored on UDP with the TC flag on overflow; TCP gets
//! the untruncated message. When a name has no record in the queried
//! family, the other family decides between NODATA and NXDOMAIN; resolver
//! transport failures produce no response at all so the guest sees a
//! timeout exactly when the host has no network.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::stack::vtcp::VtcpStream;
use crate::stack::{
    StackHandle, TcpService, UdpMeta, UdpService, GATEWAY4, GATEWAY6, HOST_NAT4, HOST_NAT6,
    SERVICES4,
};
use crate::Result;

/// Minimum UDP payload every resolver must accept.
const UDP_MIN_PAYLOAD: usize = 512;

/// TCP messages are length-prefixed and effectively unbounded.
const TCP_MAX_MESSAGE: usize = 64 * 1024;

struct Inner {
    stack: StackHandle,
    resolver: TokioAsyncResolver,
}

#[derive(Clone)]
pub struct DnsService {
    inner: Arc<Inner>,
}

impl DnsService {
    /// Build against the host's system resolver configuration, falling
    /// back to well-known public resolvers when none is readable.
    pub fn from_system(stack: StackHandle) -> Result<Self> {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!(error = %e, "system resolver unavailable, using defaults");
                TokioAsyncResolver::tokio(
                    hickory_resolver::config::ResolverConfig::cloudflare(),
                    hickory_resolver::config::ResolverOpts::default(),
                )
            }
        };
        Ok(Self {
            inner: Arc::new(Inner { stack, resolver }),
        })
    }
}

impl UdpService for DnsService {
    fn datagram(&self, meta: UdpMeta, payload: Vec<u8>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let Some(response) = inner.answer(&payload).await else {
                return;
            };
            let max_payload = edns_max_payload(&payload);
            let bytes = match response.to_vec() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "dns response encode failed");
                    return;
                }
            };
            let bytes = if bytes.len() > max_payload {
                truncate_for_udp(response)
            } else {
                bytes
            };
            inner.stack.send_udp(meta.local, meta.guest, &bytes);
        });
    }
}

impl TcpService for DnsService {
    fn serve(&self, stream: VtcpStream) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.serve_tcp(stream).await {
                trace!(error = %e, "dns tcp session ended");
            }
        });
    }
}

impl Inner {
    async fn serve_tcp(&self, mut stream: VtcpStream) -> std::io::Result<()> {
        loop {
            let mut len_buf = [0u8; 2];
            if stream.read_exact(&mut len_buf).await.is_err() {
                return Ok(()); // clean close between messages
            }
            let len = u16::from_be_bytes(len_buf) as usize;
            if len == 0 || len > TCP_MAX_MESSAGE {
                return Ok(());
            }
            let mut query = vec![0u8; len];
            stream.read_exact(&mut query).await?;

            let Some(response) = self.answer(&query).await else {
                // No answer means "behave like a dead upstream".
                continue;
            };
            let bytes = match response.to_vec() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "dns response encode failed");
                    continue;
                }
            };
            stream.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
            stream.write_all(&bytes).await?;
        }
    }

    /// Resolve one wire-format query. `None` means "do not respond".
    async fn answer(&self, query_bytes: &[u8]) -> Option<Message> {
        let query = match Message::from_vec(query_bytes) {
            Ok(q) => q,
            Err(e) => {
                trace!(error = %e, "undecodable dns query dropped");
                return None;
            }
        };
        let question = query.queries().first()?.clone();
        let name = question.name().clone();
        let rtype = question.query_type();

        let mut response = Message::new();
        response
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(query.recursion_desired())
            .set_recursion_available(true)
            .add_query(question);

        if let Some(records) = static_zone(&name, rtype) {
            response.set_authoritative(true);
            for record in records {
                response.add_answer(record);
            }
            return Some(response);
        }

        match self.resolver.lookup(name.clone(), rtype).await {
            Ok(lookup) => {
                for record in lookup.records() {
                    response.add_answer(record.clone());
                }
                Some(response)
            }
            Err(e) => match classify_resolve_error(&e) {
                Miss::NoRecords => {
                    // The other family decides NODATA vs NXDOMAIN.
                    let other = match rtype {
                        RecordType::A => RecordType::AAAA,
                        RecordType::AAAA => RecordType::A,
                        _ => {
                            response.set_response_code(ResponseCode::NXDomain);
                            return Some(response);
                        }
                    };
                    match self.resolver.lookup(name, other).await {
                        Ok(_) => Some(response), // NODATA: empty NOERROR
                        Err(e2) => match classify_resolve_error(&e2) {
                            Miss::NoRecords => {
                                response.set_response_code(ResponseCode::NXDomain);
                                Some(response)
                            }
                            Miss::Transport => None,
                        },
                    }
                }
                Miss::Transport => {
                    debug!(error = %e, "resolver unreachable, query unanswered");
                    None
                }
            },
        }
    }
}

enum Miss {
    /// Authoritative "no such record".
    NoRecords,
    /// The host could not reach any resolver; stay silent.
    Transport,
}

fn classify_resolve_error(err: &ResolveError) -> Miss {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => Miss::NoRecords,
        _ => Miss::Transport,
    }
}

/// The requester's EDNS payload budget, or the classic 512.
fn edns_max_payload(query_bytes: &[u8]) -> usize {
    Message::from_vec(query_bytes)
        .ok()
        .and_then(|q| q.extensions().as_ref().map(|e| e.max_payload() as usize))
        .unwrap_or(UDP_MIN_PAYLOAD)
        .max(UDP_MIN_PAYLOAD)
}

/// Oversized UDP answer: strip the answers and flag truncation so the
/// client retries over TCP.
fn truncate_for_udp(mut response: Message) -> Vec<u8> {
    response.take_answers();
    response.set_truncated(true);
    response.to_vec().unwrap_or_default()
}

/// The local zone. Each name answers in both families.
fn static_zone(name: &Name, rtype: RecordType) -> Option<Vec<Record>> {
    let lower = name.to_ascii().to_ascii_lowercase();
    let (v4, v6): (IpAddr, Option<IpAddr>) = match lower.trim_end_matches('.') {
        "host.internal" => (HOST_NAT4.into(), Some(HOST_NAT6.into())),
        "gateway.internal" => (GATEWAY4.into(), Some(GATEWAY6.into())),
        "services.internal" => (SERVICES4.into(), None),
        _ => return None,
    };

    let ttl = 60;
    let records = match rtype {
        RecordType::A => match v4 {
            IpAddr::V4(addr) => vec![Record::from_rdata(name.clone(), ttl, RData::A(A(addr)))],
            IpAddr::V6(_) => vec![],
        },
        RecordType::AAAA => match v6 {
            Some(IpAddr::V6(addr)) => {
                vec![Record::from_rdata(name.clone(), ttl, RData::AAAA(AAAA(addr)))]
            }
            _ => vec![],
        },
        _ => vec![],
    };
    Some(records)
}

/// Where the DNS service listens.
pub fn bind_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(SERVICES4), super::DNS_PORT)
}
