//! In-stack NTP on the services IP.
//!
//! Stateless: every client packet gets a server-mode reply carrying the
//! host clock. The guest uses this to stay in sync across host sleeps,
//! so correctness of the timestamp format matters more than precision.

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::trace;

use crate::stack::{StackHandle, UdpMeta, UdpService};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const PACKET_LEN: usize = 48;

/// Stratum advertised to the guest; we relay the host clock, which is
/// itself NTP-disciplined.
const STRATUM: u8 = 2;

/// "LOCL" reference identifier.
const REF_ID: u32 = u32::from_be_bytes(*b"LOCL");

/// Clock source seam; tests pin it, production uses the system clock.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Duration;
}

pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

pub struct NtpService {
    stack: StackHandle,
    clock: Arc<dyn TimeSource>,
}

impl NtpService {
    pub fn new(stack: StackHandle, clock: Arc<dyn TimeSource>) -> Self {
        Self { stack, clock }
    }
}

impl UdpService for NtpService {
    fn datagram(&self, meta: UdpMeta, payload: Vec<u8>) {
        match build_response(&payload, self.clock.now()) {
            Some(response) => self.stack.send_udp(meta.local, meta.guest, &response),
            None => trace!(len = payload.len(), "malformed ntp request dropped"),
        }
    }
}

fn unix_to_ntp(now: Duration) -> (u32, u32) {
    let seconds = (now.as_secs() + NTP_UNIX_OFFSET) as u32;
    let fraction = ((now.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (seconds, fraction as u32)
}

/// Transform one client packet into a server reply.
pub fn build_response(request: &[u8], now: Duration) -> Option<Vec<u8>> {
    if request.len() < PACKET_LEN {
        return None;
    }
    let client_version = (request[0] >> 3) & 0x7;
    let client_mode = request[0] & 0x7;
    // Client (3) or symmetric-active (1) may query a server.
    if client_mode != 3 && client_mode != 1 {
        return None;
    }

    // The client's transmit timestamp echoes back as our originate.
    let mut cursor = Cursor::new(&request[40..48]);
    let origin_secs = cursor.read_u32::<BigEndian>().ok()?;
    let origin_frac = cursor.read_u32::<BigEndian>().ok()?;

    let (secs, frac) = unix_to_ntp(now);

    let mut out = Vec::with_capacity(PACKET_LEN);
    // LI = 0, version = client's, mode = 4 (server).
    out.push((client_version << 3) | 4);
    out.push(STRATUM);
    out.push(request[2]); // poll interval, echoed
    out.push(0xEC); // precision ~ -20 (microsecond-ish)
    out.write_u32::<BigEndian>(0).ok()?; // root delay
    out.write_u32::<BigEndian>(0).ok()?; // root dispersion
    out.write_u32::<BigEndian>(REF_ID).ok()?;
    // Reference timestamp: last "sync", i.e. now.
    out.write_u32::<BigEndian>(secs).ok()?;
    out.write_u32::<BigEndian>(frac).ok()?;
    // Originate = client transmit.
    out.write_u32::<BigEndian>(origin_secs).ok()?;
    out.write_u32::<BigEndian>(origin_frac).ok()?;
    // Receive and transmit: now, twice (stateless server).
    out.write_u32::<BigEndian>(secs).ok()?;
    out.write_u32::<BigEndian>(frac).ok()?;
    out.write_u32::<BigEndian>(secs).ok()?;
    out.write_u32::<BigEndian>(frac).ok()?;
    Some(out)
}
