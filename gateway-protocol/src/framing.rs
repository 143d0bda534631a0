//! Length-prefixed Ethernet framing for the stream link backend.
//!
//! When the hypervisor hands us a stream instead of a datagram socket pair
//! (QEMU-style), each Ethernet frame travels as:
//!
//! ```text
//! ┌──────────────┬──────────────────┐
//! │ length (2 B) │ frame (N bytes)  │
//! └──────────────┴──────────────────┘
//! ```
//!
//! - **length**: `u16` little-endian, size of the frame only.
//! - **frame**: a complete Ethernet frame, header included.
//!
//! The datagram backend carries exactly one frame per datagram and does not
//! use this prefix.

use crate::ProtocolError;

/// Size of the length prefix.
pub const PREFIX_SIZE: usize = 2;

/// Largest frame the prefix can carry.
pub const MAX_FRAME: usize = u16::MAX as usize;

/// Emit one length-prefixed frame.
pub fn emit(frame: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if frame.len() > MAX_FRAME {
        return Err(ProtocolError::InvalidFrame(format!(
            "frame of {} bytes exceeds u16 prefix",
            frame.len()
        )));
    }
    let mut out = Vec::with_capacity(PREFIX_SIZE + frame.len());
    out.extend_from_slice(&(frame.len() as u16).to_le_bytes());
    out.extend_from_slice(frame);
    Ok(out)
}

/// Parse one frame from the front of `buf`. Returns the frame and the number
/// of bytes consumed, or `None` when more data is needed.
pub fn parse(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    if buf.len() < PREFIX_SIZE {
        return None;
    }
    let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < PREFIX_SIZE + len {
        return None;
    }
    Some((buf[PREFIX_SIZE..PREFIX_SIZE + len].to_vec(), PREFIX_SIZE + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let frame = vec![0xAAu8; 1514];
        let wire = emit(&frame).unwrap();
        let (parsed, used) = parse(&wire).unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(used, wire.len());
    }

    #[test]
    fn partial_input_needs_more() {
        let wire = emit(&[1, 2, 3]).unwrap();
        assert!(parse(&wire[..1]).is_none());
        assert!(parse(&wire[..3]).is_none());
        assert!(parse(&wire).is_some());
    }

    #[test]
    fn oversized_frame_rejected() {
        let frame = vec![0u8; MAX_FRAME + 1];
        assert!(emit(&frame).is_err());
    }
}
