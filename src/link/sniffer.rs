//! Classic pcap capture of link traffic.
//!
//! Writes the legacy pcap format (magic 0xa1b2c3d4, version 2.4, LINKTYPE
//! Ethernet) so captures open directly in Wireshark/tcpdump. One writer is
//! shared by both directions; records carry wall-clock timestamps.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::Result;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const LINKTYPE_ETHERNET: u32 = 1;

pub struct PcapWriter {
    file: Mutex<BufWriter<File>>,
    snaplen: u32,
}

impl PcapWriter {
    pub fn create(path: impl AsRef<Path>, snaplen: u32) -> Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_u32::<LittleEndian>(PCAP_MAGIC)?;
        out.write_u16::<LittleEndian>(PCAP_VERSION_MAJOR)?;
        out.write_u16::<LittleEndian>(PCAP_VERSION_MINOR)?;
        out.write_i32::<LittleEndian>(0)?; // thiszone
        out.write_u32::<LittleEndian>(0)?; // sigfigs
        out.write_u32::<LittleEndian>(snaplen)?;
        out.write_u32::<LittleEndian>(LINKTYPE_ETHERNET)?;
        out.flush()?;
        Ok(Self {
            file: Mutex::new(out),
            snaplen,
        })
    }

    /// Append one frame. Truncates to the snap length but records the
    /// original size.
    pub fn record(&self, frame: &[u8]) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let captured = frame.len().min(self.snaplen as usize);

        let mut out = self.file.lock().expect("pcap lock poisoned");
        out.write_u32::<LittleEndian>(now.as_secs() as u32)?;
        out.write_u32::<LittleEndian>(now.subsec_micros())?;
        out.write_u32::<LittleEndian>(captured as u32)?;
        out.write_u32::<LittleEndian>(frame.len() as u32)?;
        out.write_all(&frame[..captured])?;
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_record_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcap");
        let writer = PcapWriter::create(&path, 65535).unwrap();
        writer.record(&[0xABu8; 60]).unwrap();
        drop(writer);

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..4], &PCAP_MAGIC.to_le_bytes());
        // 24-byte global header + 16-byte record header + 60 bytes of frame.
        assert_eq!(raw.len(), 24 + 16 + 60);
        let incl = u32::from_le_bytes(raw[32..36].try_into().unwrap());
        let orig = u32::from_le_bytes(raw[36..40].try_into().unwrap());
        assert_eq!(incl, 60);
        assert_eq!(orig, 60);
    }

    #[test]
    fn snaplen_truncates_but_keeps_original_len() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.pcap");
        let writer = PcapWriter::create(&path, 32).unwrap();
        writer.record(&[0xCDu8; 100]).unwrap();
        drop(writer);

        let raw = std::fs::read(&path).unwrap();
        let incl = u32::from_le_bytes(raw[32..36].try_into().unwrap());
        let orig = u32::from_le_bytes(raw[36..40].try_into().unwrap());
        assert_eq!(incl, 32);
        assert_eq!(orig, 100);
    }
}
