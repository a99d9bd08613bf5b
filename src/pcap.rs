//! Built-in packet components for the classic libpcap capture format,
//! registered under the default `pcap` prefix.
//!
//! The trace source replays a recorded file: it always asks for immediate
//! service while packets remain, advances its notion of network time from
//! the record timestamps, and goes dry at end of file. Live capture is not
//! provided here; a live-capable component can be registered alongside.
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::pktsrc::{Packet, PktDumper, PktDumperHandle, PktSrc, PktSrcHandle, PktSrcStats};
use crate::plugin::{PktDumperComponent, PktSrcComponent, PluginRegistry};
use crate::source::IoSource;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_MAGIC_SWAPPED: u32 = 0xd4c3_b2a1;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_SNAPLEN: u32 = 65535;
const DLT_EN10MB: u32 = 1;

const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;

// Upper bound on a sane capture record; larger lengths mean a corrupt file.
const MAX_RECORD_LEN: u32 = 0x0400_0000;

fn read_u32(big_endian: bool, bytes: &[u8]) -> u32 {
    let arr: [u8; 4] = bytes.try_into().unwrap();
    if big_endian {
        u32::from_be_bytes(arr)
    } else {
        u32::from_le_bytes(arr)
    }
}

pub struct TracePktSrc {
    path: String,
    tag: String,
    file: Option<BufReader<File>>,
    big_endian: bool,
    snaplen: u32,
    open: bool,
    error: Option<String>,
    last_ts: f64,
    stats: PktSrcStats,
}

impl TracePktSrc {
    pub fn new(path: &str) -> Self {
        let mut src = Self {
            path: path.to_string(),
            tag: format!("pcap::{path}"),
            file: None,
            big_endian: false,
            snaplen: PCAP_SNAPLEN,
            open: false,
            error: None,
            last_ts: 0.0,
            stats: PktSrcStats::default(),
        };

        match src.open_trace() {
            Ok(()) => src.open = true,
            Err(e) => src.error = Some(e.to_string()),
        }

        src
    }

    fn open_trace(&mut self) -> io::Result<()> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; GLOBAL_HEADER_LEN];
        reader.read_exact(&mut header)?;

        self.big_endian = match u32::from_le_bytes(header[0..4].try_into().unwrap()) {
            PCAP_MAGIC => false,
            PCAP_MAGIC_SWAPPED => true,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}: not a pcap capture file", self.path),
                ))
            }
        };
        self.snaplen = read_u32(self.big_endian, &header[16..20]);

        debug!(path = %self.path, big_endian = self.big_endian, "opened trace file");
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
        self.open = false;
    }
}

impl IoSource for TracePktSrc {
    fn done(&mut self) {
        debug!(path = %self.path, packets = self.stats.received, "closing trace file");
        self.close();
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn is_error(&self) -> bool {
        self.error.is_some()
    }

    fn next_timeout(&mut self) -> f64 {
        // Trace replay never waits: every remaining packet is due now.
        if self.open {
            0.0
        } else {
            -1.0
        }
    }

    fn process(&mut self) {
        let _ = self.next_packet();
    }

    fn tag(&self) -> &str {
        &self.tag
    }
}

impl PktSrc for TracePktSrc {
    fn set_error(&mut self, msg: &str) {
        self.error = Some(msg.to_string());
    }

    fn error_msg(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn current_time(&self) -> f64 {
        self.last_ts
    }

    fn next_packet(&mut self) -> Option<Packet> {
        let big_endian = self.big_endian;

        let reader = self.file.as_mut()?;
        let mut record = [0u8; RECORD_HEADER_LEN];
        match reader.read_exact(&mut record) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(path = %self.path, "trace exhausted");
                self.close();
                return None;
            }
            Err(e) => {
                self.error = Some(e.to_string());
                self.close();
                return None;
            }
        }

        let ts_sec = read_u32(big_endian, &record[0..4]);
        let ts_usec = read_u32(big_endian, &record[4..8]);
        let incl_len = read_u32(big_endian, &record[8..12]);
        let orig_len = read_u32(big_endian, &record[12..16]);

        if incl_len > MAX_RECORD_LEN {
            self.error = Some(format!("{}: corrupt record length {incl_len}", self.path));
            self.close();
            return None;
        }

        let reader = self.file.as_mut()?;
        let mut data = vec![0u8; incl_len as usize];
        if let Err(e) = reader.read_exact(&mut data) {
            self.error = Some(format!("{}: truncated record: {e}", self.path));
            self.close();
            return None;
        }

        self.last_ts = ts_sec as f64 + ts_usec as f64 / 1e6;
        self.stats.received += 1;

        Some(Packet {
            ts: self.last_ts,
            orig_len,
            data,
        })
    }

    fn stats(&self) -> PktSrcStats {
        self.stats
    }
}

pub struct PcapDumper {
    path: String,
    file: Option<File>,
    open: bool,
    error: Option<String>,
    needs_header: bool,
}

impl PcapDumper {
    pub fn new(path: &str, append: bool) -> Self {
        // An appended-to file that already has content keeps its header.
        let has_content = append
            && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }

        match options.open(path) {
            Ok(file) => Self {
                path: path.to_string(),
                file: Some(file),
                open: true,
                error: None,
                needs_header: !has_content,
            },
            Err(e) => Self {
                path: path.to_string(),
                file: None,
                open: false,
                error: Some(e.to_string()),
                needs_header: false,
            },
        }
    }

    fn write_global_header(file: &mut File) -> io::Result<()> {
        let mut header = Vec::with_capacity(GLOBAL_HEADER_LEN);
        header.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
        header.extend_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
        header.extend_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&PCAP_SNAPLEN.to_le_bytes());
        header.extend_from_slice(&DLT_EN10MB.to_le_bytes());
        file.write_all(&header)
    }
}

impl PktDumper for PcapDumper {
    fn init(&mut self) {
        if !self.needs_header {
            return;
        }

        if let Some(file) = self.file.as_mut() {
            match Self::write_global_header(file) {
                Ok(()) => self.needs_header = false,
                Err(e) => {
                    self.error = Some(e.to_string());
                    self.open = false;
                }
            }
        }
    }

    fn done(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
        self.file = None;
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn is_error(&self) -> bool {
        self.error.is_some()
    }

    fn set_error(&mut self, msg: &str) {
        self.error = Some(msg.to_string());
    }

    fn error_msg(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn dump(&mut self, pkt: &Packet) -> io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "dumper is closed"));
        };

        let ts_sec = pkt.ts.floor();
        let ts_usec = ((pkt.ts - ts_sec) * 1e6).round() as u32;
        let incl_len = pkt.data.len() as u32;

        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + pkt.data.len());
        record.extend_from_slice(&(ts_sec as u32).to_le_bytes());
        record.extend_from_slice(&ts_usec.to_le_bytes());
        record.extend_from_slice(&incl_len.to_le_bytes());
        record.extend_from_slice(&pkt.orig_len.max(incl_len).to_le_bytes());
        record.extend_from_slice(&pkt.data);
        file.write_all(&record)
    }
}

pub struct PcapComponent;

impl PktSrcComponent for PcapComponent {
    fn name(&self) -> &str {
        "pcap"
    }

    fn handles_prefix(&self, prefix: &str) -> bool {
        prefix == "pcap"
    }

    fn does_live(&self) -> bool {
        false
    }

    fn does_trace(&self) -> bool {
        true
    }

    fn instantiate(&self, path: &str, _is_live: bool) -> PktSrcHandle {
        Rc::new(RefCell::new(TracePktSrc::new(path)))
    }
}

pub struct PcapDumperComponent;

impl PktDumperComponent for PcapDumperComponent {
    fn name(&self) -> &str {
        "pcap"
    }

    fn handles_prefix(&self, prefix: &str) -> bool {
        prefix == "pcap"
    }

    fn instantiate(&self, path: &str, append: bool) -> PktDumperHandle {
        Rc::new(RefCell::new(PcapDumper::new(path, append)))
    }
}

/// Registers the built-in trace components under the default prefix.
pub fn register_components(registry: &mut PluginRegistry) {
    registry.add_pkt_src(Box::new(PcapComponent));
    registry.add_pkt_dumper(Box::new(PcapDumperComponent));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("iomux_pcap_{}_{}", std::process::id(), name))
    }

    fn sample_packets() -> Vec<Packet> {
        vec![
            Packet {
                ts: 1_600_000_000.25,
                orig_len: 4,
                data: vec![0xde, 0xad, 0xbe, 0xef],
            },
            Packet {
                ts: 1_600_000_001.5,
                orig_len: 128,
                data: vec![0x01, 0x02, 0x03],
            },
        ]
    }

    fn write_trace(path: &std::path::Path, packets: &[Packet], append: bool) {
        let mut dumper = PcapDumper::new(path.to_str().unwrap(), append);
        dumper.init();
        assert!(dumper.is_open());
        for pkt in packets {
            dumper.dump(pkt).unwrap();
        }
        dumper.done();
    }

    #[test]
    fn dump_then_replay_roundtrips() {
        let path = temp_path("roundtrip.pcap");
        let packets = sample_packets();
        write_trace(&path, &packets, false);

        let mut src = TracePktSrc::new(path.to_str().unwrap());
        assert!(src.is_open());
        assert!(!src.is_error());
        assert_eq!(src.next_timeout(), 0.0);

        let first = src.next_packet().unwrap();
        assert_eq!(first.data, packets[0].data);
        assert_eq!(first.orig_len, 4);
        assert!((first.ts - packets[0].ts).abs() < 1e-5);

        let second = src.next_packet().unwrap();
        assert_eq!(second.data, packets[1].data);
        assert_eq!(second.orig_len, 128);

        // EOF closes the source.
        assert!(src.next_packet().is_none());
        assert!(!src.is_open());
        assert!(!src.is_error());
        assert_eq!(src.stats().received, 2);
        assert!((src.current_time() - packets[1].ts).abs() < 1e-5);

        fs::remove_file(&path).ok();
    }

    #[test]
    fn append_keeps_existing_header() {
        let path = temp_path("append.pcap");
        let packets = sample_packets();
        write_trace(&path, &packets[..1], false);
        write_trace(&path, &packets[1..], true);

        let mut src = TracePktSrc::new(path.to_str().unwrap());
        assert!(src.next_packet().is_some());
        assert!(src.next_packet().is_some());
        assert!(src.next_packet().is_none());

        fs::remove_file(&path).ok();
    }

    #[test]
    fn swapped_byte_order_is_understood() {
        let path = temp_path("swapped.pcap");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&PCAP_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&PCAP_VERSION_MAJOR.to_be_bytes());
        bytes.extend_from_slice(&PCAP_VERSION_MINOR.to_be_bytes());
        bytes.extend_from_slice(&0i32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&PCAP_SNAPLEN.to_be_bytes());
        bytes.extend_from_slice(&DLT_EN10MB.to_be_bytes());
        // One two-byte record.
        bytes.extend_from_slice(&7u32.to_be_bytes());
        bytes.extend_from_slice(&500_000u32.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&[0xaa, 0xbb]);
        fs::write(&path, &bytes).unwrap();

        let mut src = TracePktSrc::new(path.to_str().unwrap());
        assert!(src.is_open());
        let pkt = src.next_packet().unwrap();
        assert_eq!(pkt.data, vec![0xaa, 0xbb]);
        assert!((pkt.ts - 7.5).abs() < 1e-9);

        fs::remove_file(&path).ok();
    }

    #[test]
    fn garbage_file_is_an_open_error() {
        let path = temp_path("garbage.pcap");
        fs::write(&path, b"this is not a capture").unwrap();

        let src = TracePktSrc::new(path.to_str().unwrap());
        assert!(!src.is_open());
        assert!(src.is_error());

        fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let src = TracePktSrc::new("/nonexistent/iomux/trace.pcap");
        assert!(!src.is_open());
        assert!(src.is_error());
        assert!(src.error_msg().is_some());
    }

    #[test]
    fn truncated_record_sets_error() {
        let path = temp_path("truncated.pcap");
        let packets = sample_packets();
        write_trace(&path, &packets[..1], false);
        // Chop the record body short.
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();

        let mut src = TracePktSrc::new(path.to_str().unwrap());
        assert!(src.next_packet().is_none());
        assert!(!src.is_open());
        assert!(src.is_error());

        fs::remove_file(&path).ok();
    }
}
