//! Capability contracts for packet sources and dumpers.
//!
//! Concrete implementations arrive through the component registry; the
//! loop only depends on what is defined here.
use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use crate::source::IoSource;

pub type PktSrcHandle = Rc<RefCell<dyn PktSrc>>;
pub type PktDumperHandle = Rc<RefCell<dyn PktDumper>>;

/// A captured packet handed between sources and dumpers.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Capture timestamp, seconds since the epoch.
    pub ts: f64,
    /// Original length on the wire.
    pub orig_len: u32,
    /// Captured bytes, possibly truncated to the snap length.
    pub data: Vec<u8>,
}

/// Counters a packet source keeps about its own operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PktSrcStats {
    pub received: u64,
    pub dropped: u64,
}

pub trait PktSrc: IoSource {
    /// Attaches an error message, e.g. when the source failed to open.
    fn set_error(&mut self, msg: &str);

    fn error_msg(&self) -> Option<&str>;

    /// The capture path this source was opened with.
    fn path(&self) -> &str;

    /// Timestamp of the last delivered packet; this is what advances
    /// network time during trace replay.
    fn current_time(&self) -> f64;

    /// Pulls the next packet if one is available right now.
    fn next_packet(&mut self) -> Option<Packet>;

    fn stats(&self) -> PktSrcStats;
}

pub trait PktDumper {
    /// One-shot setup after construction, e.g. writing a file header.
    fn init(&mut self) {}

    /// Finalization before shutdown.
    fn done(&mut self) {}

    fn is_open(&self) -> bool;

    fn is_error(&self) -> bool {
        false
    }

    fn set_error(&mut self, msg: &str);

    fn error_msg(&self) -> Option<&str>;

    fn path(&self) -> &str;

    /// Appends one packet record.
    fn dump(&mut self, pkt: &Packet) -> io::Result<()>;
}
