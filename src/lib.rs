//! I/O source multiplexer for a network monitoring engine.
//!
//! The loop driver ([`Mux`]) owns a set of registered event producers
//! (packet sources, message buses, command channels, timer managers) and on
//! each tick selects the subset that is ready to be serviced, using the
//! most efficient readiness primitive the host OS provides: epoll on Linux,
//! kqueue on the BSD family, or portable poll(2) behind the `poll` cargo
//! feature. A pipe-backed flare lets other threads knock the loop out of a
//! blocking wait.
pub mod backend;
pub mod conf;
pub mod flare;
pub mod json;
pub mod mux;
pub mod pcap;
pub mod pktsrc;
pub mod plugin;
pub mod reporter;
pub mod scope;
pub mod source;
pub mod table;
mod utils;

pub use mux::{Mux, Waker};
pub use source::{IoSource, SourceHandle};
