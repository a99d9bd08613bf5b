//! Component registry resolving `prefix::path` source specifications to
//! packet-source and packet-dumper factories.
use crate::pktsrc::{PktDumperHandle, PktSrcHandle};

const DEFAULT_PREFIX: &str = "pcap";

/// Splits a `prefix::rest` source specification; a missing prefix selects
/// the default packet source type. Prefixes match case-sensitively.
pub fn split_prefix(path: &str) -> (&str, &str) {
    match path.split_once("::") {
        Some((prefix, rest)) => (prefix, rest),
        None => (DEFAULT_PREFIX, path),
    }
}

pub trait PktSrcComponent {
    fn name(&self) -> &str;

    fn handles_prefix(&self, prefix: &str) -> bool;

    /// Whether this component can capture from a live interface.
    fn does_live(&self) -> bool;

    /// Whether this component can replay a recorded trace.
    fn does_trace(&self) -> bool;

    fn instantiate(&self, path: &str, is_live: bool) -> PktSrcHandle;
}

pub trait PktDumperComponent {
    fn name(&self) -> &str;

    fn handles_prefix(&self, prefix: &str) -> bool;

    fn instantiate(&self, path: &str, append: bool) -> PktDumperHandle;
}

#[derive(Default)]
pub struct PluginRegistry {
    pkt_srcs: Vec<Box<dyn PktSrcComponent>>,
    pkt_dumpers: Vec<Box<dyn PktDumperComponent>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pkt_src(&mut self, component: Box<dyn PktSrcComponent>) {
        self.pkt_srcs.push(component);
    }

    pub fn add_pkt_dumper(&mut self, component: Box<dyn PktDumperComponent>) {
        self.pkt_dumpers.push(component);
    }

    /// First registered source component matching the prefix and mode.
    pub fn find_pkt_src(&self, prefix: &str, is_live: bool) -> Option<&dyn PktSrcComponent> {
        self.pkt_srcs.iter().map(|c| c.as_ref()).find(|c| {
            c.handles_prefix(prefix)
                && ((is_live && c.does_live()) || (!is_live && c.does_trace()))
        })
    }

    pub fn find_pkt_dumper(&self, prefix: &str) -> Option<&dyn PktDumperComponent> {
        self.pkt_dumpers
            .iter()
            .map(|c| c.as_ref())
            .find(|c| c.handles_prefix(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_prefix_with_explicit_prefix() {
        assert_eq!(split_prefix("myplugin::/dev/eth0"), ("myplugin", "/dev/eth0"));
    }

    #[test]
    fn split_prefix_defaults_to_pcap() {
        assert_eq!(split_prefix("trace.pcap"), ("pcap", "trace.pcap"));
    }

    #[test]
    fn split_prefix_takes_first_separator() {
        assert_eq!(split_prefix("a::b::c"), ("a", "b::c"));
    }

    #[test]
    fn empty_registry_finds_nothing() {
        let registry = PluginRegistry::new();
        assert!(registry.find_pkt_src("pcap", false).is_none());
        assert!(registry.find_pkt_dumper("pcap").is_none());
    }
}
