//! The main-loop driver.
//!
//! Owns the registered sources, elects the nearest timeout each tick,
//! drives the build-time poll backend, and exposes the flare-based wakeup
//! that is the one supported cross-thread path into the loop.
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use crate::backend::{AsBackend, Backend};
use crate::conf::{self, Config};
use crate::flare::Flare;
use crate::pktsrc::{PktDumperHandle, PktSrcHandle};
use crate::plugin::{split_prefix, PluginRegistry};
use crate::reporter;
use crate::source::{IoSource, SourceHandle};
use crate::table::SourceTable;

/// Ticks a zero-timeout source may monopolize before the backend is polled
/// anyway, so fd-bearing sources cannot starve behind it.
const ZERO_TIMEOUT_POLL_INTERVAL: u32 = 100;

/// The source wrapped around the wakeup flare: readable exactly when
/// someone has pinged the loop, drained on service.
struct WakeupHandler {
    flare: Arc<Flare>,
}

impl IoSource for WakeupHandler {
    fn is_open(&self) -> bool {
        true
    }

    fn process(&mut self) {
        self.flare.extinguish();
    }

    fn tag(&self) -> &str {
        "wakeup-handler"
    }
}

/// Cross-thread handle that knocks a blocked tick out of its wait. Safe to
/// keep around after the driver is gone: firing then writes into a pipe
/// nobody reads, which is a no-op.
#[derive(Clone)]
pub struct Waker {
    flare: Arc<Flare>,
}

impl Waker {
    pub fn wakeup(&self, from: &str) {
        debug!(from, "pinging wakeup flare");
        self.flare.fire();
    }

    /// Variant without logging, for signal-handler context.
    pub fn wakeup_from_signal(&self) {
        self.flare.fire();
    }
}

pub struct Mux {
    table: SourceTable,
    backend: Backend,
    flare: Arc<Flare>,
    wakeup: SourceHandle,
    plugins: PluginRegistry,
    pkt_src: Option<PktSrcHandle>,
    pkt_dumpers: Vec<PktDumperHandle>,
    exit_only_after_terminate: bool,
    zero_timeout_count: u32,
}

impl Mux {
    pub fn new(config: &Config, plugins: PluginRegistry) -> Self {
        let mut backend = Backend::new();

        let flare = Arc::new(Flare::new());
        let wakeup: SourceHandle = Rc::new(RefCell::new(WakeupHandler {
            flare: flare.clone(),
        }));
        backend.register_fd(flare.fd(), &wakeup);

        Self {
            table: SourceTable::new(),
            backend,
            flare,
            wakeup,
            plugins,
            pkt_src: None,
            pkt_dumpers: Vec::new(),
            exit_only_after_terminate: config.exit_only_after_terminate,
            zero_timeout_count: 0,
        }
    }

    /// Adds a source to the loop. Registering a source twice only
    /// reconciles its `dont_count` flag; `init_source` runs on the first
    /// registration only.
    pub fn register(&mut self, src: &SourceHandle, dont_count: bool) {
        if self.table.reconcile(src, dont_count) {
            return;
        }

        src.borrow_mut().init_source();
        self.table.insert(src.clone(), dont_count);
    }

    /// Adds a packet source, which always counts toward keeping the loop
    /// alive, and remembers it as the primary one.
    pub fn register_pkt_src(&mut self, src: &PktSrcHandle) {
        self.pkt_src = Some(src.clone());
        let handle: SourceHandle = src.clone();
        self.register(&handle, false);
    }

    /// Starts readiness tracking for an fd on behalf of `src` and pings the
    /// loop so a blocked tick picks up the change.
    pub fn register_fd(&mut self, fd: RawFd, src: &SourceHandle) {
        if self.backend.register_fd(fd, src) {
            self.wakeup("register_fd");
        }
    }

    pub fn unregister_fd(&mut self, fd: RawFd) {
        if self.backend.unregister_fd(fd) {
            self.wakeup("unregister_fd");
        }
    }

    /// Fires the wakeup flare. The one operation on the driver that may be
    /// reached from other threads goes through [`Waker`]; this method is the
    /// loop-local equivalent.
    pub fn wakeup(&self, from: &str) {
        debug!(from, "pinging wakeup flare");
        self.flare.fire();
    }

    /// A sendable handle for waking the loop from other threads.
    pub fn waker(&self) -> Waker {
        Waker {
            flare: self.flare.clone(),
        }
    }

    /// Drains the loop: no source counts toward keeping it alive anymore,
    /// so the next tick reports termination. The source list itself is left
    /// untouched.
    pub fn remove_all(&mut self) {
        self.table.mark_all_dont_count();
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Number of sources that justify keeping the loop alive.
    pub fn countable_size(&self) -> usize {
        self.table.countable_size()
    }

    /// Whether the main program should exit: nothing countable remains and
    /// either exits are unconditional or the engine is already terminating.
    pub fn should_exit(&self) -> bool {
        self.countable_size() == 0 && (!self.exit_only_after_terminate || conf::terminating())
    }

    pub fn pkt_src(&self) -> Option<&PktSrcHandle> {
        self.pkt_src.as_ref()
    }

    /// Fds the backend currently tracks for sources (the wakeup flare
    /// included, the backend's private fds excluded).
    pub fn tracked_fds(&self) -> Vec<RawFd> {
        self.backend.fds()
    }

    /// Computes the set of sources to service on this tick.
    ///
    /// In order: prune at most one dry source, check for termination, elect
    /// the nearest timeout, take the zero-timeout fast path when allowed,
    /// otherwise poll the backend. An empty result after the termination
    /// check is the caller's signal to exit the main program.
    pub fn find_ready_sources(&mut self, ready: &mut Vec<SourceHandle>) {
        ready.clear();

        self.table.prune_one_dry();

        if self.should_exit() {
            return;
        }

        let mut timeout = -1.0f64;
        let mut timeout_src: Option<SourceHandle> = None;

        for entry in self.table.iter() {
            if !entry.src.borrow().is_open() {
                continue;
            }

            let next = entry.src.borrow_mut().next_timeout();
            // NaN and out-of-band negatives mean "no preference".
            if !next.is_finite() || next < 0.0 {
                continue;
            }

            if timeout < 0.0 || next < timeout {
                timeout = next;
                timeout_src = Some(entry.src.clone());
            }
        }

        // A zero timeout wants service right now; skip the backend and hand
        // the winner straight back. Every ZERO_TIMEOUT_POLL_INTERVAL-th
        // consecutive occurrence still polls, so the kernel gets a chance to
        // report other ready fds.
        if timeout == 0.0 {
            self.zero_timeout_count += 1;
            if self.zero_timeout_count % ZERO_TIMEOUT_POLL_INTERVAL != 0 {
                if let Some(src) = &timeout_src {
                    ready.push(src.clone());
                }
                return;
            }
        }
        self.zero_timeout_count = 0;

        self.backend.poll(ready, timeout, timeout_src.as_ref());

        self.service_wakeups(ready);
    }

    /// Extinguishes the flare when the poll surfaced it. The wakeup handler
    /// is loop machinery, not a caller-visible source, so a pure wakeup
    /// leaves the ready set empty.
    fn service_wakeups(&self, ready: &mut Vec<SourceHandle>) {
        ready.retain(|src| {
            if Rc::ptr_eq(src, &self.wakeup) {
                src.borrow_mut().process();
                false
            } else {
                true
            }
        });
    }

    /// Opens a packet source through the component registry. No matching
    /// component is a fatal error; a source that failed to open is still
    /// registered, carrying a canned error message.
    pub fn open_pkt_src(&mut self, path: &str, is_live: bool) -> PktSrcHandle {
        let (prefix, npath) = split_prefix(path);

        let Some(component) = self.plugins.find_pkt_src(prefix, is_live) else {
            reporter::fatal_error(&format!(
                "type of packet source '{prefix}' not recognized, or mode not supported"
            ));
        };

        let ps = component.instantiate(npath, is_live);

        if !ps.borrow().is_open() && ps.borrow().is_error() {
            ps.borrow_mut().set_error("could not open");
        }

        debug!(component = component.name(), path = npath, "created packet source");

        self.register_pkt_src(&ps);
        ps
    }

    /// Opens a packet dumper through the component registry. No matching
    /// component is a fatal error.
    pub fn open_pkt_dumper(&mut self, path: &str, append: bool) -> PktDumperHandle {
        let (prefix, npath) = split_prefix(path);

        let Some(component) = self.plugins.find_pkt_dumper(prefix) else {
            reporter::fatal_error(&format!("type of packet dumper '{prefix}' not recognized"));
        };

        let pd = component.instantiate(npath, append);

        if !pd.borrow().is_open() && pd.borrow().is_error() {
            pd.borrow_mut().set_error("could not open");
        }

        debug!(component = component.name(), path = npath, "created packet dumper");

        pd.borrow_mut().init();
        self.pkt_dumpers.push(pd.clone());
        pd
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        for entry in self.table.drain() {
            entry.src.borrow_mut().done();
        }

        for dumper in self.pkt_dumpers.drain(..) {
            dumper.borrow_mut().done();
        }

        // The wakeup handler goes last, so a straggling wakeup still lands
        // on a live fd until every other source is finalized.
        self.backend.unregister_fd(self.flare.fd());
    }
}
