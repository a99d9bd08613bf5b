use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use kqueue_sys::{kevent, kqueue, EventFilter, EventFlag, FilterFlag};
use nix::errno::Errno;
use nix::libc;
use tracing::debug;

use super::interface::{convert_timeout, AsBackend};
use crate::reporter;
use crate::source::SourceHandle;

pub struct KqueueBackend {
    kq: OwnedFd,
    // Output buffer for the wait call only; the registered events live in
    // the queue itself. Grows by one slot per registration so a single wait
    // can surface every tracked fd.
    event_buffer: Vec<kevent>,
    fd_map: HashMap<RawFd, SourceHandle>,
}

impl KqueueBackend {
    pub fn new() -> Self {
        debug!("using kqueue main loop");

        let kq_fd = unsafe { kqueue() };
        if kq_fd == -1 {
            reporter::fatal_error(&format!("failed to initialize kqueue: {}", Errno::last()));
        }
        let kq = unsafe { OwnedFd::from_raw_fd(kq_fd) };

        Self {
            kq,
            event_buffer: Vec::new(),
            fd_map: HashMap::new(),
        }
    }
}

impl AsBackend for KqueueBackend {
    fn register_fd(&mut self, fd: RawFd, src: &SourceHandle) -> bool {
        let event = kevent::new(
            fd as _,
            EventFilter::EVFILT_READ,
            EventFlag::EV_ADD,
            FilterFlag::empty(),
        );
        let changelist = [event];
        let ret = unsafe {
            kevent(
                self.kq.as_raw_fd(),
                changelist.as_ptr(),
                changelist.len() as _,
                core::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };

        if ret == -1 {
            debug!(fd, tag = src.borrow().tag(), error = %Errno::last(), "failed to register fd");
            return false;
        }

        debug!(fd, tag = src.borrow().tag(), "registered fd");
        self.event_buffer.push(unsafe { std::mem::zeroed() });
        self.fd_map.insert(fd, src.clone());
        true
    }

    fn unregister_fd(&mut self, fd: RawFd) -> bool {
        if !self.fd_map.contains_key(&fd) {
            return false;
        }

        let event = kevent::new(
            fd as _,
            EventFilter::EVFILT_READ,
            EventFlag::EV_DELETE,
            FilterFlag::empty(),
        );
        let changelist = [event];
        let ret = unsafe {
            kevent(
                self.kq.as_raw_fd(),
                changelist.as_ptr(),
                changelist.len() as _,
                core::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if ret != -1 {
            debug!(fd, "unregistered fd");
        }

        self.event_buffer.pop();
        self.fd_map.remove(&fd);
        true
    }

    fn poll(&mut self, ready: &mut Vec<SourceHandle>, timeout: f64, timeout_src: Option<&SourceHandle>) {
        let spec = convert_timeout(timeout);
        let kq_timeout = libc::timespec {
            tv_sec: spec.tv_sec(),
            tv_nsec: spec.tv_nsec(),
        };

        let ret = unsafe {
            kevent(
                self.kq.as_raw_fd(),
                std::ptr::null(),
                0,
                self.event_buffer.as_mut_ptr(),
                self.event_buffer.len() as _,
                &kq_timeout,
            )
        };

        if ret == -1 {
            // Interrupts happen during shutdown; stay quiet about those.
            if Errno::last() != Errno::EINTR {
                reporter::internal_warning(&format!("error calling kevent: {}", Errno::last()));
            }
        } else if ret == 0 {
            if let Some(src) = timeout_src {
                ready.push(src.clone());
            }
        } else {
            // kevent reports how many events are ready, so only that many
            // entries of the buffer are meaningful.
            for event in &self.event_buffer[..ret as usize] {
                if event.filter == EventFilter::EVFILT_READ {
                    if let Some(src) = self.fd_map.get(&(event.ident as RawFd)) {
                        ready.push(src.clone());
                    }
                }
            }
        }
    }

    fn fds(&self) -> Vec<RawFd> {
        self.fd_map.keys().copied().collect()
    }
}
