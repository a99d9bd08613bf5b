//! A one-bit, level-triggered wakeup signal exposed as a pollable fd.
//!
//! Backed by a non-blocking pipe rather than an eventfd so the same
//! primitive works under every backend, kqueue included. `fire` only ever
//! issues a single write(2), which keeps it usable from signal handlers.
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::unistd;

use crate::reporter;
use crate::utils::set_fd_nonblocking;

pub struct Flare {
    read: OwnedFd,
    write: OwnedFd,
}

impl Flare {
    pub fn new() -> Self {
        let (read, write) = unistd::pipe()
            .unwrap_or_else(|e| reporter::fatal_error(&format!("failed to create wakeup pipe: {e}")));

        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            if let Err(e) = set_fd_nonblocking(fd) {
                reporter::fatal_error(&format!("failed to set wakeup pipe non-blocking: {e}"));
            }
        }

        Self { read, write }
    }

    /// The fd to watch for readability.
    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Makes the fd readable. Safe from any thread and from signal
    /// handlers: EAGAIN means the pipe already holds unread bytes, which is
    /// all a level-triggered one-bit signal needs.
    pub fn fire(&self) {
        let buf = [0u8; 1];
        loop {
            match unistd::write(&self.write, &buf) {
                Ok(n) if n > 0 => break,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }

    /// Drains the signal back to not-readable.
    pub fn extinguish(&self) {
        let mut buf = [0u8; 32];
        loop {
            match unistd::read(self.read.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn is_readable(flare: &Flare) -> bool {
        let mut buf = [0u8; 1];
        match unistd::read(flare.fd(), &mut buf) {
            Ok(n) => n > 0,
            Err(_) => false,
        }
    }

    #[test]
    fn fire_makes_readable_once() {
        let flare = Flare::new();
        flare.fire();
        assert!(is_readable(&flare));
    }

    #[test]
    fn extinguish_drains_repeated_fires() {
        let flare = Flare::new();
        flare.fire();
        flare.fire();
        flare.fire();
        flare.extinguish();
        assert!(!is_readable(&flare));
    }

    #[test]
    fn extinguish_without_fire_is_harmless() {
        let flare = Flare::new();
        flare.extinguish();
        assert!(!is_readable(&flare));
    }

    #[test]
    fn fire_from_other_thread() {
        let flare = Arc::new(Flare::new());
        let remote = flare.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.fire();
        });

        let start = Instant::now();
        let mut buf = [0u8; 1];
        loop {
            match unistd::read(flare.fd(), &mut buf) {
                Ok(n) if n > 0 => break,
                _ => {
                    assert!(start.elapsed() < Duration::from_secs(5), "flare never fired");
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
        handle.join().unwrap();
    }
}
