use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, RawFd};

use nix::libc;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use tracing::debug;

use super::interface::{convert_timeout, AsBackend};
use crate::reporter;
use crate::source::SourceHandle;

pub struct PollBackend {
    // Deadlines arrive through a monotonic timer fd, exactly as in the
    // epoll backend; it occupies the first slot of the pollfd array and is
    // never in fd_map.
    timer: TimerFd,
    event_buffer: Vec<libc::pollfd>,
    fd_map: HashMap<RawFd, SourceHandle>,
}

impl PollBackend {
    pub fn new() -> Self {
        debug!("using poll main loop");

        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .unwrap_or_else(|e| reporter::fatal_error(&format!("failed to initialize timerfd: {e}")));

        let timer_fd = timer.as_fd().as_raw_fd();
        let event_buffer = vec![libc::pollfd {
            fd: timer_fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        debug!(fd = timer_fd, "added timerfd");

        Self {
            timer,
            event_buffer,
            fd_map: HashMap::new(),
        }
    }

    fn timer_fd(&self) -> RawFd {
        self.timer.as_fd().as_raw_fd()
    }

    fn drain_timer(&self) {
        let mut elapsed = [0u8; 8];
        let _ = nix::unistd::read(self.timer_fd(), &mut elapsed);
    }
}

impl AsBackend for PollBackend {
    fn register_fd(&mut self, fd: RawFd, src: &SourceHandle) -> bool {
        if self.event_buffer.iter().any(|entry| entry.fd == fd) {
            return false;
        }

        debug!(fd, tag = src.borrow().tag(), "registered fd");
        self.fd_map.insert(fd, src.clone());
        self.event_buffer.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        true
    }

    fn unregister_fd(&mut self, fd: RawFd) -> bool {
        let Some(pos) = self.event_buffer.iter().position(|entry| entry.fd == fd) else {
            return false;
        };

        debug!(fd, "unregistered fd");
        self.event_buffer.remove(pos);
        self.fd_map.remove(&fd);
        true
    }

    fn poll(&mut self, ready: &mut Vec<SourceHandle>, timeout: f64, timeout_src: Option<&SourceHandle>) {
        // An all-zero itimerspec disarms a timerfd rather than expiring it
        // immediately, so a zero timeout has to travel down to poll()
        // itself.
        let poll_timeout = if timeout != 0.0 {
            let spec = convert_timeout(timeout);
            if let Err(e) = self.timer.set(Expiration::OneShot(spec), TimerSetTimeFlags::empty()) {
                reporter::internal_warning(&format!("failed to arm loop timerfd: {e}"));
            }
            -1
        } else {
            let _ = self.timer.unset();
            0
        };

        let ret = unsafe {
            libc::poll(
                self.event_buffer.as_mut_ptr(),
                self.event_buffer.len() as libc::nfds_t,
                poll_timeout,
            )
        };

        if ret == -1 {
            if nix::errno::Errno::last() != nix::errno::Errno::EINTR {
                reporter::internal_warning(&format!(
                    "error calling poll: {}",
                    nix::errno::Errno::last()
                ));
            }
        } else if ret == 0 {
            if let Some(src) = timeout_src {
                ready.push(src.clone());
            }
        } else {
            let timer_fd = self.timer_fd();
            for i in 0..self.event_buffer.len() {
                let entry = self.event_buffer[i];
                if entry.fd == timer_fd && entry.revents == libc::POLLIN {
                    // Time advanced past the deadline: whatever else woke up
                    // alongside the timer waits for the next tick.
                    self.drain_timer();
                    ready.clear();
                    if let Some(src) = timeout_src {
                        ready.push(src.clone());
                    }
                    break;
                }

                let Some(src) = self.fd_map.get(&entry.fd) else {
                    continue;
                };

                if entry.revents == entry.events {
                    ready.push(src.clone());
                } else if entry.revents == libc::POLLNVAL {
                    reporter::internal_warning(&format!(
                        "source {} fd {} was closed during poll",
                        src.borrow().tag(),
                        entry.fd
                    ));
                } else if entry.revents == libc::POLLERR || entry.revents == libc::POLLHUP {
                    reporter::internal_warning(&format!(
                        "source {} returned an error from poll ({:#x})",
                        src.borrow().tag(),
                        entry.revents
                    ));
                }
            }
        }
    }

    fn fds(&self) -> Vec<RawFd> {
        self.fd_map.keys().copied().collect()
    }
}
