use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use tracing::debug;

use super::interface::{convert_timeout, AsBackend};
use crate::reporter;
use crate::source::SourceHandle;

pub struct EpollBackend {
    epoll: Epoll,
    // Epoll waits run with an infinite kernel timeout; deadlines arrive
    // through this monotonic timer fd instead. It is never in fd_map.
    timer: TimerFd,
    event_buffer: Vec<EpollEvent>,
    fd_map: HashMap<RawFd, SourceHandle>,
}

impl EpollBackend {
    pub fn new() -> Self {
        debug!("using epoll main loop");

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).unwrap_or_else(|e| {
            reporter::fatal_error(&format!("failed to open epoll file descriptor: {e}"))
        });

        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .unwrap_or_else(|e| reporter::fatal_error(&format!("failed to initialize timerfd: {e}")));

        let mut event_buffer = Vec::new();
        let timer_fd = timer.as_fd().as_raw_fd();
        let event = EpollEvent::new(EpollFlags::EPOLLIN, timer_fd as u64);
        if epoll.add(timer.as_fd(), event).is_ok() {
            debug!(fd = timer_fd, "added timerfd");
            event_buffer.push(EpollEvent::empty());
        }

        Self {
            epoll,
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

impl AsBackend for EpollBackend {
    fn register_fd(&mut self, fd: RawFd, src: &SourceHandle) -> bool {
        let event = EpollEvent::new(EpollFlags::EPOLLIN, fd as u64);
        match self.epoll.add(unsafe { BorrowedFd::borrow_raw(fd) }, event) {
            Ok(()) => {
                debug!(fd, tag = src.borrow().tag(), "registered fd");
                self.event_buffer.push(EpollEvent::empty());
                self.fd_map.insert(fd, src.clone());
                true
            }
            Err(e) => {
                debug!(fd, tag = src.borrow().tag(), error = %e, "failed to register fd");
                false
            }
        }
    }

    fn unregister_fd(&mut self, fd: RawFd) -> bool {
        if self.fd_map.remove(&fd).is_none() {
            return false;
        }

        if self.epoll.delete(unsafe { BorrowedFd::borrow_raw(fd) }).is_ok() {
            debug!(fd, "unregistered fd");
        }

        self.event_buffer.pop();
        true
    }

    fn poll(&mut self, ready: &mut Vec<SourceHandle>, timeout: f64, timeout_src: Option<&SourceHandle>) {
        // An all-zero itimerspec disarms a timerfd rather than expiring it
        // immediately, so a zero timeout has to travel down to epoll_wait
        // itself.
        let wait_timeout = if timeout != 0.0 {
            let spec = convert_timeout(timeout);
            if let Err(e) = self.timer.set(Expiration::OneShot(spec), TimerSetTimeFlags::empty()) {
                reporter::internal_warning(&format!("failed to arm loop timerfd: {e}"));
            }
            EpollTimeout::NONE
        } else {
            let _ = self.timer.unset();
            EpollTimeout::ZERO
        };

        match self.epoll.wait(&mut self.event_buffer, wait_timeout) {
            Err(Errno::EINTR) => {}
            Err(e) => reporter::internal_warning(&format!("error calling epoll: {e}")),
            Ok(0) => {
                if let Some(src) = timeout_src {
                    ready.push(src.clone());
                }
            }
            Ok(n) => {
                let timer_fd = self.timer_fd();
                for i in 0..n {
                    let event = self.event_buffer[i];
                    if event.data() == timer_fd as u64 && event.events() == EpollFlags::EPOLLIN {
                        // Time advanced past the deadline: whatever else woke
                        // up alongside the timer waits for the next tick.
                        self.drain_timer();
                        ready.clear();
                        if let Some(src) = timeout_src {
                            ready.push(src.clone());
                        }
                        break;
                    }

                    let Some(src) = self.fd_map.get(&(event.data() as RawFd)) else {
                        continue;
                    };

                    if event.events() == EpollFlags::EPOLLIN {
                        ready.push(src.clone());
                    } else if event.events() == EpollFlags::EPOLLERR
                        || event.events() == EpollFlags::EPOLLHUP
                    {
                        reporter::internal_warning(&format!(
                            "source {} returned an error from poll ({:?})",
                            src.borrow().tag(),
                            event.events()
                        ));
                    }
                }
            }
        }
    }

    fn fds(&self) -> Vec<RawFd> {
        self.fd_map.keys().copied().collect()
    }
}
