mod interface;

pub use interface::{convert_timeout, AsBackend};

#[cfg(all(not(feature = "poll"), target_os = "linux"))]
mod epoll;

#[cfg(all(not(feature = "poll"), target_os = "linux"))]
pub use epoll::EpollBackend as Backend;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
mod kqueue;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
pub use kqueue::KqueueBackend as Backend;

#[cfg(all(feature = "poll", target_os = "linux"))]
mod poll;

#[cfg(all(feature = "poll", target_os = "linux"))]
pub use poll::PollBackend as Backend;
