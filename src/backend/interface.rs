//! Abstraction over the readiness notification systems the host operating
//! systems provide.
//!
//! Each backend owns its registration state (an event queue handle, a
//! grow-per-registration event buffer, the fd-to-source map, and on some
//! systems a private timer fd) and exposes the same three operations. The
//! winning implementation is fixed at build time in `mod.rs`; there is no
//! runtime polymorphism across backends.
use std::os::fd::RawFd;
use std::time::Duration;

use nix::sys::time::TimeSpec;

use crate::source::SourceHandle;

/// Nominal wait used in place of an unbounded block, so engine-level
/// termination checks still run periodically when no source has a deadline.
pub const SPIN_FLOOR: Duration = Duration::from_millis(100);

pub trait AsBackend {
    /// Starts readiness tracking for `fd`, owned by `src`. Returns whether
    /// backend state changed; failures are logged at debug level and
    /// swallowed.
    fn register_fd(&mut self, fd: RawFd, src: &SourceHandle) -> bool;

    /// Stops tracking `fd`. Returns whether the fd was known.
    fn unregister_fd(&mut self, fd: RawFd) -> bool;

    /// Waits for readiness up to `timeout` seconds and appends the owning
    /// sources of read-ready fds to `ready`. A zero timeout checks without
    /// blocking; a negative timeout waits the nominal floor. If the
    /// deadline fires with nothing ready, `timeout_src` alone is returned.
    /// Duplicate appearances of one source are not deduplicated.
    fn poll(&mut self, ready: &mut Vec<SourceHandle>, timeout: f64, timeout_src: Option<&SourceHandle>);

    /// Fds currently tracked on behalf of sources. Private bookkeeping fds
    /// (the event queue itself, the loop timer) are not included.
    fn fds(&self) -> Vec<RawFd>;
}

/// Converts a seconds-relative timeout into a timespec for the OS timer or
/// wait call. Negative timeouts become the nominal spin floor rather than
/// an unbounded wait.
pub fn convert_timeout(timeout: f64) -> TimeSpec {
    match Duration::try_from_secs_f64(timeout) {
        Ok(d) => TimeSpec::from_duration(d),
        Err(_) => TimeSpec::from_duration(SPIN_FLOOR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_timeout_splits_into_secs_and_nsecs() {
        let spec = convert_timeout(2.25);
        assert_eq!(spec.tv_sec(), 2);
        assert_eq!(spec.tv_nsec(), 250_000_000);
    }

    #[test]
    fn zero_timeout_is_zero() {
        let spec = convert_timeout(0.0);
        assert_eq!(spec.tv_sec(), 0);
        assert_eq!(spec.tv_nsec(), 0);
    }

    #[test]
    fn negative_timeout_maps_to_spin_floor() {
        let spec = convert_timeout(-1.0);
        assert_eq!(spec.tv_sec(), 0);
        assert_eq!(spec.tv_nsec(), 100_000_000);
    }

    #[test]
    fn nan_timeout_maps_to_spin_floor() {
        let spec = convert_timeout(f64::NAN);
        assert_eq!(spec.tv_sec(), 0);
        assert_eq!(spec.tv_nsec(), 100_000_000);
    }
}
