//! Process-wide diagnostics sink.
//!
//! The loop must keep running for the sources that are still healthy, so
//! structural faults at runtime are surfaced as counted warnings rather
//! than aborts. Fatal errors are reserved for unrecoverable configuration
//! problems at startup; internal errors are broken invariants, i.e. bugs.
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{error, warn};

static INTERNAL_WARNINGS: AtomicUsize = AtomicUsize::new(0);
static ERRORS: AtomicUsize = AtomicUsize::new(0);

/// Reports a non-fatal structural fault and keeps going.
pub fn internal_warning(msg: &str) {
    INTERNAL_WARNINGS.fetch_add(1, Ordering::Relaxed);
    warn!("internal warning: {msg}");
}

/// Number of internal warnings reported so far in this process.
pub fn internal_warnings() -> usize {
    INTERNAL_WARNINGS.load(Ordering::Relaxed)
}

/// Reports a recoverable user-visible error.
pub fn error(msg: &str) {
    ERRORS.fetch_add(1, Ordering::Relaxed);
    error!("{msg}");
}

/// Number of errors reported so far in this process.
pub fn errors() -> usize {
    ERRORS.load(Ordering::Relaxed)
}

/// Reports an unrecoverable configuration or startup error and exits.
pub fn fatal_error(msg: &str) -> ! {
    error!("fatal error: {msg}");
    eprintln!("fatal error: {msg}");
    process::exit(1);
}

/// Reports a broken internal invariant.
pub fn internal_error(msg: &str) -> ! {
    error!("internal error: {msg}");
    panic!("internal error: {msg}");
}
