//! Defers Ctrl-C / SIGTERM until the engine is between operations.
//!
//! A bucket lock or a half-written snapshot left behind by a hard kill is
//! the kind of mess the whole point of the lock file is to avoid. `main`
//! registers one [`ctrlc`] handler for the process and records that a signal
//! arrived; [`critical_section`] marks a span of code as non-interruptible,
//! and the handler only acts once the depth counter it maintains drops back
//! to zero.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

static DEPTH: AtomicUsize = AtomicUsize::new(0);
static REQUESTED: AtomicBool = AtomicBool::new(false);

/// Installs the process-wide Ctrl-C/SIGTERM handler. Call once, from `main`.
///
/// The handler never exits the process itself — it only raises the
/// `REQUESTED` flag, and lets whichever `critical_section` is active finish
/// first (or, if none is, exits right away, the common case).
pub fn install() -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(|| {
        REQUESTED.store(true, Ordering::SeqCst);
        if DEPTH.load(Ordering::SeqCst) == 0 {
            std::process::exit(130);
        }
    })
}

/// Runs `f` with interruption deferred: if a signal arrives while `f` is
/// running, the process exits immediately after `f` returns rather than
/// mid-way through it. Sections nest.
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = DepthGuard::enter();
    let result = f();

    if REQUESTED.load(Ordering::SeqCst) && DEPTH.load(Ordering::SeqCst) == 1 {
        std::process::exit(130);
    }
    result
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        DEPTH.fetch_add(1, Ordering::SeqCst);
        Self
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both tests touch the shared DEPTH counter, so they're combined into one
    // function to avoid a race against whatever else cargo runs concurrently.
    #[test]
    fn critical_section_returns_value_and_tracks_depth() {
        let before = DEPTH.load(Ordering::SeqCst);

        let value = critical_section(|| {
            let outer = DEPTH.load(Ordering::SeqCst);
            critical_section(|| {
                assert_eq!(DEPTH.load(Ordering::SeqCst), outer + 1);
            });
            assert_eq!(DEPTH.load(Ordering::SeqCst), outer);
            99
        });

        assert_eq!(value, 99);
        assert_eq!(DEPTH.load(Ordering::SeqCst), before);
    }
}
