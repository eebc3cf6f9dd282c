//! Connection to the real-time substrate.
//!
//! The substrate is everything this middleware relies on but does not
//! implement: the tmpfs that backs buffer mappings and the monotonic
//! clock that paces periodic runtimes. `Substrate::load()` verifies both
//! and hands back an explicit, cloneable handle that callers thread
//! through every subsequent operation. There is no hidden global; the
//! handle also owns the process-wide shutdown token checked by every
//! service runtime between invocations.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::time::{ClockId, clock_gettime};
use tracing::debug;

use crate::error::{ServiceError, ServiceResult};
use taxel::consts::SHM_DIR;

struct SubstrateInner {
    shutdown: AtomicBool,
}

/// Handle to the loaded real-time substrate.
///
/// Cheap to clone; all clones share the shutdown token.
#[derive(Clone)]
pub struct Substrate {
    inner: Arc<SubstrateInner>,
}

impl Substrate {
    /// Establish the process connection to the real-time substrate.
    ///
    /// Verifies the shared-memory tmpfs and the monotonic clock are
    /// usable. Safe to call more than once; each call returns a fresh
    /// handle with its own shutdown token.
    ///
    /// # Errors
    /// [`ServiceError::SubstrateUnavailable`] if the tmpfs directory is
    /// missing or the clock cannot be read.
    pub fn load() -> ServiceResult<Self> {
        let dir = Path::new(SHM_DIR);
        if !dir.is_dir() {
            return Err(ServiceError::SubstrateUnavailable {
                reason: format!("{SHM_DIR} is not a directory"),
            });
        }

        // A clock that cannot be read now will not start reading later.
        clock_gettime(ClockId::CLOCK_MONOTONIC).map_err(|e| {
            ServiceError::SubstrateUnavailable {
                reason: format!("CLOCK_MONOTONIC unreadable: {e}"),
            }
        })?;

        debug!("substrate loaded ({SHM_DIR})");
        Ok(Self {
            inner: Arc::new(SubstrateInner {
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Current monotonic time [ns].
    pub fn now_ns(&self) -> u64 {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
            // The clock was verified at load(); a failure here means the
            // process is in a state where timing no longer matters.
            Err(_) => 0,
        }
    }

    /// Request cooperative shutdown of every runtime using this handle.
    pub fn request_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    #[inline]
    pub fn is_shutdown_requested(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_succeeds_on_linux() {
        let substrate = Substrate::load().expect("substrate should load");
        assert!(!substrate.is_shutdown_requested());
    }

    #[test]
    fn clock_is_monotonic() {
        let substrate = Substrate::load().unwrap();
        let a = substrate.now_ns();
        let b = substrate.now_ns();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn shutdown_token_is_shared_across_clones() {
        let substrate = Substrate::load().unwrap();
        let clone = substrate.clone();
        substrate.request_shutdown();
        assert!(clone.is_shutdown_requested());
    }

    #[test]
    fn load_is_repeatable() {
        let a = Substrate::load().unwrap();
        let b = Substrate::load().unwrap();
        a.request_shutdown();
        // Independent handles have independent tokens.
        assert!(!b.is_shutdown_requested());
    }
}
