//! Scoped interrupt masking
//!
//! Destructive phases (stopping primaries, rewriting configuration) must not
//! be cut short by Ctrl-C. A `SignalMask` guard marks such a phase; the
//! binary's interrupt listener consults `SignalMask::is_masked` and ignores
//! interrupts while any guard is alive. Dropping the last guard restores
//! normal handling, whichever way the guarded scope exits.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Number of live guards across the process
static MASK_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// RAII guard that blocks interrupts while alive
#[derive(Debug)]
#[must_use = "interrupts are only masked while the guard is held"]
pub struct SignalMask {
    _private: (),
}

impl SignalMask {
    /// Mask interrupts until the returned guard is dropped. Guards nest.
    pub fn acquire() -> Self {
        let depth = MASK_DEPTH.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(depth, "Interrupts masked");
        Self { _private: () }
    }

    pub fn is_masked() -> bool {
        MASK_DEPTH.load(Ordering::SeqCst) > 0
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        let previous = MASK_DEPTH.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            debug!("Interrupts restored");
        }
    }
}

/// Resolve on the first Ctrl-C received while no `SignalMask` is held.
/// Interrupts arriving during a masked phase are logged and dropped.
pub async fn unmasked_ctrl_c() -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        if SignalMask::is_masked() {
            warn!("Interrupt ignored while segments are being reconfigured");
            continue;
        }
        return Ok(());
    }
}
