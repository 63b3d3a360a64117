//! Cooperative interrupt handling.
//!
//! A SIGINT must not kill the process mid-job: the instance still has to
//! be torn down (build tree removed, binds unmounted, container stopped)
//! before exiting 1 with "Interrupted.". The handler therefore only marks
//! an interrupt as pending; the pipeline executor checks the flag at its
//! suspension points and propagates [`LpciError::Interrupted`], which
//! unwinds through the scoped release. A second signal force-exits with
//! the conventional 130.

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;

use crate::error::LpciError;

/// Number of interrupt signals received so far.
static SIGNAL_COUNT: AtomicU32 = AtomicU32::new(0);

/// True once an interrupt is pending.
pub fn interrupted() -> bool {
    SIGNAL_COUNT.load(Ordering::SeqCst) > 0
}

/// Marks an interrupt as pending; returns the previous signal count.
pub fn request_interrupt() -> u32 {
    SIGNAL_COUNT.fetch_add(1, Ordering::SeqCst)
}

/// Clears any pending interrupt (used by tests).
pub fn reset_interrupt() {
    SIGNAL_COUNT.store(0, Ordering::SeqCst);
}

/// Errors with [`LpciError::Interrupted`] if an interrupt is pending.
///
/// Called between the executor's suspension points so a pending interrupt
/// short-circuits the remaining work while teardown still runs.
pub fn check() -> Result<(), LpciError> {
    if interrupted() {
        Err(LpciError::Interrupted)
    } else {
        Ok(())
    }
}

/// Installs the SIGINT handler: the first signal requests cooperative
/// shutdown, a second forces an immediate exit.
pub fn install_handler() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        let previous_count = request_interrupt();
        if previous_count == 0 {
            eprintln!("\nInterrupt received; tearing down. Press Ctrl+C again to force exit.");
        } else {
            // 128 + SIGINT (2)
            std::process::exit(130);
        }
    })
    .context("failed to install the interrupt handler")
}
