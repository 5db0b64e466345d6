//! Cooperative cancellation.
//!
//! A process-wide flag, polled at operation boundaries. In-flight byte
//! copies poll it between chunks so an interrupt surfaces promptly.

use keg_core::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Raise the interrupt flag.
pub fn trigger_interrupt() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Clear the interrupt flag.
pub fn reset_interrupt() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Fail with [`Error::Interrupted`] if the flag is raised.
pub fn check_interrupt() -> Result<()> {
    if INTERRUPTED.load(Ordering::SeqCst) {
        Err(Error::Interrupted)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_flag() {
        reset_interrupt();
        assert!(check_interrupt().is_ok());
        trigger_interrupt();
        assert!(matches!(check_interrupt(), Err(Error::Interrupted)));
        reset_interrupt();
        assert!(check_interrupt().is_ok());
    }
}
