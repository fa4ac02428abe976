//! Deferred POSIX signal handling.
//!
//! SIGINT and SIGTERM are caught by a handler that only records the signal
//! number; the controller polls between subsystem calls within each tick
//! and raises from a safe point, so window locks and shared-memory keys
//! are released by the normal unwind path.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, Result};

static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signum: libc::c_int) {
    PENDING_SIGNAL.store(signum, Ordering::SeqCst);
}

fn install(signum: libc::c_int, handler: libc::sighandler_t) -> Result<()> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    if unsafe { libc::sigaction(signum, &action, std::ptr::null_mut()) } != 0 {
        return Err(Error::Runtime(format!("sigaction({}) failed", signum)));
    }
    Ok(())
}

/// Installs the deferred handlers; idempotent.
pub fn init() -> Result<()> {
    install(libc::SIGINT, record_signal as libc::sighandler_t)?;
    install(libc::SIGTERM, record_signal as libc::sighandler_t)
}

/// Raises if a fatal signal has been queued since the last check.
pub fn check() -> Result<()> {
    let signum = PENDING_SIGNAL.load(Ordering::SeqCst);
    if signum != 0 {
        return Err(Error::Runtime(format!("killed by signal {}", signum)));
    }
    Ok(())
}

/// Restores the default dispositions and clears any queued signal.
pub fn revert() -> Result<()> {
    PENDING_SIGNAL.store(0, Ordering::SeqCst);
    install(libc::SIGINT, libc::SIG_DFL)?;
    install(libc::SIGTERM, libc::SIG_DFL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_signal_surfaces_at_check() {
        assert!(check().is_ok());
        record_signal(libc::SIGTERM);
        let err = check().unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        assert!(err.to_string().contains("15"));
        revert().unwrap();
        assert!(check().is_ok());
    }
}
