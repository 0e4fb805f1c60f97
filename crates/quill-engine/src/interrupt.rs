//! Interrupt flag checked by long-running work.
//!
//! SIGINT (or an `interrupt` directive) raises the flag. The evaluator polls
//! it between statements and shell escapes kill their child when they see it.

use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

static SIGINT_RAISED: AtomicBool = AtomicBool::new(false);
static INSTALL: Once = Once::new();

#[cfg(unix)]
extern "C" fn on_sigint(_signal: libc::c_int) {
    SIGINT_RAISED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_handler() {
    // SAFETY: the handler only performs an atomic store.
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
}

#[cfg(not(unix))]
fn install_handler() {}

/// Shared, copyable handle to an interrupt flag.
#[derive(Debug, Clone, Copy)]
pub struct InterruptFlag(&'static AtomicBool);

impl InterruptFlag {
    /// Flag raised by SIGINT. Installs the handler on first use.
    pub fn sigint() -> Self {
        INSTALL.call_once(install_handler);
        Self(&SIGINT_RAISED)
    }

    /// A flag nothing but its holders can raise.
    pub fn detached() -> Self {
        Self(Box::leak(Box::new(AtomicBool::new(false))))
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_flags_are_independent() {
        let a = InterruptFlag::detached();
        let b = InterruptFlag::detached();
        a.raise();
        assert!(a.is_raised());
        assert!(!b.is_raised());
        a.clear();
        assert!(!a.is_raised());
    }
}
