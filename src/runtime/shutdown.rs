//! Cancellation token

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set from the signal handler, observed by every `Shutdown`.
static SIGNALLED: AtomicBool = AtomicBool::new(false);

/// Cloneable flag telling run loops to stop at their next tick
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    follow_signals: bool,
}

impl Shutdown {
    /// A token only triggered by `trigger`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also fires on SIGINT/SIGTERM once
    /// `install_signal_handlers` has run.
    pub fn from_signals() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            follow_signals: true,
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || (self.follow_signals && SIGNALLED.load(Ordering::Acquire))
    }
}

#[cfg(unix)]
extern "C" fn on_signal(_signum: libc::c_int) {
    // Only async-signal-safe work here
    SIGNALLED.store(true, Ordering::Release);
}

/// Route SIGINT and SIGTERM to every `Shutdown::from_signals` token.
#[cfg(unix)]
pub fn install_signal_handlers() -> std::io::Result<()> {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for signum in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only stores to an atomic
        let previous = unsafe { libc::signal(signum, handler) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install_signal_handlers() -> std::io::Result<()> {
    Ok(())
}
