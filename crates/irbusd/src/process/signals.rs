//! Signal handling: handlers deposit a token, the main loop drains it.
//!
//! Handlers do nothing but store the signal number into a single-slot
//! atomic; the loop head consumes the token and runs the real work on the
//! one linear execution thread. The slot is last-wins, which matches the
//! semantics of the handlers it replaces.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use signal_hook::consts::signal::{SIGALRM, SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::low_level;

const EMPTY: usize = 0;

/// Deferred work requested by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalToken {
    /// SIGTERM or SIGINT: shut down.
    Term,
    /// SIGUSR1: clean exit.
    Usr1,
    /// SIGHUP: reopen the log and notify idle clients.
    Hup,
    /// SIGALRM: an externally forced heartbeat tick.
    Alrm,
}

/// The single-slot pending field shared with the signal handlers.
#[derive(Debug, Clone)]
pub struct PendingSignal {
    slot: Arc<AtomicUsize>,
}

impl PendingSignal {
    /// Consumes the pending token, if any.
    pub fn take(&self) -> Option<SignalToken> {
        let raw = self.slot.swap(EMPTY, Ordering::SeqCst) as i32;
        match raw {
            SIGTERM | SIGINT => Some(SignalToken::Term),
            SIGUSR1 => Some(SignalToken::Usr1),
            SIGHUP => Some(SignalToken::Hup),
            SIGALRM => Some(SignalToken::Alrm),
            _ => None,
        }
    }
}

/// Installs handlers for TERM, INT, USR1, HUP and ALRM and returns the
/// shared pending slot.
///
/// # Errors
///
/// Returns the registration error; the daemon cannot run without its
/// signal surface.
pub fn install() -> Result<PendingSignal, io::Error> {
    let slot = Arc::new(AtomicUsize::new(EMPTY));
    for signal in [SIGTERM, SIGINT, SIGUSR1, SIGHUP, SIGALRM] {
        let slot = Arc::clone(&slot);
        // SAFETY: the handler only stores into an atomic, which is
        // async-signal-safe.
        unsafe {
            low_level::register(signal, move || {
                slot.store(signal as usize, Ordering::SeqCst);
            })?;
        }
    }
    Ok(PendingSignal { slot })
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test body: a second install() would also see this test's raises
    // and the assertions would race.
    #[test]
    fn tokens_are_last_wins_and_drained_exactly_once() {
        let pending = install().expect("install");
        assert_eq!(pending.take(), None);

        low_level::raise(SIGALRM).expect("raise");
        assert_eq!(pending.take(), Some(SignalToken::Alrm));
        assert_eq!(pending.take(), None);

        low_level::raise(SIGALRM).expect("raise");
        low_level::raise(SIGHUP).expect("raise");
        assert_eq!(pending.take(), Some(SignalToken::Hup));
        assert_eq!(pending.take(), None);
    }
}
