//! Cancellation for in-flight publishes
//!
//! A [`CancelToken`] is a shared flag polled at every I/O boundary: between
//! export stream reads, before each chunk, before metadata attach and before
//! finalize. Cancelling never touches remote state; the draft record and any
//! acknowledged chunks stay in place for a later resume.
//!
//! The CLI wires SIGINT/SIGTERM to the token: the first signal requests a
//! graceful stop at the next boundary, the second exits immediately.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Exit code for cancelled publishes
pub const EXIT_CODE_CANCELLED: i32 = 80;

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    signal_count: AtomicU8,
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: stop at the next I/O boundary
    InitiateCancellation,
    /// Second signal: exit now
    ImmediateExit,
    /// Third+ signal: ignore
    Ignore,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Record a signal and decide what to do about it.
    pub fn handle_signal(&self) -> SignalAction {
        let count = self.state.signal_count.fetch_add(1, Ordering::SeqCst);
        match count {
            0 => {
                self.cancel();
                SignalAction::InitiateCancellation
            }
            1 => SignalAction::ImmediateExit,
            _ => SignalAction::Ignore,
        }
    }

    /// Install SIGINT/SIGTERM handling for this token. Call once at startup.
    pub fn install_signal_handler(&self) -> Result<(), ctrlc::Error> {
        let token = self.clone();
        ctrlc::set_handler(move || match token.handle_signal() {
            SignalAction::InitiateCancellation => {
                warn!("interrupt received, stopping at the next safe point (draft is kept)");
            }
            SignalAction::ImmediateExit => {
                eprintln!("\nReceived second interrupt, exiting immediately");
                std::process::exit(EXIT_CODE_CANCELLED);
            }
            SignalAction::Ignore => {}
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_signal_sequence() {
        let token = CancelToken::new();
        assert_eq!(token.handle_signal(), SignalAction::InitiateCancellation);
        assert!(token.is_cancelled());
        assert_eq!(token.handle_signal(), SignalAction::ImmediateExit);
        assert_eq!(token.handle_signal(), SignalAction::Ignore);
    }
}
