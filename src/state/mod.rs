//! Publish state machine implementation
//!
//! A publish walks a fixed chain of steps; see [`PublishState`] for the
//! allowed transitions.

mod publish_state;

pub use publish_state::{PublishMachine, PublishState, PublishStateError, Transition};

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global sequence counter for ordering events within a single process
static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Get the next sequence number for ordering
pub fn next_seq() -> u64 {
    SEQUENCE_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Get current UTC timestamp
pub fn now_rfc3339() -> DateTime<Utc> {
    Utc::now()
}

/// Check if a state is terminal (no further transitions possible)
pub trait TerminalState {
    fn is_terminal(&self) -> bool;
}
